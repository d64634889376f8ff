//! Playground controller
//!
//! One [`Playground`] drives one widget on the page: a root element carrying
//! a `data-test` attribute, a run button (`.Playground-Run`) and a log region
//! (`.Playground-Log`). The controller walks the lifecycle
//!
//! ```text
//! Setup ──(setup done)──▶ Ready ──run()──▶ Running ──(finished)──▶ Ready
//! ```
//!
//! and mirrors it into presentation classes on the root element.
//!
//! Everything runs on one thread. The controller only yields while its
//! setup hook runs and while it awaits the test procedure; a run request
//! that arrives in any state other than [`State::Ready`] is dropped.
//!
//! ```
//! use futures::executor::LocalPool;
//! use kernel_playground::dom::Element;
//! use kernel_playground::playground::{Playground, RunResult, State};
//! use kernel_playground::registry::TestRegistry;
//! use std::rc::Rc;
//!
//! let registry = Rc::new(TestRegistry::new());
//! registry.register("echo", |playground| async move {
//!     playground.print("hello");
//!     Ok(())
//! });
//!
//! let widget = Element::new("div")
//!     .with_class("Playground")
//!     .with_attribute("data-test", "echo")
//!     .with_child(Element::new("button").with_class("Playground-Run"))
//!     .with_child(Element::new("div").with_class("Playground-Log"));
//!
//! let mut pool = LocalPool::new();
//! let playground = Playground::new(widget, registry, pool.spawner()).unwrap();
//! pool.run_until_stalled();
//! assert_eq!(playground.state(), State::Ready);
//!
//! let result = pool.run_until(playground.run());
//! assert_eq!(result, Some(RunResult::Success));
//! assert_eq!(playground.log_text(), "hello\n");
//! ```

use crate::dom::{self, Element};
use crate::error::Result;
use crate::registry::{TestFailure, TestRegistry};
use futures::channel::oneshot;
use futures::future::{self, FutureExt, LocalBoxFuture};
use futures::task::{LocalSpawn, LocalSpawnExt};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::{debug, info, warn};

/// Widget root class; also the selector used to discover widgets.
pub const WIDGET_CLASS: &str = "Playground";
/// Run button class.
pub const RUN_BUTTON_CLASS: &str = "Playground-Run";
/// Log region class.
pub const LOG_CLASS: &str = "Playground-Log";
/// Widget attribute naming the bound test (read as `data-test`).
pub const TEST_DATA_KEY: &str = "test";

const STATE_SETUP_CLASS: &str = "Playground-state-setup";
const STATE_READY_CLASS: &str = "Playground-state-ready";
const STATE_RUNNING_CLASS: &str = "Playground-state-running";
const RESULT_SUCCESS_CLASS: &str = "Playground-result-success";
const RESULT_FAILED_CLASS: &str = "Playground-result-failed";

// ---------------------------------------------------------------------------
// State / RunResult
// ---------------------------------------------------------------------------

/// Lifecycle state of a playground.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    /// Waiting for the setup hook; the run button is disabled.
    Setup,
    /// Accepting run requests.
    Ready,
    /// A test is in flight.
    Running,
}

impl State {
    /// Presentation class reflecting this state.
    pub fn class_name(self) -> &'static str {
        match self {
            State::Setup => STATE_SETUP_CLASS,
            State::Ready => STATE_READY_CLASS,
            State::Running => STATE_RUNNING_CLASS,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Setup => write!(f, "setup"),
            State::Ready => write!(f, "ready"),
            State::Running => write!(f, "running"),
        }
    }
}

/// Outcome of the most recent completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunResult {
    /// Never run.
    None,
    Success,
    Failed,
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunResult::None => write!(f, "none"),
            RunResult::Success => write!(f, "success"),
            RunResult::Failed => write!(f, "failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Playground
// ---------------------------------------------------------------------------

/// Future produced by a setup hook.
pub type SetupFuture = LocalBoxFuture<'static, std::result::Result<(), TestFailure>>;

/// Resolves when an accepted run finishes (`Some(result)`), or immediately
/// with `None` when the request was ignored.
pub type RunHandle = LocalBoxFuture<'static, Option<RunResult>>;

struct Inner {
    base: Element,
    run_button: Element,
    log: Element,
    test_id: String,
    registry: Rc<TestRegistry>,
    spawner: Rc<dyn LocalSpawn>,
    state: Cell<State>,
    result: Cell<RunResult>,
    runs: Cell<u64>,
    setup_error: RefCell<Option<TestFailure>>,
}

/// Controller bound to one widget and one test identifier.
///
/// Cloning yields another handle to the same controller; test procedures
/// receive such a handle so they can [`print`](Playground::print).
#[derive(Clone)]
pub struct Playground {
    inner: Rc<Inner>,
}

impl fmt::Debug for Playground {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Playground")
            .field("test_id", &self.inner.test_id)
            .field("state", &self.state())
            .field("result", &self.result())
            .finish()
    }
}

impl Playground {
    /// Bind a controller to `base` with a no-op setup.
    pub fn new(
        base: Element,
        registry: Rc<TestRegistry>,
        spawner: impl LocalSpawn + 'static,
    ) -> Result<Self> {
        Self::with_setup(base, registry, spawner, future::ok(()).boxed_local())
    }

    /// Bind a controller to `base`; it becomes ready once `setup` resolves
    /// successfully. A failing setup leaves the controller in
    /// [`State::Setup`] for good.
    ///
    /// Fails when the widget lacks its run button or log region, or when the
    /// spawner no longer accepts tasks.
    pub fn with_setup(
        base: Element,
        registry: Rc<TestRegistry>,
        spawner: impl LocalSpawn + 'static,
        setup: SetupFuture,
    ) -> Result<Self> {
        let run_button = dom::find_required(&base, &format!(".{}", RUN_BUTTON_CLASS))?;
        let log = dom::find_required(&base, &format!(".{}", LOG_CLASS))?;
        let test_id = base.data(TEST_DATA_KEY).unwrap_or_default();

        let playground = Self {
            inner: Rc::new(Inner {
                base,
                run_button,
                log,
                test_id,
                registry,
                spawner: Rc::new(spawner),
                state: Cell::new(State::Setup),
                result: Cell::new(RunResult::None),
                runs: Cell::new(0),
                setup_error: RefCell::new(None),
            }),
        };
        playground.set_state(State::Setup);

        let weak = Rc::downgrade(&playground.inner);
        playground
            .inner
            .run_button
            .add_click_listener(move || on_run_button_click(&weak));

        let this = playground.clone();
        playground.inner.spawner.spawn_local(async move {
            match setup.await {
                Ok(()) => this.set_state(State::Ready),
                Err(failure) => {
                    warn!(test = %this.inner.test_id, %failure, "playground setup failed");
                    *this.inner.setup_error.borrow_mut() = Some(failure);
                }
            }
        })?;

        debug!(test = %playground.inner.test_id, "playground bound");
        Ok(playground)
    }

    pub fn state(&self) -> State {
        self.inner.state.get()
    }

    pub fn result(&self) -> RunResult {
        self.inner.result.get()
    }

    /// Identifier read from the widget's `data-test` attribute.
    pub fn test_id(&self) -> &str {
        &self.inner.test_id
    }

    /// The widget root element.
    pub fn element(&self) -> &Element {
        &self.inner.base
    }

    /// Everything printed to the log region so far.
    pub fn log_text(&self) -> String {
        self.inner.log.text()
    }

    /// Number of runs that have finished.
    pub fn completed_runs(&self) -> u64 {
        self.inner.runs.get()
    }

    /// The failure reported by the setup hook, if it failed.
    pub fn setup_error(&self) -> Option<TestFailure> {
        self.inner.setup_error.borrow().clone()
    }

    /// Append `text` and a newline to the log region.
    pub fn print(&self, text: impl AsRef<str>) {
        let mut line = String::from(text.as_ref());
        line.push('\n');
        self.inner.log.append_text(&line);
    }

    /// Run the bound test.
    ///
    /// Ignored unless the controller is [`State::Ready`]. Otherwise the
    /// transition to [`State::Running`] and the registry lookup happen
    /// before this returns, and the procedure is scheduled on the spawner.
    /// The run completes whether or not the returned handle is awaited.
    pub fn run(&self) -> RunHandle {
        if self.state() != State::Ready {
            debug!(test = %self.inner.test_id, state = %self.state(), "run request ignored");
            return future::ready(None).boxed_local();
        }
        self.set_state(State::Running);
        info!(test = %self.inner.test_id, "running test");

        let Some(procedure) = self.inner.registry.lookup(&self.inner.test_id) else {
            let result = self.finish(Err(TestFailure::not_found(&self.inner.test_id)));
            return future::ready(Some(result)).boxed_local();
        };

        let test = procedure(self.clone());
        let this = self.clone();
        let (sender, receiver) = oneshot::channel();
        let spawned = self.inner.spawner.spawn_local(async move {
            let outcome = test.await;
            let _ = sender.send(this.finish(outcome));
        });

        match spawned {
            Ok(()) => receiver.map(|result| result.ok()).boxed_local(),
            Err(err) => {
                let failure = TestFailure::new(format!("Test could not be scheduled: {}", err));
                future::ready(Some(self.finish(Err(failure)))).boxed_local()
            }
        }
    }

    fn set_state(&self, state: State) {
        let inner = &self.inner;
        inner.run_button.set_disabled(state != State::Ready);
        for candidate in [State::Setup, State::Ready, State::Running] {
            inner
                .base
                .toggle_class(candidate.class_name(), candidate == state);
        }
        inner.state.set(state);
        debug!(test = %inner.test_id, %state, "playground state changed");
    }

    fn finish(&self, outcome: std::result::Result<(), TestFailure>) -> RunResult {
        let result = match &outcome {
            Ok(()) => RunResult::Success,
            Err(_) => RunResult::Failed,
        };
        let base = &self.inner.base;
        base.toggle_class(RESULT_SUCCESS_CLASS, result == RunResult::Success);
        base.toggle_class(RESULT_FAILED_CLASS, result == RunResult::Failed);

        match outcome {
            Ok(()) => info!(test = %self.inner.test_id, "test passed"),
            Err(failure) => {
                warn!(test = %self.inner.test_id, %failure, "test failed");
                if let Some(message) = failure.message() {
                    self.print(message);
                }
            }
        }

        self.set_state(State::Ready);
        self.inner.result.set(result);
        self.inner.runs.set(self.inner.runs.get() + 1);
        result
    }
}

fn on_run_button_click(weak: &Weak<Inner>) {
    if let Some(inner) = weak.upgrade() {
        // The run proceeds on the spawner; the click has nothing to await.
        drop(Playground { inner }.run());
    }
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

/// Bind a controller to every widget under `root`, in document order.
///
/// Stops at the first malformed widget.
pub fn bootstrap<S>(root: &Element, registry: &Rc<TestRegistry>, spawner: &S) -> Result<Vec<Playground>>
where
    S: LocalSpawn + Clone + 'static,
{
    let widgets = dom::find_all(root, &format!(".{}", WIDGET_CLASS));
    let playgrounds = widgets
        .into_iter()
        .map(|widget| Playground::new(widget, Rc::clone(registry), spawner.clone()))
        .collect::<Result<Vec<_>>>()?;
    info!(count = playgrounds.len(), "playgrounds bound");
    Ok(playgrounds)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Page configuration and runtime
//!
//! A page is a [`Document`] holding one widget per configured test, the
//! controllers bound to those widgets, and the single-threaded executor
//! they all share. [`PageConfig`] describes the page; [`Page`] owns it
//! while it runs; [`PageReport`] is what a run leaves behind.

use crate::dom::{self, Document, Element};
use crate::error::Result;
use crate::gpu::ComputeLimits;
use crate::playground::{
    self, Playground, RunResult, State, LOG_CLASS, RUN_BUTTON_CLASS, WIDGET_CLASS,
};
use crate::registry::TestRegistry;
use crate::smoke;
use futures::executor::LocalPool;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::rc::Rc;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// PageConfig
// ---------------------------------------------------------------------------

/// One widget on the page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetConfig {
    /// Bound test identifier; a widget without one binds the empty id.
    #[serde(default)]
    pub test: Option<String>,
    /// Heading shown above the widget; defaults to the test id.
    #[serde(default)]
    pub title: Option<String>,
}

impl WidgetConfig {
    pub fn for_test(test: impl Into<String>) -> Self {
        Self {
            test: Some(test.into()),
            title: None,
        }
    }
}

/// Page description, usually read from JSON.
///
/// ```json
/// {
///   "title": "Copy kernels",
///   "limits": { "thread_execution_width": 32 },
///   "playgrounds": [{ "test": "copy_kernel" }, { "test": "memory_barrier" }]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageConfig {
    pub title: String,
    pub limits: ComputeLimits,
    pub playgrounds: Vec<WidgetConfig>,
}

impl Default for PageConfig {
    fn default() -> Self {
        Self::for_tests(smoke::TEST_IDS)
    }
}

impl PageConfig {
    /// A page with one widget per id, in order.
    pub fn for_tests<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            title: "Kernel Playground".to_string(),
            limits: ComputeLimits::default(),
            playgrounds: ids.into_iter().map(WidgetConfig::for_test).collect(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "page config read");
        Self::from_json(&text)
    }
}

/// Build the page markup for `config`.
///
/// Each widget is a `div.Playground` carrying `data-test`, with a heading,
/// a run button and an empty log region.
pub fn build_document(config: &PageConfig) -> Document {
    let document = Document::new();
    let body = document.body();
    body.append_child(Element::new("h1").with_text(config.title.clone()));
    for widget in &config.playgrounds {
        let test = widget.test.clone().unwrap_or_default();
        let title = widget.title.clone().unwrap_or_else(|| test.clone());
        let mut root = Element::new("div").with_class(WIDGET_CLASS);
        if widget.test.is_some() {
            root = root.with_attribute("data-test", test);
        }
        body.append_child(
            root.with_child(Element::new("h2").with_text(title))
                .with_child(
                    Element::new("button")
                        .with_class(RUN_BUTTON_CLASS)
                        .with_text("Run"),
                )
                .with_child(Element::new("div").with_class(LOG_CLASS)),
        );
    }
    document
}

// ---------------------------------------------------------------------------
// Page
// ---------------------------------------------------------------------------

/// A loaded page: document, controllers and their executor.
pub struct Page {
    pool: LocalPool,
    document: Document,
    title: String,
    playgrounds: Vec<Playground>,
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("title", &self.title)
            .field("playgrounds", &self.playgrounds)
            .finish()
    }
}

impl Page {
    /// Bind every widget of `document` and let their setup settle.
    pub fn load(document: Document, registry: Rc<TestRegistry>) -> Result<Self> {
        let mut pool = LocalPool::new();
        let playgrounds = playground::bootstrap(document.body(), &registry, &pool.spawner())?;
        pool.run_until_stalled();
        let title = dom::find_all(document.body(), "h1")
            .first()
            .map(Element::text)
            .unwrap_or_default();
        info!(title = %title, widgets = playgrounds.len(), "page loaded");
        Ok(Self {
            pool,
            document,
            title,
            playgrounds,
        })
    }

    /// Build and load the page described by `config`.
    pub fn from_config(config: &PageConfig, registry: Rc<TestRegistry>) -> Result<Self> {
        Self::load(build_document(config), registry)
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn playgrounds(&self) -> &[Playground] {
        &self.playgrounds
    }

    /// Click every run button, then drive the executor until nothing can
    /// make progress.
    pub fn run_all(&mut self) {
        let selector = format!(".{}", RUN_BUTTON_CLASS);
        for playground in &self.playgrounds {
            for button in dom::find_all(playground.element(), &selector) {
                button.click();
            }
        }
        self.pool.run_until_stalled();
    }

    /// Run widget `index` and drive the executor until nothing can make
    /// progress.
    ///
    /// `None` when there is no such widget, the request was ignored, or the
    /// test has not finished by the time the executor stalls.
    pub fn run(&mut self, index: usize) -> Option<RunResult> {
        let handle = self.playgrounds.get(index)?.run();
        self.pool.run_until_stalled();
        handle.now_or_never().flatten()
    }

    /// Drive pending work without starting anything new.
    pub fn settle(&mut self) {
        self.pool.run_until_stalled();
    }

    pub fn report(&self) -> PageReport {
        let widgets: Vec<WidgetReport> = self
            .playgrounds
            .iter()
            .map(|playground| WidgetReport {
                test: playground.test_id().to_string(),
                state: playground.state(),
                result: playground.result(),
                runs: playground.completed_runs(),
                log: playground.log_text().lines().map(str::to_string).collect(),
            })
            .collect();
        let count = |result: RunResult| widgets.iter().filter(|w| w.result == result).count();
        PageReport {
            title: self.title.clone(),
            total: widgets.len(),
            passed: count(RunResult::Success),
            failed: count(RunResult::Failed),
            not_run: count(RunResult::None),
            widgets,
        }
    }
}

// ---------------------------------------------------------------------------
// PageReport
// ---------------------------------------------------------------------------

/// Final state of one widget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WidgetReport {
    pub test: String,
    pub state: State,
    pub result: RunResult,
    pub runs: u64,
    /// Log region contents, one entry per line.
    pub log: Vec<String>,
}

/// Summary of a page after a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageReport {
    pub title: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Widgets without a completed run.
    pub not_run: usize,
    pub widgets: Vec<WidgetReport>,
}

impl PageReport {
    /// Every widget has run and passed.
    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for PageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        writeln!(f, "  {}", self.title)?;
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;

        for widget in &self.widgets {
            let icon = match widget.result {
                RunResult::Success => "✓",
                RunResult::Failed => "✗",
                RunResult::None => "○",
            };
            if widget.state == State::Ready {
                writeln!(f, "\n  {} {}", icon, widget.test)?;
            } else {
                writeln!(f, "\n  {} {} ({})", icon, widget.test, widget.state)?;
            }
            for line in &widget.log {
                writeln!(f, "      {}", line)?;
            }
        }

        writeln!(f, "\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        writeln!(
            f,
            "  Total: {}  Passed: {}  Failed: {}  Not run: {}",
            self.total, self.passed, self.failed, self.not_run
        )?;
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Test registry
//!
//! Maps a test identifier to the asynchronous procedure that implements it.
//! The registry is constructed once by the host and shared (as
//! `Rc<TestRegistry>`) with every [`Playground`]; anyone holding it may add
//! tests, and controllers only ever look them up.
//!
//! ```
//! use kernel_playground::registry::TestRegistry;
//!
//! let registry = TestRegistry::new();
//! registry.register("echo", |playground| async move {
//!     playground.print("hello");
//!     Ok(())
//! });
//! assert!(registry.contains("echo"));
//! assert!(registry.lookup("missing").is_none());
//! ```

use crate::playground::Playground;
use futures::future::{FutureExt, LocalBoxFuture};
use rustc_hash::FxHashMap as HashMap;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use tracing::debug;

// ---------------------------------------------------------------------------
// TestFailure
// ---------------------------------------------------------------------------

/// Why a test run failed.
///
/// The message is optional: a failure without one marks the widget failed
/// and writes nothing to its log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestFailure {
    message: Option<String>,
}

impl TestFailure {
    /// Failure carrying a human-readable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
        }
    }

    /// Failure with no message.
    pub fn silent() -> Self {
        Self { message: None }
    }

    /// Failure reported when no procedure is registered under `test_id`.
    pub fn not_found(test_id: &str) -> Self {
        Self::new(format!("Test '{}' is not found.", test_id))
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for TestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => f.write_str(message),
            None => f.write_str("<no message>"),
        }
    }
}

impl<E: std::error::Error> From<E> for TestFailure {
    fn from(err: E) -> Self {
        Self::new(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// TestRegistry
// ---------------------------------------------------------------------------

/// Future returned by a test procedure.
pub type TestFuture = LocalBoxFuture<'static, Result<(), TestFailure>>;

/// A registered test: receives the playground that runs it (for output)
/// and resolves once the test is done.
pub type TestProcedure = Rc<dyn Fn(Playground) -> TestFuture>;

/// Identifier → procedure table.
#[derive(Default)]
pub struct TestRegistry {
    tests: RefCell<HashMap<String, TestProcedure>>,
}

impl fmt::Debug for TestRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestRegistry")
            .field("tests", &self.ids())
            .finish()
    }
}

impl TestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `procedure` under `test_id`, replacing any earlier entry.
    pub fn register<F, Fut>(&self, test_id: impl Into<String>, procedure: F)
    where
        F: Fn(Playground) -> Fut + 'static,
        Fut: Future<Output = Result<(), TestFailure>> + 'static,
    {
        let procedure: TestProcedure = Rc::new(move |playground| procedure(playground).boxed_local());
        self.register_procedure(test_id, procedure);
    }

    /// Register an already boxed procedure.
    pub fn register_procedure(&self, test_id: impl Into<String>, procedure: TestProcedure) {
        let test_id = test_id.into();
        let replaced = self.tests.borrow_mut().insert(test_id.clone(), procedure);
        if replaced.is_some() {
            debug!(test = %test_id, "test registration replaced");
        } else {
            debug!(test = %test_id, "test registered");
        }
    }

    /// Procedure registered under `test_id`, if any.
    pub fn lookup(&self, test_id: &str) -> Option<TestProcedure> {
        self.tests.borrow().get(test_id).cloned()
    }

    pub fn contains(&self, test_id: &str) -> bool {
        self.tests.borrow().contains_key(test_id)
    }

    pub fn len(&self) -> usize {
        self.tests.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.borrow().is_empty()
    }

    /// Registered identifiers, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tests.borrow().keys().cloned().collect();
        ids.sort();
        ids
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

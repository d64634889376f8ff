//! Prelude module for convenient imports
//!
//! ```
//! use kernel_playground::prelude::*;
//!
//! let registry = TestRegistry::new();
//! registry.register("noop", |_| async { Ok(()) });
//! assert_eq!(registry.ids(), vec!["noop"]);
//! ```

// Errors
pub use crate::error::{Error, Result};

// Controller and registry
pub use crate::playground::{bootstrap, Playground, RunHandle, RunResult, State};
pub use crate::registry::{TestFailure, TestProcedure, TestRegistry};

// Page markup
pub use crate::dom::{Document, Element, Selector};

// Compute
pub use crate::gpu::{ComputeContext, ComputeHost, ComputeLimits, GpuError, KernelSource, Size};
pub use crate::smoke;

// Hosting
pub use crate::page::{build_document, Page, PageConfig, PageReport};

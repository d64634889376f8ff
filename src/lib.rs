//! Kernel Playground: interactive smoke tests for GPU compute kernels
//!
//! A playground page hosts one widget per test. Each widget has a run
//! button and a log region and is driven by a [`Playground`] controller
//! that looks its test up in a shared [`TestRegistry`], runs it on a
//! single-threaded executor, and reflects the lifecycle (setup, ready,
//! running) and the last outcome (success, failed) as presentation classes
//! on the widget.
//!
//! The stock tests in [`smoke`] drive a CPU-backed rendition of the
//! experimental browser compute API found in [`gpu`].
//!
//! # Quick Start
//!
//! ```
//! use kernel_playground::prelude::*;
//! use std::rc::Rc;
//!
//! fn main() -> Result<()> {
//!     let registry = Rc::new(TestRegistry::new());
//!     smoke::register_all(&registry, &ComputeHost::simulated());
//!
//!     let config = PageConfig::for_tests(["copy_kernel", "memory_barrier"]);
//!     let mut page = Page::from_config(&config, registry)?;
//!     page.run_all();
//!     assert!(page.report().all_passed());
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Core** | [`playground`], [`registry`], [`dom`], [`error`](Error) |
//! | **Compute** | [`gpu`], [`smoke`] |
//! | **Hosting** | [`page`] |
#![allow(clippy::new_without_default)]
#![allow(clippy::needless_range_loop)]

pub mod dom;
pub mod gpu;
pub mod page;
pub mod playground;
pub mod prelude;
pub mod registry;
pub mod smoke;

mod error;

pub use error::{Error, Result};
pub use playground::{Playground, RunResult, State};
pub use registry::{TestFailure, TestRegistry};

/// Version of the kernel playground
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

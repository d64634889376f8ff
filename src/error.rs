//! Error types for the kernel playground
//!
//! Only construction-time and configuration problems are represented here.
//! A test that fails at run time is reported through
//! [`TestFailure`](crate::registry::TestFailure) and never becomes an
//! [`Error`].

use thiserror::Error;

/// Main error type for the kernel playground
#[derive(Error, Debug)]
pub enum Error {
    /// A required element is missing from a widget or page.
    ///
    /// The message matches what the page shows for a malformed widget.
    #[error("{selector} is not found.")]
    ElementNotFound { selector: String },

    /// A selector string could not be parsed
    #[error("SelectorError: invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    /// The executor refused a task (it has been shut down)
    #[error("SpawnError: {0}")]
    Spawn(String),

    /// Page configuration could not be decoded
    #[error("PageConfigError: {source}")]
    PageConfig {
        #[from]
        source: serde_json::Error,
    },

    /// IO error
    #[error("IOError: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    /// Shorthand for [`Error::ElementNotFound`].
    pub fn element_not_found(selector: impl Into<String>) -> Self {
        Error::ElementNotFound {
            selector: selector.into(),
        }
    }

    /// Shorthand for [`Error::InvalidSelector`].
    pub fn invalid_selector(selector: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidSelector {
            selector: selector.into(),
            reason: reason.into(),
        }
    }
}

impl From<futures::task::SpawnError> for Error {
    fn from(err: futures::task::SpawnError) -> Self {
        Error::Spawn(err.to_string())
    }
}

/// Result type alias for playground operations
pub type Result<T> = std::result::Result<T, Error>;

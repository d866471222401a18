use std::sync::Arc;

use thiserror::Error;

/// Result type for fallible switch SDK operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by client setup and lifecycle operations.
///
/// Switch evaluation never returns an `Error`. Faults during evaluation close the switch (it
/// evaluates to `false`) and are recorded in the [`Session`](crate::Session) instead.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A required client option was left empty.
    #[error("{0} must be provided")]
    MissingOption(&'static str),

    /// The configured domain is not a valid URL.
    #[error("invalid domain configuration")]
    InvalidDomain(#[source] url::ParseError),

    /// A duration string could not be parsed.
    #[error("invalid duration {value:?}: {reason}")]
    InvalidDuration {
        /// The rejected input.
        value: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A factor was registered without a name or description.
    #[error("invalid factor registration: {0}")]
    InvalidFactor(&'static str),

    /// The client has been shut down and cannot be started again.
    #[error("client has been shut down")]
    ShutDown,

    /// The update source failed to start.
    #[error("update source failed: {0}")]
    UpdateSource(String),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

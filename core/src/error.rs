//! Error types shared across the engine.
//!
//! - [`ValidationError`]: a query could not be turned into a [`Request`](crate::request::Request)
//! - [`PipelineError`]: the plugin pipeline was misconfigured or misused during setup
//! - [`FetchError`]: a producer failed; stored in the cache entry of a failed request

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Error returned when building a request from a query value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Queries must be JSON objects.
    #[error("query must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// Errors raised while composing or wiring the plugin pipeline.
///
/// These are programmer errors. They are reported synchronously when the
/// pipeline is built and are never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// A plugin reported an empty (or blank) name.
    #[error("plugin at position {index} has an empty name")]
    EmptyName {
        /// Position of the offending plugin in the list
        index: usize,
    },

    /// Two plugins share the same name.
    #[error("duplicate plugin name `{0}`")]
    DuplicateName(String),

    /// A plugin emitted an operation before the pipeline was wired.
    #[error("plugin `{plugin}` emitted an operation during setup")]
    Setup {
        /// Name of the plugin that emitted
        plugin: String,
    },

    /// The pipeline an emitter belongs to has been dropped.
    #[error("pipeline has been dropped")]
    Detached,
}

/// A producer failure.
///
/// Wraps an [`anyhow::Error`] behind an `Arc` so the same failure can be
/// stored in the cache and handed to every listener.
///
/// # Examples
///
/// ```
/// use fetchline_core::FetchError;
///
/// let err = FetchError::msg("upstream timed out");
/// let copy = err.clone();
/// assert_eq!(err, copy);
/// assert_eq!(err.to_string(), "upstream timed out");
/// ```
#[derive(Clone)]
pub struct FetchError(Arc<anyhow::Error>);

impl FetchError {
    /// Wrap any standard error.
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(anyhow::Error::new(error)))
    }

    /// Build an error from a message.
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self(Arc::new(anyhow::Error::msg(message)))
    }

    /// Access the underlying [`anyhow::Error`].
    #[must_use]
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl From<anyhow::Error> for FetchError {
    fn from(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl fmt::Debug for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

// Two errors are equal when they are the same shared failure.
impl PartialEq for FetchError {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_clone_is_equal() {
        let err = FetchError::msg("boom");
        assert_eq!(err.clone(), err);
    }

    #[test]
    fn test_distinct_fetch_errors_are_not_equal() {
        assert_ne!(FetchError::msg("boom"), FetchError::msg("boom"));
    }

    #[test]
    fn test_fetch_error_wraps_std_error() {
        let io = std::io::Error::other("disk gone");
        let err = FetchError::new(io);
        assert_eq!(err.to_string(), "disk gone");
        assert!(err.inner().downcast_ref::<std::io::Error>().is_some());
    }

    #[test]
    fn test_pipeline_error_messages() {
        assert_eq!(
            PipelineError::DuplicateName("fetch".into()).to_string(),
            "duplicate plugin name `fetch`"
        );
        assert_eq!(
            PipelineError::EmptyName { index: 2 }.to_string(),
            "plugin at position 2 has an empty name"
        );
    }
}

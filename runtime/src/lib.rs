//! # Fetchline Runtime
//!
//! The client that drives the Fetchline request lifecycle.
//!
//! ## Core Components
//!
//! - **Client**: owns the request store, the listener registry, prefetch
//!   bookkeeping and the idle-eviction timers ([`client`])
//! - **Fetch plugin**: starts producers and deduplicates in-flight requests
//!   ([`fetch`])
//! - **Retry plugin**: refetches failed requests with exponential backoff
//!   ([`retry`])
//! - **Tracing plugin**: logs every operation ([`inspect`])
//!
//! ## Example
//!
//! ```no_run
//! use fetchline_core::{Producer, Request, build_request};
//! use fetchline_runtime::{Client, FetchContext};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::builder(|request: &Request, _ctx: &FetchContext| {
//!     let query = request.query().clone();
//!     Producer::future(async move { Ok::<_, anyhow::Error>(json!({ "echo": query })) })
//! })
//! .max_age(Duration::from_secs(60))
//! .build()?;
//!
//! let request = build_request(json!({ "todos": true }))?;
//! let mut handle = client.subscribe(&request, |result| {
//!     println!("{}: {:?}", result.status, result.data);
//! });
//!
//! // ... later
//! handle.unsubscribe();
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

/// Client orchestrator and request handles
pub mod client;

/// The fetch plugin and the fetcher trait
pub mod fetch;

/// Logging middleware
pub mod inspect;

/// Lifecycle counters
pub mod metrics;

/// Retry plugin with exponential backoff
pub mod retry;

pub use client::{Client, ClientBuilder, Listener, ListenerId, RequestHandle};
pub use error::ClientError;
pub use fetch::{FetchContext, FetchPlugin, Fetcher};
pub use inspect::TracingPlugin;
pub use retry::{RetryPlugin, RetryPolicy};

/// Error types for the client
pub mod error {
    use fetchline_core::{PipelineError, RequestId, Status};
    use thiserror::Error;

    /// Errors returned by the client.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum ClientError {
        /// The plugin pipeline could not be built.
        #[error("Pipeline setup failed: {0}")]
        Pipeline(#[from] PipelineError),

        /// `refetch` was called on a request that has not settled.
        ///
        /// Only returned in debug mode; otherwise the call is ignored.
        #[error("Cannot refetch `{id}` while it is {status}")]
        RefetchUnsettled {
            /// Target request
            id: RequestId,
            /// Status at the time of the call
            status: Status,
        },

        /// `fetch_more` was called while no further value can be pulled.
        ///
        /// Only returned in debug mode; otherwise the call is ignored.
        #[error("No more results for `{id}` while it is {status}")]
        NoMoreResults {
            /// Target request
            id: RequestId,
            /// Status at the time of the call
            status: Status,
        },
    }
}

/// Configuration for a [`Client`].
///
/// # Example
///
/// ```
/// use fetchline_runtime::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig::default()
///     .with_max_age(Duration::from_secs(5))
///     .with_debug(true);
/// assert!(config.debug);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// How long an entry without listeners stays cached
    pub max_age: Duration,
    /// Report usage-invariant violations as errors instead of ignoring them
    pub debug: bool,
}

impl ClientConfig {
    /// Create a new configuration with custom values
    #[must_use]
    pub const fn new(max_age: Duration, debug: bool) -> Self {
        Self { max_age, debug }
    }

    /// Set the idle eviction delay
    #[must_use]
    pub const fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Enable or disable debug mode
    #[must_use]
    pub const fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(30),
            debug: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fetchline_core::Status;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.max_age, Duration::from_secs(30));
        assert!(!config.debug);
    }

    #[test]
    fn test_config_builders() {
        let config = ClientConfig::new(Duration::from_millis(1), false)
            .with_max_age(Duration::from_millis(10))
            .with_debug(true);
        assert_eq!(config, ClientConfig::new(Duration::from_millis(10), true));
    }

    #[test]
    fn test_error_messages() {
        let err = ClientError::RefetchUnsettled {
            id: "todos".into(),
            status: Status::Pending,
        };
        assert_eq!(err.to_string(), "Cannot refetch `todos` while it is pending");

        let err = ClientError::from(fetchline_core::PipelineError::DuplicateName("fetch".into()));
        assert_eq!(err.to_string(), "Pipeline setup failed: duplicate plugin name `fetch`");
    }
}

//! Retrying failed requests with exponential backoff.
//!
//! [`RetryPlugin`] sits in front of the fetch plugin. When a `Reject` reaches
//! it and the [`RetryPolicy`] still allows another attempt, the failure is
//! swallowed (the request stays `pending`) and a fresh `Fetch` is emitted
//! after the backoff delay. Once attempts run out the `Reject` goes through
//! and the request fails as usual.
//!
//! # Example
//!
//! ```rust
//! use fetchline_runtime::retry::{RetryPlugin, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::builder()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .multiplier(2.0)
//!     .jitter(true)
//!     .build();
//!
//! let plugin = RetryPlugin::new(policy)
//!     .retry_if(|error| !error.to_string().contains("not found"));
//! # let _ = plugin;
//! ```

use crate::metrics::RetryMetrics;
use fetchline_core::{
    Emitter, FetchError, Middleware, Next, Operation, PipelineError, Plugin, PluginContext, Request,
    RequestId,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::AbortHandle;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `initial_delay`: 100ms
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0 (delay doubles each retry)
/// - `jitter`: off
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries (cap for exponential backoff)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Scale each delay by a random factor in `[0.5, 1.0]`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_retries: None,
            initial_delay: None,
            max_delay: None,
            multiplier: None,
            jitter: false,
        }
    }

    /// Calculate delay for a given attempt number (0-indexed).
    ///
    /// Uses exponential backoff: `delay = initial_delay * multiplier^attempt`,
    /// capped at `max_delay`. With jitter enabled the capped delay is scaled
    /// by a random factor between 0.5 and 1.0.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        let final_ms = if self.jitter {
            capped_ms * rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            capped_ms
        };

        Duration::from_millis(final_ms as u64)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: Option<u32>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
    jitter: bool,
}

impl RetryPolicyBuilder {
    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set initial delay before first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub const fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(3),
            initial_delay: self.initial_delay.unwrap_or(Duration::from_millis(100)),
            max_delay: self.max_delay.unwrap_or(Duration::from_secs(30)),
            multiplier: self.multiplier.unwrap_or(2.0),
            jitter: self.jitter,
        }
    }
}

type Predicate = Arc<dyn Fn(&FetchError) -> bool + Send + Sync>;

/// Plugin that refetches failed requests.
///
/// Must be placed before any plugin that should only see final failures.
pub struct RetryPlugin {
    policy: RetryPolicy,
    retryable: Option<Predicate>,
}

impl RetryPlugin {
    /// Name the plugin registers under.
    pub const NAME: &'static str = "retry";

    /// Retry every failure according to `policy`.
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retryable: None,
        }
    }

    /// Only retry failures accepted by `predicate`.
    #[must_use]
    pub fn retry_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&FetchError) -> bool + Send + Sync + 'static,
    {
        self.retryable = Some(Arc::new(predicate));
        self
    }
}

impl Default for RetryPlugin {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl fmt::Debug for RetryPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPlugin")
            .field("policy", &self.policy)
            .field("filtered", &self.retryable.is_some())
            .finish()
    }
}

impl Plugin for RetryPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn init(self: Box<Self>, ctx: PluginContext) -> Result<Box<dyn Middleware>, PipelineError> {
        Ok(Box::new(RetryMiddleware {
            policy: self.policy,
            retryable: self.retryable,
            emit: ctx.emit,
            attempts: Mutex::new(HashMap::new()),
        }))
    }
}

#[derive(Default)]
struct Attempts {
    count: u32,
    timer: Option<AbortHandle>,
}

impl Drop for Attempts {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct RetryMiddleware {
    policy: RetryPolicy,
    retryable: Option<Predicate>,
    emit: Emitter,
    attempts: Mutex<HashMap<RequestId, Attempts>>,
}

impl RetryMiddleware {
    fn attempts(&self) -> MutexGuard<'_, HashMap<RequestId, Attempts>> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn should_retry(&self, error: &FetchError) -> bool {
        self.retryable.as_ref().is_none_or(|retryable| retryable(error))
    }

    /// Schedule another attempt. Returns `false` when none is left.
    fn schedule(&self, request: &Request, error: &FetchError) -> bool {
        if !self.should_retry(error) {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(id = %request.id(), "No tokio runtime, not retrying");
            return false;
        };

        let mut attempts = self.attempts();
        let entry = attempts.entry(request.id().clone()).or_default();
        if entry.count >= self.policy.max_retries {
            return false;
        }

        let delay = self.policy.delay_for_attempt(entry.count);
        entry.count += 1;

        let emit = self.emit.clone();
        let retry = Operation::fetch(request.clone());
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(error) = emit.emit(retry) {
                tracing::warn!(%error, "Dropping scheduled retry");
            }
        });
        if let Some(previous) = entry.timer.replace(task.abort_handle()) {
            previous.abort();
        }

        RetryMetrics::record_scheduled(entry.count);
        tracing::info!(
            id = %request.id(),
            attempt = entry.count,
            max_retries = self.policy.max_retries,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Request failed, retrying..."
        );
        true
    }

    fn reset(&self, id: &RequestId) {
        // Dropping the entry aborts a pending retry.
        self.attempts().remove(id);
    }
}

impl Middleware for RetryMiddleware {
    fn call(&self, op: Operation, next: &Next) {
        match &op {
            Operation::Reject { request, error } => {
                if self.schedule(request, error) {
                    return;
                }
                tracing::warn!(id = %request.id(), %error, "Request failed after exhausting retries");
                self.reset(request.id());
            },
            Operation::Complete { request, .. }
            | Operation::Cancel { request }
            | Operation::Dispose { request } => self.reset(request.id()),
            Operation::Fetch { .. } | Operation::Put { .. } => {},
        }
        next.run(op);
    }
}

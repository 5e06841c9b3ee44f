//! The fetch plugin: starts producers and owns the in-flight queue.
//!
//! Always the last plugin of a client pipeline. For every `Fetch` that reaches
//! it, the plugin either pulls the next value from a live lazy subscription,
//! ignores the fetch because one is already running, or asks the [`Fetcher`]
//! for a fresh producer and subscribes to it. Producer events come back into
//! the head of the pipeline as `Put`, `Reject` and `Complete` operations.
//!
//! The `Fetch` itself is forwarded *before* the producer is started, so the
//! `pending` transition always lands in the cache before any result does.

use crate::metrics::FetchMetrics;
use fetchline_core::{
    CacheView, Emitter, FetchError, Middleware, Next, Observer, Operation, PipelineError, Plugin,
    PluginContext, Producer, Request, RequestId, Source, Subscription,
};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Context handed to a [`Fetcher`].
#[derive(Clone)]
pub struct FetchContext {
    /// Read-only view of the request store
    pub cache: CacheView,
}

impl fmt::Debug for FetchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchContext").finish_non_exhaustive()
    }
}

/// Turns a request into a producer.
///
/// Implemented for any `Fn(&Request, &FetchContext) -> Producer`. A fetcher
/// that fails before producing anything should return [`Producer::error`].
///
/// # Example
///
/// ```
/// use fetchline_core::{Producer, Request};
/// use fetchline_runtime::{FetchContext, Fetcher};
/// use serde_json::json;
///
/// let fetcher = |request: &Request, _ctx: &FetchContext| {
///     Producer::value(json!({ "echo": request.query() }))
/// };
/// # fn assert_fetcher<F: Fetcher>(_: &F) {}
/// # assert_fetcher(&fetcher);
/// ```
pub trait Fetcher: Send + Sync + 'static {
    /// Build the producer for `request`.
    fn fetch(&self, request: &Request, ctx: &FetchContext) -> Producer;
}

impl<F> Fetcher for F
where
    F: Fn(&Request, &FetchContext) -> Producer + Send + Sync + 'static,
{
    fn fetch(&self, request: &Request, ctx: &FetchContext) -> Producer {
        self(request, ctx)
    }
}

/// Plugin that runs fetchers and deduplicates in-flight requests.
pub struct FetchPlugin {
    fetcher: Arc<dyn Fetcher>,
}

impl FetchPlugin {
    /// Name the plugin registers under.
    pub const NAME: &'static str = "fetch";

    /// Wrap a fetcher.
    pub fn new<F: Fetcher>(fetcher: F) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
        }
    }

    /// Share an already boxed fetcher.
    #[must_use]
    pub fn from_arc(fetcher: Arc<dyn Fetcher>) -> Self {
        Self { fetcher }
    }
}

impl fmt::Debug for FetchPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchPlugin").finish_non_exhaustive()
    }
}

impl Plugin for FetchPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn init(self: Box<Self>, ctx: PluginContext) -> Result<Box<dyn Middleware>, PipelineError> {
        Ok(Box::new(FetchMiddleware {
            fetcher: self.fetcher,
            ctx,
            queue: Mutex::new(HashMap::new()),
            tickets: AtomicU64::new(0),
        }))
    }
}

/// Queue entry for one request id.
enum Slot {
    /// The fetcher is running; the ticket identifies this attempt.
    Starting(u64),
    /// A subscription exists. It may already have finished.
    Live(Arc<Subscription>),
}

/// What a `Fetch` should do, decided under the queue lock.
enum Plan {
    Pull(Arc<Subscription>),
    Skip,
    Start(u64),
}

struct FetchMiddleware {
    fetcher: Arc<dyn Fetcher>,
    ctx: PluginContext,
    queue: Mutex<HashMap<RequestId, Slot>>,
    tickets: AtomicU64,
}

impl FetchMiddleware {
    fn queue(&self) -> MutexGuard<'_, HashMap<RequestId, Slot>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn plan(&self, id: &RequestId) -> Plan {
        let mut queue = self.queue();
        match queue.get(id) {
            Some(Slot::Live(sub)) if !sub.is_closed() => {
                if sub.is_lazy() {
                    Plan::Pull(Arc::clone(sub))
                } else {
                    Plan::Skip
                }
            },
            Some(Slot::Starting(_)) => Plan::Skip,
            _ => {
                let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
                queue.insert(id.clone(), Slot::Starting(ticket));
                Plan::Start(ticket)
            },
        }
    }

    fn on_fetch(&self, op: Operation, next: &Next) {
        let request = op.request().clone();
        match self.plan(request.id()) {
            Plan::Pull(sub) => {
                next.run(op);
                tracing::trace!(id = %request.id(), "Pulling next value");
                sub.next();
            },
            Plan::Skip => {
                FetchMetrics::record_deduplicated();
                tracing::debug!(id = %request.id(), "Fetch already in flight, deduplicated");
                next.run(op);
            },
            Plan::Start(ticket) => {
                next.run(op);
                self.start(request, ticket);
            },
        }
    }

    fn start(&self, request: Request, ticket: u64) {
        let context = FetchContext {
            cache: Arc::clone(&self.ctx.cache),
        };
        let source = Source::new(self.fetcher.fetch(&request, &context));
        let kind = source.kind();

        let observer = Arc::new(ResultObserver {
            request: request.clone(),
            lazy: kind.is_lazy(),
            emit: self.ctx.emit.clone(),
        });
        let sub = Arc::new(source.subscribe(observer));

        FetchMetrics::record_started();
        tracing::debug!(id = %request.id(), ?kind, "Fetch started");

        let installed = {
            let mut queue = self.queue();
            let reserved = matches!(
                queue.get(request.id()),
                Some(Slot::Starting(current)) if *current == ticket
            );
            if reserved {
                queue.insert(request.id().clone(), Slot::Live(Arc::clone(&sub)));
            }
            reserved
        };

        if !installed {
            tracing::debug!(id = %request.id(), "Request cancelled while starting");
            sub.close();
            return;
        }

        if sub.is_lazy() {
            sub.next();
        }
    }

    fn on_stop(&self, op: Operation, next: &Next) {
        let slot = self.queue().remove(op.key());
        if let Some(Slot::Live(sub)) = slot {
            sub.close();
        }
        next.run(op);
    }

    fn on_settled(&self, op: Operation, next: &Next) {
        {
            let mut queue = self.queue();
            let finished = matches!(queue.get(op.key()), Some(Slot::Live(sub)) if sub.is_closed());
            if finished {
                queue.remove(op.key());
            }
        }
        next.run(op);
    }
}

impl Middleware for FetchMiddleware {
    fn call(&self, op: Operation, next: &Next) {
        match op {
            Operation::Fetch { .. } => self.on_fetch(op, next),
            Operation::Cancel { .. } | Operation::Dispose { .. } => self.on_stop(op, next),
            Operation::Complete { .. } | Operation::Reject { .. } => self.on_settled(op, next),
            Operation::Put { .. } => next.run(op),
        }
    }
}

/// Maps source events to result operations.
struct ResultObserver {
    request: Request,
    lazy: bool,
    emit: Emitter,
}

impl ResultObserver {
    fn send(&self, op: Operation) {
        if let Err(error) = self.emit.emit(op) {
            tracing::warn!(id = %self.request.id(), %error, "Dropping source event");
        }
    }
}

impl Observer for ResultObserver {
    fn next(&self, data: Value) {
        self.send(Operation::put(self.request.clone(), data, self.lazy));
    }

    fn error(&self, error: FetchError) {
        self.send(Operation::reject(self.request.clone(), error));
    }

    fn complete(&self, data: Option<Value>) {
        self.send(Operation::complete(self.request.clone(), data));
    }
}

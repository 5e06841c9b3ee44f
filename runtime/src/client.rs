//! The client orchestrator.
//!
//! A [`Client`] owns the request store and everything around it:
//!
//! - the listener registry (request id to callbacks)
//! - the `prefetched` set
//! - one idle-eviction timer per request without listeners
//! - the composed pipeline `[...plugins, FetchPlugin]`, whose terminal sink
//!   is the only writer of the store
//!
//! Every state change goes through [`Client::apply`], which drops operations
//! that would not change a request's status before they reach any plugin.
//!
//! Producers run on tokio tasks. Their events, client calls and eviction
//! timers all enter the same pipeline queue, so one operation is processed
//! (status transition, plugins, store update, listener notification) before
//! the next one starts, whatever thread it came from. Listener registration
//! and hand-off run as queued jobs too, which keeps every listener's last
//! delivered result equal to the stored one. No lock is held while plugins,
//! fetchers or listeners run, so listeners may call back into the client;
//! their calls are processed once the current operation is done.

use crate::ClientConfig;
use crate::error::ClientError;
use crate::fetch::{FetchPlugin, Fetcher};
use crate::metrics::ClientMetrics;
use fetchline_core::{
    CacheView, Operation, Pipeline, Plugin, QueryResult, ReadCache, Request, RequestId, Status,
    transition,
};
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::AbortHandle;

/// Callback invoked with a request's result on every accepted change.
pub type Listener = Arc<dyn Fn(&QueryResult) + Send + Sync>;

/// Identifies one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listeners = SmallVec<[(ListenerId, Listener); 2]>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Store and listener registry, shared with the cache sink.
#[derive(Default)]
struct Shared {
    store: RwLock<HashMap<RequestId, QueryResult>>,
    listeners: Mutex<HashMap<RequestId, Listeners>>,
}

impl Shared {
    fn status(&self, id: &RequestId) -> Option<Status> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|result| result.status)
    }

    /// Terminal sink of the pipeline.
    fn update_cache(&self, op: &Operation) {
        let id = op.key();
        let result = {
            let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
            let previous = store.get(id);
            let current = previous.map(|result| result.status).unwrap_or_default();
            let next = transition(Some(current), op);

            if next == Status::Disposed {
                if store.remove(id).is_some() {
                    tracing::debug!(%id, "Cache entry disposed");
                }
                return;
            }
            if current != Status::Buffering && next == current {
                tracing::trace!(%id, op = %op.kind(), %current, "Ignoring operation without effect");
                return;
            }

            let data = match op {
                Operation::Put { data, .. }
                | Operation::Complete {
                    data: Some(data), ..
                } => Some(data.clone()),
                _ => previous.and_then(|result| result.data.clone()),
            };
            let error = match op {
                Operation::Reject { error, .. } => Some(error.clone()),
                _ => None,
            };

            let result = QueryResult {
                status: next,
                data,
                error,
            };
            store.insert(id.clone(), result.clone());
            result
        };

        tracing::trace!(%id, status = %result.status, "Cache updated");
        self.notify(id, &result);
    }

    fn notify(&self, id: &RequestId, result: &QueryResult) {
        let listeners: Listeners = lock(&self.listeners).get(id).cloned().unwrap_or_default();
        for (_, listener) in &listeners {
            listener(result);
        }
    }

    fn register(&self, id: &RequestId, listener_id: ListenerId, listener: Listener) {
        lock(&self.listeners)
            .entry(id.clone())
            .or_default()
            .push((listener_id, listener));
    }

    /// Remove a listener. Returns how many remain for `id`.
    fn deregister(&self, id: &RequestId, listener_id: ListenerId) -> usize {
        let mut listeners = lock(&self.listeners);
        let Some(registered) = listeners.get_mut(id) else {
            return 0;
        };
        registered.retain(|(registered_id, _)| *registered_id != listener_id);
        let remaining = registered.len();
        if remaining == 0 {
            listeners.remove(id);
        }
        remaining
    }

    fn has_listeners(&self, id: &RequestId) -> bool {
        lock(&self.listeners).get(id).is_some_and(|registered| !registered.is_empty())
    }
}

impl ReadCache for Shared {
    fn get(&self, id: &RequestId) -> Option<QueryResult> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}

struct Timer {
    generation: u64,
    handle: AbortHandle,
}

struct ClientInner {
    shared: Arc<Shared>,
    pipeline: Pipeline,
    prefetched: Mutex<HashSet<RequestId>>,
    timers: Mutex<HashMap<RequestId, Timer>>,
    generation: AtomicU64,
    next_listener: AtomicU64,
    config: ClientConfig,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let timers = self.timers.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, timer) in timers.drain() {
            timer.handle.abort();
        }
    }
}

/// The request-lifecycle client.
///
/// Cheap to clone; clones share the same store.
///
/// # Example
///
/// ```no_run
/// use fetchline_core::{Producer, Request, build_request};
/// use fetchline_runtime::{Client, FetchContext};
/// use serde_json::json;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Client::builder(|_: &Request, _: &FetchContext| Producer::value(json!([1, 2])))
///     .debug(true)
///     .build()?;
///
/// let request = build_request(json!({ "list": "numbers" }))?;
/// client.prefetch(&request);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Start building a client around `fetcher`.
    pub fn builder<F: Fetcher>(fetcher: F) -> ClientBuilder {
        ClientBuilder::new(fetcher)
    }

    /// Run an operation through the pipeline unless it would not change the
    /// request's status.
    ///
    /// Unseen ids behave like `ready`. Operations on a `buffering` request
    /// are always dispatched. Returns whether the operation was dispatched.
    pub fn apply(&self, op: Operation) -> bool {
        let current = self.inner.shared.status(op.key()).unwrap_or_default();
        let next = transition(Some(current), &op);

        if current != Status::Buffering && next == current {
            ClientMetrics::record_dropped(op.kind());
            tracing::trace!(id = %op.key(), op = %op.kind(), %current, "Operation dropped");
            return false;
        }

        ClientMetrics::record_applied(op.kind());
        tracing::trace!(id = %op.key(), op = %op.kind(), %current, %next, "Applying operation");
        self.inner.pipeline.dispatch(op);
        true
    }

    /// Fetch `request`, optionally listening to its result.
    ///
    /// With a listener, any pending eviction of the request is cancelled and
    /// the listener receives the current result followed by every change.
    /// Without one the request is treated as inactive and scheduled for
    /// eviction.
    ///
    /// If the request was prefetched it is not fetched again: the listener
    /// receives the prefetched result instead.
    ///
    /// Called while the client is processing an operation (from a listener,
    /// for example), the request is attached once that operation is done.
    pub fn fetch(&self, request: &Request, listener: Option<Listener>) -> RequestHandle {
        let listener = listener.map(|listener| {
            let listener_id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
            (listener_id, listener)
        });
        let handle = RequestHandle {
            client: self.clone(),
            request: request.clone(),
            listener: listener.as_ref().map(|(listener_id, _)| *listener_id),
        };

        let client = self.clone();
        let request = request.clone();
        self.inner.pipeline.schedule(move || client.attach(&request, listener));
        handle
    }

    #[tracing::instrument(skip(self, request, listener), fields(id = %request.id()))]
    fn attach(&self, request: &Request, listener: Option<(ListenerId, Listener)>) {
        let id = request.id();

        let listener = match listener {
            Some((listener_id, listener)) => {
                self.cancel_gc(id);
                self.inner.shared.register(id, listener_id, Arc::clone(&listener));
                Some(listener)
            },
            None => {
                self.schedule_gc(request);
                None
            },
        };

        if lock(&self.inner.prefetched).remove(id) {
            tracing::debug!("Handing over prefetched request");
            if let Some(listener) = &listener {
                listener(&self.result(id).unwrap_or_default());
            }
            return;
        }

        if !self.apply(Operation::fetch(request.clone())) {
            // Already in flight: catch the new listener up.
            if let (Some(listener), Some(result)) = (&listener, self.result(id)) {
                listener(&result);
            }
        }
    }

    /// [`fetch`](Self::fetch) with a closure listener.
    pub fn subscribe<F>(&self, request: &Request, listener: F) -> RequestHandle
    where
        F: Fn(&QueryResult) + Send + Sync + 'static,
    {
        self.fetch(request, Some(Arc::new(listener)))
    }

    /// Warm the cache for `request` without listening to it.
    ///
    /// A later [`fetch`](Self::fetch) picks up the prefetched result instead
    /// of fetching again.
    pub fn prefetch(&self, request: &Request) {
        let client = self.clone();
        let request = request.clone();
        self.inner.pipeline.schedule(move || client.warm(&request));
    }

    #[tracing::instrument(skip(self, request), fields(id = %request.id()))]
    fn warm(&self, request: &Request) {
        if lock(&self.inner.prefetched).contains(request.id()) {
            tracing::trace!("Already prefetched");
            return;
        }
        self.attach(request, None);
        lock(&self.inner.prefetched).insert(request.id().clone());
    }

    /// Snapshot of the cached result for `id`.
    #[must_use]
    pub fn result(&self, id: &RequestId) -> Option<QueryResult> {
        self.inner.shared.get(id)
    }

    /// Read-only view of the store.
    #[must_use]
    pub fn cache(&self) -> CacheView {
        Arc::clone(&self.inner.shared) as CacheView
    }

    /// Plugin names in pipeline order, ending with the fetch plugin.
    #[must_use]
    pub fn plugin_names(&self) -> &[String] {
        self.inner.pipeline.plugin_names()
    }

    /// The client's configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    fn status(&self, id: &RequestId) -> Option<Status> {
        self.inner.shared.status(id)
    }

    /// Report a misuse of a request handle.
    fn violation(&self, error: ClientError) -> Result<(), ClientError> {
        if self.inner.config.debug {
            return Err(error);
        }
        tracing::warn!(%error, "Ignoring invalid request handle call");
        Ok(())
    }

    /// (Re)start the eviction timer of `request`.
    fn schedule_gc(&self, request: &Request) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(id = %request.id(), "No tokio runtime, entry will not be evicted");
            return;
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let max_age = self.inner.config.max_age;
        let client = Arc::downgrade(&self.inner);
        let target = request.clone();
        let task = runtime.spawn(async move {
            tokio::time::sleep(max_age).await;
            let Some(inner) = client.upgrade() else {
                return;
            };
            let client = Client { inner };
            let queued = client.clone();
            client
                .inner
                .pipeline
                .schedule(move || queued.collect(&target, generation));
        });

        let timer = Timer {
            generation,
            handle: task.abort_handle(),
        };
        if let Some(previous) = lock(&self.inner.timers).insert(request.id().clone(), timer) {
            previous.handle.abort();
        }
        tracing::trace!(id = %request.id(), ?max_age, "Eviction scheduled");
    }

    fn cancel_gc(&self, id: &RequestId) {
        if let Some(timer) = lock(&self.inner.timers).remove(id) {
            timer.handle.abort();
            tracing::trace!(%id, "Eviction cancelled");
        }
    }

    /// Evict `request` unless its timer was superseded or it has listeners.
    fn collect(&self, request: &Request, generation: u64) {
        let id = request.id();

        {
            let mut timers = lock(&self.inner.timers);
            if timers.get(id).map(|timer| timer.generation) != Some(generation) {
                return;
            }
            timers.remove(id);
        }

        if self.inner.shared.has_listeners(id) {
            tracing::debug!(%id, "Entry has listeners again, not evicting");
            return;
        }

        lock(&self.inner.prefetched).remove(id);
        ClientMetrics::record_evicted();
        tracing::debug!(%id, "Evicting idle entry");
        self.apply(Operation::dispose(request.clone()));
    }

    /// Drop a listener; the last one out cancels the request.
    fn release(&self, request: &Request, listener: ListenerId) {
        let id = request.id();
        if self.inner.shared.deregister(id, listener) == 0 {
            tracing::debug!(%id, "Last listener left");
            self.apply(Operation::cancel(request.clone()));
            self.schedule_gc(request);
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("plugins", &self.plugin_names())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Handle returned by [`Client::fetch`].
///
/// Dropping the handle does not unsubscribe; call
/// [`unsubscribe`](Self::unsubscribe) to release the request.
pub struct RequestHandle {
    client: Client,
    request: Request,
    listener: Option<ListenerId>,
}

impl RequestHandle {
    /// The request this handle controls.
    #[must_use]
    pub const fn request(&self) -> &Request {
        &self.request
    }

    /// Current cached result.
    #[must_use]
    pub fn result(&self) -> Option<QueryResult> {
        self.client.result(self.request.id())
    }

    /// Cancel the request if it is in flight.
    pub fn cancel(&self) {
        self.client.apply(Operation::cancel(self.request.clone()));
    }

    /// Fetch the request again.
    ///
    /// Only allowed once the request completed, failed or was cancelled.
    ///
    /// # Errors
    ///
    /// In debug mode, returns [`ClientError::RefetchUnsettled`] when the
    /// request has not settled. Otherwise the call is ignored.
    pub fn refetch(&self) -> Result<(), ClientError> {
        let status = self.client.status(self.request.id());
        if !status.is_some_and(Status::is_settled) {
            return self.client.violation(ClientError::RefetchUnsettled {
                id: self.request.id().clone(),
                status: status.unwrap_or_default(),
            });
        }
        self.client.apply(Operation::fetch(self.request.clone()));
        Ok(())
    }

    /// Whether a lazy source is waiting for the next pull.
    #[must_use]
    pub fn has_more(&self) -> bool {
        self.client.status(self.request.id()) == Some(Status::Ready)
    }

    /// Pull the next value from a lazy source.
    ///
    /// # Errors
    ///
    /// In debug mode, returns [`ClientError::NoMoreResults`] when
    /// [`has_more`](Self::has_more) is `false`. Otherwise the call is ignored.
    pub fn fetch_more(&self) -> Result<(), ClientError> {
        if !self.has_more() {
            return self.client.violation(ClientError::NoMoreResults {
                id: self.request.id().clone(),
                status: self.client.status(self.request.id()).unwrap_or_default(),
            });
        }
        self.client.apply(Operation::fetch(self.request.clone()));
        Ok(())
    }

    /// Stop listening.
    ///
    /// When the last listener of the request leaves, the request is
    /// cancelled and scheduled for eviction. Calling this twice is a no-op.
    pub fn unsubscribe(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let client = self.client.clone();
        let request = self.request.clone();
        self.client
            .inner
            .pipeline
            .schedule(move || client.release(&request, listener));
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", self.request.id())
            .field("listener", &self.listener)
            .finish()
    }
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    fetcher: Arc<dyn Fetcher>,
    plugins: Vec<Box<dyn Plugin>>,
    config: ClientConfig,
}

impl ClientBuilder {
    /// Start from `fetcher` with the default configuration and no plugins.
    pub fn new<F: Fetcher>(fetcher: F) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            plugins: Vec::new(),
            config: ClientConfig::default(),
        }
    }

    /// Append a plugin. Plugins run in the order they are added, before the
    /// fetch plugin.
    #[must_use]
    pub fn plugin<P: Plugin + 'static>(mut self, plugin: P) -> Self {
        self.plugins.push(Box::new(plugin));
        self
    }

    /// Append already boxed plugins.
    #[must_use]
    pub fn plugins<I>(mut self, plugins: I) -> Self
    where
        I: IntoIterator<Item = Box<dyn Plugin>>,
    {
        self.plugins.extend(plugins);
        self
    }

    /// Set the idle eviction delay.
    #[must_use]
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.config.max_age = max_age;
        self
    }

    /// Enable or disable debug mode.
    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Compose the pipeline and build the client.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Pipeline`] when a plugin name is empty or
    /// duplicated (including a plugin named `fetch`), when a plugin's `init`
    /// fails, or when a plugin emits during `init`.
    pub fn build(self) -> Result<Client, ClientError> {
        let shared = Arc::new(Shared::default());

        let mut plugins = self.plugins;
        plugins.push(Box::new(FetchPlugin::from_arc(self.fetcher)));

        let sink = Arc::clone(&shared);
        let pipeline = Pipeline::compose(plugins, Arc::clone(&shared) as CacheView, move |op| {
            sink.update_cache(&op);
        })?;

        tracing::debug!(plugins = ?pipeline.plugin_names(), config = ?self.config, "Client built");

        Ok(Client {
            inner: Arc::new(ClientInner {
                shared,
                pipeline,
                prefetched: Mutex::new(HashSet::new()),
                timers: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                next_listener: AtomicU64::new(0),
                config: self.config,
            }),
        })
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("plugins", &self.plugins.iter().map(|p| p.name()).collect::<Vec<_>>())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can unwrap
mod tests {
    use super::*;
    use fetchline_core::FetchError;
    use serde_json::json;

    fn request() -> Request {
        Request::from_id(RequestId::new("entry"))
    }

    fn applied(shared: &Shared, ops: Vec<Operation>) -> Option<QueryResult> {
        for op in ops {
            shared.update_cache(&op);
        }
        shared.get(request().id())
    }

    #[test]
    fn test_put_then_complete_without_data_keeps_last_value() {
        let result = applied(
            &Shared::default(),
            vec![
                Operation::fetch(request()),
                Operation::put(request(), json!(1), false),
                Operation::put(request(), json!(2), false),
                Operation::complete(request(), None),
            ],
        )
        .unwrap();

        assert_eq!(result.status, Status::Completed);
        assert_eq!(result.data, Some(json!(2)));
    }

    #[test]
    fn test_reject_sets_error_and_refetch_clears_it() {
        let shared = Shared::default();
        let error = FetchError::msg("offline");

        let failed = applied(
            &shared,
            vec![
                Operation::fetch(request()),
                Operation::reject(request(), error.clone()),
            ],
        )
        .unwrap();
        assert_eq!(failed.status, Status::Failed);
        assert_eq!(failed.error, Some(error));

        let retried = applied(&shared, vec![Operation::fetch(request())]).unwrap();
        assert_eq!(retried.status, Status::Pending);
        assert_eq!(retried.error, None);
    }

    #[test]
    fn test_stale_data_survives_a_new_fetch() {
        let shared = Shared::default();
        applied(
            &shared,
            vec![
                Operation::fetch(request()),
                Operation::complete(request(), Some(json!("v1"))),
            ],
        );

        let result = applied(&shared, vec![Operation::fetch(request())]).unwrap();
        assert_eq!(result.status, Status::Pending);
        assert_eq!(result.data, Some(json!("v1")));
    }

    #[test]
    fn test_dispose_removes_without_notifying() {
        let shared = Shared::default();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        shared.register(
            request().id(),
            ListenerId(0),
            Arc::new(move |_: &QueryResult| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        applied(&shared, vec![Operation::fetch(request())]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(applied(&shared, vec![Operation::dispose(request())]), None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Disposing an unknown id is harmless.
        assert_eq!(applied(&shared, vec![Operation::dispose(request())]), None);
    }

    #[test]
    fn test_operations_without_effect_are_not_stored() {
        let shared = Shared::default();
        applied(
            &shared,
            vec![
                Operation::fetch(request()),
                Operation::cancel(request()),
                Operation::put(request(), json!("late"), false),
            ],
        );

        let result = shared.get(request().id()).unwrap();
        assert_eq!(result.status, Status::Cancelled);
        assert_eq!(result.data, None);
    }

    #[test]
    fn test_deregister_reports_remaining_listeners() {
        let shared = Shared::default();
        let noop: Listener = Arc::new(|_: &QueryResult| {});
        shared.register(request().id(), ListenerId(1), Arc::clone(&noop));
        shared.register(request().id(), ListenerId(2), noop);

        assert_eq!(shared.deregister(request().id(), ListenerId(1)), 1);
        assert!(shared.has_listeners(request().id()));
        assert_eq!(shared.deregister(request().id(), ListenerId(2)), 0);
        assert!(!shared.has_listeners(request().id()));
        assert_eq!(shared.deregister(request().id(), ListenerId(2)), 0);
    }
}

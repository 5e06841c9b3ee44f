//! Source adapter: one push protocol for every producer shape.
//!
//! A fetcher hands back a [`Producer`]. [`Source::subscribe`] turns it into a
//! closeable [`Subscription`] that pushes into an [`Observer`]:
//!
//! | producer | [`SourceKind`] | pushes |
//! |---|---|---|
//! | future | `Thenable` | `complete(Some(v))` or `error(e)` |
//! | observable | `Observable` | whatever the observable pushes |
//! | stream | `Iterable` (lazy) | one `next(v)` per pull, `complete(None)` at the end |
//! | pull callback | `Callable` (lazy) | one `next(v)` per pull, `complete(None)` on `None` |
//! | plain value | `Value` | `complete(Some(v))` |
//!
//! Lazy sources do not drain themselves: each [`Subscription::next`] pulls
//! exactly one item.
//!
//! The [`Subscriber`] handed to producers enforces the observer contract:
//! `error` and `complete` fire at most once and exclude each other, and values
//! pushed after closure are dropped. Closing runs the producer's cleanup
//! exactly once, however many times it is requested.
//!
//! Futures, streams, callbacks and values are driven on a spawned tokio task.
//! Subscribing to one outside a tokio runtime fails the subscription through
//! [`Subscriber::error`] instead of starting it.

use crate::error::FetchError;
use futures::future::{self, BoxFuture};
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt, TryFutureExt};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// Cleanup returned by an [`Observable`] when subscribed.
pub type Teardown = Box<dyn FnOnce() + Send>;

type PullFn = Box<dyn FnMut() -> Result<Option<Value>, FetchError> + Send>;

/// Receiver of source events.
pub trait Observer: Send + Sync {
    /// A value arrived.
    fn next(&self, data: Value);

    /// The source failed. Terminal.
    fn error(&self, error: FetchError);

    /// The source finished, optionally with a final value. Terminal.
    fn complete(&self, data: Option<Value>);
}

/// A push-based producer.
///
/// The observable pushes into the [`Subscriber`] at its own pace and returns
/// the cleanup to run when the subscription closes.
///
/// # Example
///
/// ```ignore
/// struct Ticker;
///
/// impl Observable for Ticker {
///     fn subscribe(self: Box<Self>, subscriber: Subscriber) -> Teardown {
///         let task = tokio::spawn(async move {
///             for i in 0..3 {
///                 subscriber.next(json!(i));
///             }
///             subscriber.complete(None);
///         });
///         Box::new(move || task.abort())
///     }
/// }
/// ```
pub trait Observable: Send {
    /// Start pushing into `subscriber`.
    fn subscribe(self: Box<Self>, subscriber: Subscriber) -> Teardown;
}

/// Every producer shape a fetcher may return.
pub enum Producer {
    /// Resolves once.
    Future(BoxFuture<'static, Result<Value, FetchError>>),

    /// Pushes values on its own.
    Observable(Box<dyn Observable>),

    /// Pull-driven sequence.
    Stream(BoxStream<'static, Result<Value, FetchError>>),

    /// Pull-driven callback; `None` ends the sequence.
    Callable(PullFn),

    /// Already-resolved value.
    Value(Value),
}

impl Producer {
    /// Wrap a future.
    pub fn future<F, E>(future: F) -> Self
    where
        F: Future<Output = Result<Value, E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        Self::Future(future.map_err(into_fetch_error).boxed())
    }

    /// A producer that fails immediately.
    #[must_use]
    pub fn error(error: FetchError) -> Self {
        Self::Future(future::ready(Err(error)).boxed())
    }

    /// Wrap a push-based observable.
    pub fn observable<O>(observable: O) -> Self
    where
        O: Observable + 'static,
    {
        Self::Observable(Box::new(observable))
    }

    /// Wrap a stream as a lazy, pull-driven source.
    pub fn stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Value, E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        Self::Stream(
            stream
                .map(|item| item.map_err(into_fetch_error))
                .boxed(),
        )
    }

    /// Wrap an iterator as a lazy, pull-driven source.
    pub fn iter<I>(values: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Self::Stream(futures::stream::iter(values.into_iter().map(Ok::<Value, FetchError>)).boxed())
    }

    /// Wrap a callback invoked once per pull.
    pub fn callable<F, E>(mut pull: F) -> Self
    where
        F: FnMut() -> Result<Option<Value>, E> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        Self::Callable(Box::new(move || pull().map_err(into_fetch_error)))
    }

    /// A value that is emitted once, then completes.
    #[must_use]
    pub const fn value(value: Value) -> Self {
        Self::Value(value)
    }

    /// Drain a stream eagerly, pushing every item as it arrives.
    ///
    /// Unlike [`Producer::stream`] the result is not lazy: it behaves like an
    /// observable and every item becomes a buffered value.
    pub fn observe_stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Value, E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        let stream = stream
            .map(|item| item.map_err(into_fetch_error))
            .boxed();
        Self::observable(StreamObservable { stream })
    }
}

fn into_fetch_error<E: Into<anyhow::Error>>(error: E) -> FetchError {
    let error: anyhow::Error = error.into();
    FetchError::from(error)
}

impl From<Value> for Producer {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Future(_) => write!(f, "Producer::Future(<future>)"),
            Self::Observable(_) => write!(f, "Producer::Observable(<observable>)"),
            Self::Stream(_) => write!(f, "Producer::Stream(<stream>)"),
            Self::Callable(_) => write!(f, "Producer::Callable(<fn>)"),
            Self::Value(value) => f.debug_tuple("Producer::Value").field(value).finish(),
        }
    }
}

/// Tag describing how a producer is driven.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// Resolves once
    Thenable,
    /// Pushes on its own
    Observable,
    /// Pull-driven sequence
    Iterable,
    /// Pull-driven callback
    Callable,
    /// Already resolved
    Value,
}

impl SourceKind {
    /// Pull-driven sources wait for an explicit pull between values.
    #[must_use]
    pub const fn is_lazy(self) -> bool {
        matches!(self, Self::Iterable | Self::Callable)
    }
}

/// Classify a producer.
#[must_use]
pub const fn classify(producer: &Producer) -> SourceKind {
    match producer {
        Producer::Future(_) => SourceKind::Thenable,
        Producer::Observable(_) => SourceKind::Observable,
        Producer::Stream(_) => SourceKind::Iterable,
        Producer::Callable(_) => SourceKind::Callable,
        Producer::Value(_) => SourceKind::Value,
    }
}

/// Closed flag plus the cleanup still to run.
#[derive(Default)]
struct Gate {
    state: Mutex<GateState>,
}

#[derive(Default)]
struct GateState {
    closed: bool,
    cleanup: Option<Teardown>,
}

impl Gate {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Mark closed. Returns the pending cleanup if this call closed the gate.
    fn seal(&self) -> Option<Option<Teardown>> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        state.closed = true;
        Some(state.cleanup.take())
    }

    fn close(&self) -> bool {
        match self.seal() {
            Some(cleanup) => {
                run(cleanup);
                true
            },
            None => false,
        }
    }

    fn set_cleanup(&self, cleanup: Teardown) {
        let late = {
            let mut state = self.lock();
            if state.closed {
                Some(cleanup)
            } else {
                state.cleanup = Some(cleanup);
                None
            }
        };
        run(late);
    }
}

fn run(cleanup: Option<Teardown>) {
    if let Some(cleanup) = cleanup {
        cleanup();
    }
}

/// Guarded observer handed to producers.
#[derive(Clone)]
pub struct Subscriber {
    gate: Arc<Gate>,
    observer: Arc<dyn Observer>,
}

impl Subscriber {
    /// Push a value. Dropped once the subscription is closed.
    pub fn next(&self, data: Value) {
        if self.gate.is_closed() {
            tracing::trace!("Dropping value pushed after close");
            return;
        }
        self.observer.next(data);
    }

    /// Fail the subscription. Only the first terminal event is delivered.
    pub fn error(&self, error: FetchError) {
        if let Some(cleanup) = self.gate.seal() {
            self.observer.error(error);
            run(cleanup);
        } else {
            tracing::trace!(error = %error, "Dropping error pushed after close");
        }
    }

    /// Finish the subscription. Only the first terminal event is delivered.
    pub fn complete(&self, data: Option<Value>) {
        if let Some(cleanup) = self.gate.seal() {
            self.observer.complete(data);
            run(cleanup);
        } else {
            tracing::trace!("Dropping completion pushed after close");
        }
    }

    /// Whether the subscription is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.gate.is_closed()
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Live handle to a subscribed source.
///
/// Dropping the subscription closes it.
pub struct Subscription {
    gate: Arc<Gate>,
    kind: SourceKind,
    pull: Option<mpsc::UnboundedSender<()>>,
}

impl Subscription {
    /// Whether the source finished or was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.gate.is_closed()
    }

    /// Close the subscription and run the source cleanup.
    ///
    /// Idempotent: cleanup runs once, even after natural completion.
    pub fn close(&self) {
        if self.gate.close() {
            tracing::debug!(kind = ?self.kind, "Subscription closed");
        }
    }

    /// Whether the source waits for explicit pulls.
    #[must_use]
    pub const fn is_lazy(&self) -> bool {
        self.kind.is_lazy()
    }

    /// How the underlying producer is driven.
    #[must_use]
    pub const fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Pull one value from a lazy source.
    ///
    /// Returns `false` when the source is not lazy or is already closed.
    pub fn next(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.pull.as_ref().is_some_and(|pull| pull.send(()).is_ok())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// A producer ready to be subscribed to.
#[derive(Debug)]
pub struct Source {
    producer: Producer,
}

impl Source {
    /// Adapt a producer.
    #[must_use]
    pub const fn new(producer: Producer) -> Self {
        Self { producer }
    }

    /// How the producer will be driven.
    #[must_use]
    pub const fn kind(&self) -> SourceKind {
        classify(&self.producer)
    }

    /// Start the source, pushing into `observer`.
    ///
    /// Task-driven producers (everything except observables) need a tokio
    /// runtime. Without one the observer receives an error and the
    /// subscription is closed.
    pub fn subscribe(self, observer: Arc<dyn Observer>) -> Subscription {
        let kind = self.kind();
        let gate = Arc::new(Gate::default());
        let subscriber = Subscriber {
            gate: Arc::clone(&gate),
            observer,
        };

        let mut pull = None;
        let teardown = match (self.producer, Handle::try_current()) {
            (Producer::Observable(observable), _) => observable.subscribe(subscriber),
            (_, Err(error)) => {
                tracing::warn!(?kind, %error, "Cannot drive source");
                subscriber.error(FetchError::msg(NO_RUNTIME));
                Box::new(|| {})
            },
            (Producer::Future(future), Ok(runtime)) => drive_future(&runtime, future, subscriber),
            (Producer::Value(value), Ok(runtime)) => {
                drive_future(&runtime, future::ready(Ok(value)).boxed(), subscriber)
            },
            (Producer::Stream(stream), Ok(runtime)) => {
                let (tx, rx) = mpsc::unbounded_channel();
                pull = Some(tx);
                drive_stream(&runtime, stream, rx, subscriber)
            },
            (Producer::Callable(callback), Ok(runtime)) => {
                let (tx, rx) = mpsc::unbounded_channel();
                pull = Some(tx);
                drive_callable(&runtime, callback, rx, subscriber)
            },
        };
        gate.set_cleanup(teardown);

        tracing::trace!(?kind, "Source subscribed");
        Subscription { gate, kind, pull }
    }
}

impl From<Producer> for Source {
    fn from(producer: Producer) -> Self {
        Self::new(producer)
    }
}

const NO_RUNTIME: &str = "no tokio runtime available to drive the source";

fn drive_future(
    runtime: &Handle,
    future: BoxFuture<'static, Result<Value, FetchError>>,
    subscriber: Subscriber,
) -> Teardown {
    let task = runtime.spawn(async move {
        match future.await {
            Ok(value) => subscriber.complete(Some(value)),
            Err(error) => subscriber.error(error),
        }
    });
    let abort = task.abort_handle();
    Box::new(move || abort.abort())
}

fn drive_stream(
    runtime: &Handle,
    mut stream: BoxStream<'static, Result<Value, FetchError>>,
    mut pulls: mpsc::UnboundedReceiver<()>,
    subscriber: Subscriber,
) -> Teardown {
    let task = runtime.spawn(async move {
        while pulls.recv().await.is_some() {
            match stream.next().await {
                Some(Ok(value)) => subscriber.next(value),
                Some(Err(error)) => {
                    subscriber.error(error);
                    return;
                },
                None => {
                    subscriber.complete(None);
                    return;
                },
            }
        }
    });
    let abort = task.abort_handle();
    Box::new(move || abort.abort())
}

fn drive_callable(
    runtime: &Handle,
    mut callback: PullFn,
    mut pulls: mpsc::UnboundedReceiver<()>,
    subscriber: Subscriber,
) -> Teardown {
    let task = runtime.spawn(async move {
        while pulls.recv().await.is_some() {
            match callback() {
                Ok(Some(value)) => subscriber.next(value),
                Ok(None) => {
                    subscriber.complete(None);
                    return;
                },
                Err(error) => {
                    subscriber.error(error);
                    return;
                },
            }
        }
    });
    let abort = task.abort_handle();
    Box::new(move || abort.abort())
}

/// Eagerly drains a stream into a subscriber.
struct StreamObservable {
    stream: BoxStream<'static, Result<Value, FetchError>>,
}

impl Observable for StreamObservable {
    fn subscribe(self: Box<Self>, subscriber: Subscriber) -> Teardown {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(error) => {
                tracing::warn!(%error, "Cannot drain stream");
                subscriber.error(FetchError::msg(NO_RUNTIME));
                return Box::new(|| {});
            },
        };
        let mut stream = self.stream;
        let task = runtime.spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(value) => subscriber.next(value),
                    Err(error) => {
                        subscriber.error(error);
                        return;
                    },
                }
            }
            subscriber.complete(None);
        });
        let abort = task.abort_handle();
        Box::new(move || abort.abort())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can unwrap
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq)]
    enum Event {
        Next(Value),
        Error(String),
        Complete(Option<Value>),
    }

    struct ChannelObserver(mpsc::UnboundedSender<Event>);

    impl Observer for ChannelObserver {
        fn next(&self, data: Value) {
            let _ = self.0.send(Event::Next(data));
        }

        fn error(&self, error: FetchError) {
            let _ = self.0.send(Event::Error(error.to_string()));
        }

        fn complete(&self, data: Option<Value>) {
            let _ = self.0.send(Event::Complete(data));
        }
    }

    fn channel_observer() -> (Arc<dyn Observer>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelObserver(tx)), rx)
    }

    /// Observable whose subscriber is handed back to the test.
    struct Handoff {
        slot: Arc<Mutex<Option<Subscriber>>>,
        teardowns: Arc<AtomicUsize>,
    }

    impl Observable for Handoff {
        fn subscribe(self: Box<Self>, subscriber: Subscriber) -> Teardown {
            *self.slot.lock().unwrap() = Some(subscriber);
            let teardowns = self.teardowns;
            Box::new(move || {
                teardowns.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    #[tokio::test]
    async fn test_future_completes_with_its_value() {
        let (observer, mut events) = channel_observer();
        let source = Source::new(Producer::future(async { Ok::<_, anyhow::Error>(json!([1, 2])) }));
        assert_eq!(source.kind(), SourceKind::Thenable);

        let subscription = source.subscribe(observer);
        assert!(!subscription.is_lazy());

        assert_eq!(events.recv().await, Some(Event::Complete(Some(json!([1, 2])))));
        assert!(subscription.is_closed());
    }

    #[tokio::test]
    async fn test_future_rejection_becomes_error() {
        let (observer, mut events) = channel_observer();
        let _subscription = Source::new(Producer::error(FetchError::msg("offline"))).subscribe(observer);

        assert_eq!(events.recv().await, Some(Event::Error("offline".into())));
    }

    #[tokio::test]
    async fn test_plain_value_completes_once() {
        let (observer, mut events) = channel_observer();
        let subscription = Source::new(Producer::from(json!("hi"))).subscribe(observer);
        assert_eq!(subscription.kind(), SourceKind::Value);

        assert_eq!(events.recv().await, Some(Event::Complete(Some(json!("hi")))));
        // Task finished and dropped its observer.
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_closing_aborts_a_pending_future() {
        let (observer, mut events) = channel_observer();
        let subscription =
            Source::new(Producer::future(future::pending::<Result<Value, anyhow::Error>>()))
                .subscribe(observer);

        subscription.close();
        assert!(subscription.is_closed());
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_observable_contract_is_enforced() {
        let (observer, mut events) = channel_observer();
        let slot = Arc::new(Mutex::new(None));
        let teardowns = Arc::new(AtomicUsize::new(0));
        let subscription = Source::new(Producer::observable(Handoff {
            slot: Arc::clone(&slot),
            teardowns: Arc::clone(&teardowns),
        }))
        .subscribe(observer);

        let subscriber = slot.lock().unwrap().clone().unwrap();
        subscriber.next(json!(1));
        subscriber.complete(Some(json!(2)));
        subscriber.error(FetchError::msg("late"));
        subscriber.complete(None);
        subscriber.next(json!(3));

        assert_eq!(events.try_recv().unwrap(), Event::Next(json!(1)));
        assert_eq!(events.try_recv().unwrap(), Event::Complete(Some(json!(2))));
        assert!(events.try_recv().is_err());

        // Natural completion already ran the cleanup.
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        subscription.close();
        subscription.close();
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_runs_teardown_exactly_once() {
        let (observer, _events) = channel_observer();
        let teardowns = Arc::new(AtomicUsize::new(0));
        let subscription = Source::new(Producer::observable(Handoff {
            slot: Arc::new(Mutex::new(None)),
            teardowns: Arc::clone(&teardowns),
        }))
        .subscribe(observer);

        subscription.close();
        subscription.close();
        drop(subscription);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_observable_completing_during_subscribe_still_tears_down() {
        struct Immediate(Arc<AtomicUsize>);

        impl Observable for Immediate {
            fn subscribe(self: Box<Self>, subscriber: Subscriber) -> Teardown {
                subscriber.complete(Some(json!("done")));
                let teardowns = self.0;
                Box::new(move || {
                    teardowns.fetch_add(1, Ordering::SeqCst);
                })
            }
        }

        let (observer, mut events) = channel_observer();
        let teardowns = Arc::new(AtomicUsize::new(0));
        let subscription =
            Source::new(Producer::observable(Immediate(Arc::clone(&teardowns)))).subscribe(observer);

        assert_eq!(events.try_recv().unwrap(), Event::Complete(Some(json!("done"))));
        assert!(subscription.is_closed());
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stream_is_pulled_one_value_at_a_time() {
        let (observer, mut events) = channel_observer();
        let subscription = Source::new(Producer::iter(vec![json!("a"), json!("b")])).subscribe(observer);
        assert!(subscription.is_lazy());

        tokio::task::yield_now().await;
        assert!(events.try_recv().is_err(), "lazy source must not drain itself");

        assert!(subscription.next());
        assert_eq!(events.recv().await, Some(Event::Next(json!("a"))));
        assert!(subscription.next());
        assert_eq!(events.recv().await, Some(Event::Next(json!("b"))));
        assert!(subscription.next());
        assert_eq!(events.recv().await, Some(Event::Complete(None)));

        assert!(subscription.is_closed());
        assert!(!subscription.next());
    }

    #[tokio::test]
    async fn test_stream_error_is_terminal() {
        let (observer, mut events) = channel_observer();
        let items = futures::stream::iter(vec![
            Ok(json!(1)),
            Err(anyhow::anyhow!("broken page")),
            Ok(json!(2)),
        ]);
        let subscription = Source::new(Producer::stream(items)).subscribe(observer);

        subscription.next();
        assert_eq!(events.recv().await, Some(Event::Next(json!(1))));
        subscription.next();
        assert_eq!(events.recv().await, Some(Event::Error("broken page".into())));
        assert!(!subscription.next());
    }

    #[tokio::test]
    async fn test_callable_is_invoked_once_per_pull() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let producer = Producer::callable(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>((n < 2).then(|| json!(n)))
        });
        assert_eq!(classify(&producer), SourceKind::Callable);

        let (observer, mut events) = channel_observer();
        let subscription = Source::new(producer).subscribe(observer);

        subscription.next();
        assert_eq!(events.recv().await, Some(Event::Next(json!(0))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        subscription.next();
        subscription.next();
        assert_eq!(events.recv().await, Some(Event::Next(json!(1))));
        assert_eq!(events.recv().await, Some(Event::Complete(None)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_observed_stream_drains_eagerly() {
        let (observer, mut events) = channel_observer();
        let items = async_stream::stream! {
            yield Ok::<_, anyhow::Error>(json!(1));
            tokio::task::yield_now().await;
            yield Ok(json!(2));
        };
        let subscription = Source::new(Producer::observe_stream(items)).subscribe(observer);
        assert!(!subscription.is_lazy());

        assert_eq!(events.recv().await, Some(Event::Next(json!(1))));
        assert_eq!(events.recv().await, Some(Event::Next(json!(2))));
        assert_eq!(events.recv().await, Some(Event::Complete(None)));
    }

    #[test]
    fn test_task_driven_source_fails_without_a_runtime() {
        let (observer, mut events) = channel_observer();
        let subscription = Source::new(Producer::value(json!(1))).subscribe(observer);

        assert!(subscription.is_closed());
        assert_eq!(events.try_recv().unwrap(), Event::Error(NO_RUNTIME.to_string()));
        assert!(events.try_recv().is_err());
        assert!(!subscription.next());
    }

    #[test]
    fn test_observed_stream_fails_without_a_runtime() {
        let (observer, mut events) = channel_observer();
        let stream = futures::stream::iter(vec![Ok::<_, anyhow::Error>(json!(1))]);
        let subscription = Source::new(Producer::observe_stream(stream)).subscribe(observer);

        assert!(subscription.is_closed());
        assert_eq!(events.try_recv().unwrap(), Event::Error(NO_RUNTIME.to_string()));
    }

    #[tokio::test]
    async fn test_std_errors_convert_into_fetch_errors() {
        let (observer, mut events) = channel_observer();
        let source = Source::new(Producer::callable(|| {
            Err::<Option<Value>, _>(std::io::Error::other("socket closed"))
        }));

        let subscription = source.subscribe(observer);
        assert!(subscription.next());

        assert_eq!(events.recv().await, Some(Event::Error("socket closed".into())));
        assert!(subscription.is_closed());
    }

    #[test]
    fn test_only_pull_driven_kinds_are_lazy() {
        assert!(SourceKind::Iterable.is_lazy());
        assert!(SourceKind::Callable.is_lazy());
        assert!(!SourceKind::Thenable.is_lazy());
        assert!(!SourceKind::Observable.is_lazy());
        assert!(!SourceKind::Value.is_lazy());
    }
}

//! # Fetchline Testing
//!
//! Testing utilities and helpers for the Fetchline request-lifecycle engine.
//!
//! This crate provides:
//! - Mock producers, fetchers and listeners
//! - Test helpers (tracing setup, polling)
//! - Property-based testing strategies for JSON queries
//! - A Given-When-Then harness for the status state machine
//!
//! ## Example
//!
//! ```no_run
//! use fetchline_core::{Status, build_request};
//! use fetchline_runtime::Client;
//! use fetchline_testing::{CountingFetcher, ObservableController, RecordingListener, eventually};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let controller = ObservableController::new();
//! let producer_source = controller.clone();
//! let fetcher = CountingFetcher::new(move |_| producer_source.producer());
//! let client = Client::builder(fetcher.clone()).build().unwrap();
//!
//! let request = build_request(serde_json::json!({ "feed": "news" })).unwrap();
//! let recorder = RecordingListener::new();
//! let _handle = client.fetch(&request, Some(recorder.listener()));
//!
//! controller.complete(None);
//! assert!(eventually(Duration::from_secs(1), || recorder.last_status() == Some(Status::Completed)).await);
//! assert_eq!(fetcher.calls(), 1);
//! # }
//! ```


pub use transition_test::{TransitionTest, assertions};

/// Mock producers, fetchers and listeners
///
/// Mock implementations for testing.
pub mod mocks {
    use fetchline_core::{
        FetchError, Observable, Producer, QueryResult, Request, Status, Subscriber, Teardown,
    };
    use fetchline_runtime::{FetchContext, Fetcher, Listener};
    use serde_json::Value;
    use std::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Listener that records every result it receives.
    ///
    /// # Example
    ///
    /// ```
    /// use fetchline_core::{QueryResult, Status};
    /// use fetchline_testing::RecordingListener;
    ///
    /// let recorder = RecordingListener::new();
    /// let listener = recorder.listener();
    /// listener(&QueryResult::with_status(Status::Pending));
    /// assert_eq!(recorder.statuses(), vec![Status::Pending]);
    /// ```
    #[derive(Clone, Default)]
    pub struct RecordingListener {
        results: Arc<Mutex<Vec<QueryResult>>>,
    }

    impl RecordingListener {
        /// Create an empty recorder
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// A listener feeding this recorder
        #[must_use]
        pub fn listener(&self) -> Listener {
            let results = Arc::clone(&self.results);
            Arc::new(move |result: &QueryResult| lock(&results).push(result.clone()))
        }

        /// Every result received so far
        #[must_use]
        pub fn results(&self) -> Vec<QueryResult> {
            lock(&self.results).clone()
        }

        /// Status of every result received so far
        #[must_use]
        pub fn statuses(&self) -> Vec<Status> {
            lock(&self.results).iter().map(|result| result.status).collect()
        }

        /// The most recent result
        #[must_use]
        pub fn last(&self) -> Option<QueryResult> {
            lock(&self.results).last().cloned()
        }

        /// Status of the most recent result
        #[must_use]
        pub fn last_status(&self) -> Option<Status> {
            lock(&self.results).last().map(|result| result.status)
        }

        /// Number of results received
        #[must_use]
        pub fn len(&self) -> usize {
            lock(&self.results).len()
        }

        /// Whether nothing was received yet
        #[must_use]
        pub fn is_empty(&self) -> bool {
            lock(&self.results).is_empty()
        }
    }

    impl fmt::Debug for RecordingListener {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("RecordingListener")
                .field("statuses", &self.statuses())
                .finish()
        }
    }

    #[derive(Default)]
    struct ControllerState {
        subscriber: Mutex<Option<Subscriber>>,
        subscriptions: AtomicUsize,
        teardowns: AtomicUsize,
    }

    /// Drives a [`ManualObservable`] from the test body.
    ///
    /// Values are pushed only when the test says so, which makes ordering
    /// and cancellation scenarios deterministic.
    #[derive(Clone, Default)]
    pub struct ObservableController {
        state: Arc<ControllerState>,
    }

    impl ObservableController {
        /// Create a controller with no subscriber yet
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// A new observable bound to this controller
        #[must_use]
        pub fn observable(&self) -> ManualObservable {
            ManualObservable {
                state: Arc::clone(&self.state),
            }
        }

        /// [`observable`](Self::observable) wrapped as a producer
        #[must_use]
        pub fn producer(&self) -> Producer {
            Producer::observable(self.observable())
        }

        fn subscriber(&self) -> Option<Subscriber> {
            lock(&self.state.subscriber).clone()
        }

        /// Push a value to the latest subscriber. Returns `false` if there is none.
        pub fn next(&self, data: Value) -> bool {
            let Some(subscriber) = self.subscriber() else {
                return false;
            };
            subscriber.next(data);
            true
        }

        /// Complete the latest subscriber. Returns `false` if there is none.
        pub fn complete(&self, data: Option<Value>) -> bool {
            let Some(subscriber) = self.subscriber() else {
                return false;
            };
            subscriber.complete(data);
            true
        }

        /// Fail the latest subscriber. Returns `false` if there is none.
        pub fn error(&self, error: FetchError) -> bool {
            let Some(subscriber) = self.subscriber() else {
                return false;
            };
            subscriber.error(error);
            true
        }

        /// How many times an observable of this controller was subscribed
        #[must_use]
        pub fn subscriptions(&self) -> usize {
            self.state.subscriptions.load(Ordering::SeqCst)
        }

        /// How many times a teardown ran
        #[must_use]
        pub fn teardowns(&self) -> usize {
            self.state.teardowns.load(Ordering::SeqCst)
        }

        /// Whether the latest subscription is still open
        #[must_use]
        pub fn is_open(&self) -> bool {
            self.subscriber().is_some_and(|subscriber| !subscriber.is_closed())
        }
    }

    impl fmt::Debug for ObservableController {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("ObservableController")
                .field("subscriptions", &self.subscriptions())
                .field("teardowns", &self.teardowns())
                .finish()
        }
    }

    /// Observable whose events come from an [`ObservableController`].
    pub struct ManualObservable {
        state: Arc<ControllerState>,
    }

    impl Observable for ManualObservable {
        fn subscribe(self: Box<Self>, subscriber: Subscriber) -> Teardown {
            *lock(&self.state.subscriber) = Some(subscriber);
            self.state.subscriptions.fetch_add(1, Ordering::SeqCst);
            let state = self.state;
            Box::new(move || {
                state.teardowns.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    type MakeProducer = Arc<dyn Fn(&Request) -> Producer + Send + Sync>;

    /// Fetcher that counts its calls and records the requests it saw.
    #[derive(Clone)]
    pub struct CountingFetcher {
        calls: Arc<AtomicUsize>,
        requests: Arc<Mutex<Vec<Request>>>,
        make: MakeProducer,
    }

    impl CountingFetcher {
        /// Wrap a producer factory
        pub fn new<F>(make: F) -> Self
        where
            F: Fn(&Request) -> Producer + Send + Sync + 'static,
        {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                requests: Arc::new(Mutex::new(Vec::new())),
                make: Arc::new(make),
            }
        }

        /// A fetcher that resolves every request with `value`
        #[must_use]
        pub fn resolving(value: Value) -> Self {
            Self::new(move |_| Producer::value(value.clone()))
        }

        /// Number of calls so far
        #[must_use]
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Requests seen so far, in call order
        #[must_use]
        pub fn requests(&self) -> Vec<Request> {
            lock(&self.requests).clone()
        }
    }

    impl Fetcher for CountingFetcher {
        fn fetch(&self, request: &Request, _ctx: &FetchContext) -> Producer {
            self.calls.fetch_add(1, Ordering::SeqCst);
            lock(&self.requests).push(request.clone());
            (self.make)(request)
        }
    }

    impl fmt::Debug for CountingFetcher {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("CountingFetcher")
                .field("calls", &self.calls())
                .finish_non_exhaustive()
        }
    }
}

/// Test helpers and utilities.
pub mod helpers {
    use fetchline_core::{Request, RequestId};
    use std::time::Duration;
    use tracing_subscriber::EnvFilter;

    /// A request with an explicit id and no query fields
    #[must_use]
    pub fn request(id: &str) -> Request {
        Request::from_id(RequestId::new(id))
    }

    /// Install a fmt subscriber writing through the test harness.
    ///
    /// Honors `RUST_LOG`, defaulting to debug output for the fetchline
    /// crates. Safe to call from every test.
    pub fn init_tracing() {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("fetchline_core=debug,fetchline_runtime=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    }

    /// Poll `predicate` until it holds or `timeout` elapses.
    ///
    /// Returns whether the predicate held in time.
    pub async fn eventually<F>(timeout: Duration, mut predicate: F) -> bool
    where
        F: FnMut() -> bool,
    {
        tokio::time::timeout(timeout, async {
            while !predicate() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .is_ok()
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;
    use serde_json::{Map, Value};

    /// Scalars: null, booleans, integers and short strings
    pub fn json_leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-z0-9 ]{0,8}".prop_map(Value::from),
        ]
    }

    /// Arbitrary JSON, nested up to three levels
    pub fn json_value() -> impl Strategy<Value = Value> {
        json_leaf().prop_recursive(3, 32, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|fields| Value::Object(fields.into_iter().collect())),
            ]
        })
    }

    /// A JSON object usable as a query, without an `id` field
    pub fn json_query() -> impl Strategy<Value = Value> {
        prop::collection::btree_map("[a-z]{1,6}", json_value(), 0..6).prop_map(|mut fields| {
            fields.remove("id");
            Value::Object(fields.into_iter().collect())
        })
    }

    /// Rebuild `value` with every object's keys inserted in reverse order.
    #[must_use]
    pub fn reversed_keys(value: &Value) -> Value {
        match value {
            Value::Object(fields) => {
                let mut reversed = Map::with_capacity(fields.len());
                for (key, inner) in fields.iter().rev() {
                    reversed.insert(key.clone(), reversed_keys(inner));
                }
                Value::Object(reversed)
            },
            Value::Array(items) => Value::Array(items.iter().map(reversed_keys).collect()),
            other => other.clone(),
        }
    }
}

// Re-export commonly used items
pub use helpers::{eventually, init_tracing, request};
pub use mocks::{CountingFetcher, ManualObservable, ObservableController, RecordingListener};

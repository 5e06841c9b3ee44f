//! # Fetchline Core
//!
//! Core types for the Fetchline request-lifecycle engine.
//!
//! Fetchline keeps a cache of requests keyed by a stable identifier and moves
//! each of them through a small lifecycle (`ready`, `pending`, `buffering`,
//! `completed`, ...) by running [`Operation`]s through a pipeline of plugins.
//! This crate holds everything that does not need a runtime:
//!
//! ## Core Concepts
//!
//! - **Request**: a JSON query plus its cache key ([`request`])
//! - **Operation**: the only unit of state change ([`operation`])
//! - **Status**: the lifecycle state machine, a pure function ([`status`])
//! - **Source**: one push protocol over futures, streams, observables,
//!   pull callbacks and plain values ([`source`])
//! - **Plugin**: a named middleware factory, composed into a [`Pipeline`]
//!   ([`plugin`])
//!
//! The client, the fetch plugin and the built-in plugins live in
//! `fetchline-runtime`.
//!
//! ## Example
//!
//! ```
//! use fetchline_core::{Operation, Status, build_request, transition};
//! use serde_json::json;
//!
//! let request = build_request(json!({ "todos": true, "page": 1 })).unwrap();
//! assert_eq!(request.id().as_str(), r#"{"page":1,"todos":true}"#);
//!
//! let status = transition(None, &Operation::fetch(request));
//! assert_eq!(status, Status::Pending);
//! ```

pub mod cache;
pub mod error;
pub mod operation;
pub mod plugin;
pub mod request;
pub mod source;
pub mod status;

pub use cache::{CacheView, EmptyCache, QueryResult, ReadCache};
pub use error::{FetchError, PipelineError, ValidationError};
pub use operation::{Operation, OperationKind};
pub use plugin::{Emitter, Middleware, Next, Pipeline, Plugin, PluginContext, plugin_fn};
pub use request::{Request, RequestId, build_request, canonical_string, canonicalize};
pub use source::{
    Observable, Observer, Producer, Source, SourceKind, Subscriber, Subscription, Teardown,
    classify,
};
pub use status::{Status, transition};

//! Cache entries and the read-only cache view handed to plugins.

use crate::error::FetchError;
use crate::request::RequestId;
use crate::status::Status;
use serde_json::Value;
use std::sync::Arc;

/// The cached state of one request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryResult {
    /// Current lifecycle status
    pub status: Status,
    /// Last value delivered by the producer
    pub data: Option<Value>,
    /// Failure of the last attempt, set only while `status` is `failed`
    pub error: Option<FetchError>,
}

impl QueryResult {
    /// A result with the given status and no data.
    #[must_use]
    pub const fn with_status(status: Status) -> Self {
        Self {
            status,
            data: None,
            error: None,
        }
    }
}

/// Read access to the request store.
///
/// Plugins and fetchers only ever see this view; the store itself is written
/// exclusively by the client's cache sink.
pub trait ReadCache: Send + Sync {
    /// Snapshot of the entry for `id`, if any.
    fn get(&self, id: &RequestId) -> Option<QueryResult>;

    /// Whether an entry exists for `id`.
    fn has(&self, id: &RequestId) -> bool {
        self.get(id).is_some()
    }
}

/// Shared handle to a [`ReadCache`].
pub type CacheView = Arc<dyn ReadCache>;

/// A cache that never holds anything.
///
/// Handy when composing a pipeline outside of a client.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyCache;

impl ReadCache for EmptyCache {
    fn get(&self, _id: &RequestId) -> Option<QueryResult> {
        None
    }
}

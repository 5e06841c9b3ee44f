//! Operations - the only unit of state change.
//!
//! Every change to a request's lifecycle is described by an [`Operation`]
//! flowing through the plugin pipeline. Operations are plain values: once
//! built they are only read, cloned or forwarded.

use crate::error::FetchError;
use crate::request::{Request, RequestId};
use serde_json::Value;
use std::fmt;

/// An event describing a requested state change for one request.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    /// Start (or continue pulling) a request.
    Fetch {
        /// Target request
        request: Request,
    },

    /// Stop an in-flight request.
    Cancel {
        /// Target request
        request: Request,
    },

    /// The producer failed.
    Reject {
        /// Target request
        request: Request,
        /// Failure reported by the producer
        error: FetchError,
    },

    /// The producer delivered a value.
    Put {
        /// Target request
        request: Request,
        /// Delivered value
        data: Value,
        /// `true` when the producer is pull-driven and waits for the next pull
        lazy: bool,
    },

    /// The producer finished.
    Complete {
        /// Target request
        request: Request,
        /// Final value, if the producer resolved with one
        data: Option<Value>,
    },

    /// Evict the request's cache entry.
    Dispose {
        /// Target request
        request: Request,
    },
}

impl Operation {
    /// Build a `Fetch` operation.
    #[must_use]
    pub const fn fetch(request: Request) -> Self {
        Self::Fetch { request }
    }

    /// Build a `Cancel` operation.
    #[must_use]
    pub const fn cancel(request: Request) -> Self {
        Self::Cancel { request }
    }

    /// Build a `Reject` operation.
    #[must_use]
    pub const fn reject(request: Request, error: FetchError) -> Self {
        Self::Reject { request, error }
    }

    /// Build a `Put` operation.
    #[must_use]
    pub const fn put(request: Request, data: Value, lazy: bool) -> Self {
        Self::Put {
            request,
            data,
            lazy,
        }
    }

    /// Build a `Complete` operation.
    #[must_use]
    pub const fn complete(request: Request, data: Option<Value>) -> Self {
        Self::Complete { request, data }
    }

    /// Build a `Dispose` operation.
    #[must_use]
    pub const fn dispose(request: Request) -> Self {
        Self::Dispose { request }
    }

    /// The request this operation targets.
    #[must_use]
    pub const fn request(&self) -> &Request {
        match self {
            Self::Fetch { request }
            | Self::Cancel { request }
            | Self::Reject { request, .. }
            | Self::Put { request, .. }
            | Self::Complete { request, .. }
            | Self::Dispose { request } => request,
        }
    }

    /// Cache key of the target request.
    #[must_use]
    pub const fn key(&self) -> &RequestId {
        self.request().id()
    }

    /// The operation's tag.
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        match self {
            Self::Fetch { .. } => OperationKind::Fetch,
            Self::Cancel { .. } => OperationKind::Cancel,
            Self::Reject { .. } => OperationKind::Reject,
            Self::Put { .. } => OperationKind::Put,
            Self::Complete { .. } => OperationKind::Complete,
            Self::Dispose { .. } => OperationKind::Dispose,
        }
    }

    /// Whether this is a `Put` from a pull-driven producer.
    #[must_use]
    pub const fn is_lazy(&self) -> bool {
        matches!(self, Self::Put { lazy: true, .. })
    }
}

/// Tag of an [`Operation`], used for logging and metrics labels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// See [`Operation::Fetch`]
    Fetch,
    /// See [`Operation::Cancel`]
    Cancel,
    /// See [`Operation::Reject`]
    Reject,
    /// See [`Operation::Put`]
    Put,
    /// See [`Operation::Complete`]
    Complete,
    /// See [`Operation::Dispose`]
    Dispose,
}

impl OperationKind {
    /// Lowercase name of the tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Cancel => "cancel",
            Self::Reject => "reject",
            Self::Put => "put",
            Self::Complete => "complete",
            Self::Dispose => "dispose",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//! Request status and the lifecycle state machine.
//!
//! [`transition`] is a pure function `(status, operation) -> status`. The
//! client calls it twice per operation: once to decide whether the operation
//! is worth running through the pipeline, and once in the cache sink to
//! compute the stored status.
//!
//! ```text
//!              fetch                 put                complete
//!   ready ──────────────▶ pending ─────────▶ buffering ──────────▶ completed
//!     ▲                     │  │                │  │
//!     └──── put(lazy) ──────┘  │                │  └─ put(lazy) ─▶ ready
//!                              ├─ cancel ─▶ cancelled
//!                              └─ reject ─▶ failed
//! ```
//!
//! `dispose` moves any state to `disposed`. Settled and disposed states only
//! react to `fetch`.

use crate::operation::Operation;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Not fetching. Initial status, and the resting status of a pull-driven
    /// source between pulls.
    #[default]
    Ready,
    /// Fetch started, no data yet.
    Pending,
    /// At least one value arrived, more may follow.
    Buffering,
    /// The producer failed.
    Failed,
    /// The request was cancelled.
    Cancelled,
    /// The producer finished.
    Completed,
    /// The cache entry was evicted.
    Disposed,
}

impl Status {
    /// `true` for statuses that expect data or a terminal event.
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Pending | Self::Buffering)
    }

    /// `true` for statuses a request may be refetched from.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Lowercase name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Pending => "pending",
            Self::Buffering => "buffering",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Disposed => "disposed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute the status that follows `current` once `op` is applied.
///
/// `None` stands for an id that has no cache entry and behaves like
/// [`Status::Ready`]. Pairs not covered by the lifecycle leave the status
/// unchanged.
///
/// # Examples
///
/// ```
/// use fetchline_core::{Operation, Request, RequestId, Status, transition};
///
/// let request = Request::from_id(RequestId::new("todos"));
/// let next = transition(None, &Operation::fetch(request.clone()));
/// assert_eq!(next, Status::Pending);
///
/// let next = transition(Some(next), &Operation::cancel(request));
/// assert_eq!(next, Status::Cancelled);
/// ```
#[must_use]
pub fn transition(current: Option<Status>, op: &Operation) -> Status {
    let current = current.unwrap_or_default();

    if let Operation::Dispose { .. } = op {
        return Status::Disposed;
    }

    match current {
        Status::Ready
        | Status::Failed
        | Status::Cancelled
        | Status::Completed
        | Status::Disposed => match op {
            Operation::Fetch { .. } => Status::Pending,
            _ => current,
        },
        Status::Pending | Status::Buffering => match op {
            Operation::Cancel { .. } => Status::Cancelled,
            Operation::Reject { .. } => Status::Failed,
            Operation::Put { lazy: true, .. } => Status::Ready,
            Operation::Put { lazy: false, .. } => Status::Buffering,
            Operation::Complete { .. } => Status::Completed,
            Operation::Fetch { .. } | Operation::Dispose { .. } => current,
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can unwrap
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::request::{Request, RequestId};
    use serde_json::json;

    fn request() -> Request {
        Request::from_id(RequestId::new("r"))
    }

    fn all_ops() -> Vec<Operation> {
        vec![
            Operation::fetch(request()),
            Operation::cancel(request()),
            Operation::reject(request(), FetchError::msg("e")),
            Operation::put(request(), json!(1), false),
            Operation::put(request(), json!(1), true),
            Operation::complete(request(), None),
            Operation::dispose(request()),
        ]
    }

    const ALL: [Status; 7] = [
        Status::Ready,
        Status::Pending,
        Status::Buffering,
        Status::Failed,
        Status::Cancelled,
        Status::Completed,
        Status::Disposed,
    ];

    #[test]
    fn test_dispose_wins_from_every_state() {
        for status in ALL {
            assert_eq!(
                transition(Some(status), &Operation::dispose(request())),
                Status::Disposed,
                "from {status}"
            );
        }
        assert_eq!(transition(None, &Operation::dispose(request())), Status::Disposed);
    }

    #[test]
    fn test_resting_states_only_react_to_fetch() {
        let resting = [
            Status::Ready,
            Status::Failed,
            Status::Cancelled,
            Status::Completed,
            Status::Disposed,
        ];

        for status in resting {
            for op in all_ops() {
                let expected = match op {
                    Operation::Fetch { .. } => Status::Pending,
                    Operation::Dispose { .. } => Status::Disposed,
                    _ => status,
                };
                assert_eq!(transition(Some(status), &op), expected, "{status} + {}", op.kind());
            }
        }
    }

    #[test]
    fn test_in_flight_table() {
        for status in [Status::Pending, Status::Buffering] {
            let expected = [
                status,
                Status::Cancelled,
                Status::Failed,
                Status::Buffering,
                Status::Ready,
                Status::Completed,
                Status::Disposed,
            ];
            for (op, want) in all_ops().iter().zip(expected) {
                assert_eq!(transition(Some(status), op), want, "{status} + {}", op.kind());
            }
        }
    }

    #[test]
    fn test_unseen_id_behaves_like_ready() {
        for op in all_ops() {
            assert_eq!(transition(None, &op), transition(Some(Status::Ready), &op));
        }
    }

    #[test]
    fn test_status_helpers() {
        assert!(Status::Pending.is_in_flight());
        assert!(Status::Buffering.is_in_flight());
        assert!(!Status::Ready.is_in_flight());
        assert!(Status::Failed.is_settled());
        assert!(!Status::Disposed.is_settled());
        assert_eq!(Status::default(), Status::Ready);
        assert_eq!(serde_json::to_string(&Status::Cancelled).unwrap(), "\"cancelled\"");
    }
}

//! Request identity.
//!
//! A [`Request`] pairs the caller's query with a stable [`RequestId`]. The id
//! is either supplied by the caller (an `"id"` field on the query) or derived
//! by serializing the query canonically: object keys are sorted recursively,
//! array order is kept.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Stable identifier of a logical request.
///
/// # Examples
///
/// ```
/// use fetchline_core::RequestId;
///
/// let id = RequestId::new("todos");
/// assert_eq!(id.as_str(), "todos");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    /// Create a new `RequestId` from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert the id into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for RequestId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A caller's logical fetch: the query plus its identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    id: RequestId,
    query: Value,
}

impl Request {
    /// A request carrying only an id.
    ///
    /// Used for operations that address a cache entry without a query, such as
    /// eviction.
    #[must_use]
    pub const fn from_id(id: RequestId) -> Self {
        Self {
            id,
            query: Value::Null,
        }
    }

    /// The request id.
    #[must_use]
    pub const fn id(&self) -> &RequestId {
        &self.id
    }

    /// The original query.
    #[must_use]
    pub const fn query(&self) -> &Value {
        &self.query
    }

    /// Look up a top-level field of the query.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.query.get(name)
    }
}

impl TryFrom<Value> for Request {
    type Error = ValidationError;

    fn try_from(query: Value) -> Result<Self, Self::Error> {
        build_request(query)
    }
}

/// Build a [`Request`] from a query value.
///
/// A non-empty `"id"` field (string or number) is used verbatim. Otherwise the
/// id is the canonical serialization of the whole query.
///
/// # Errors
///
/// Returns [`ValidationError::NotAnObject`] when `query` is not a JSON object.
///
/// # Examples
///
/// ```
/// use fetchline_core::build_request;
/// use serde_json::json;
///
/// let a = build_request(json!({ "a": 1, "b": 2 })).unwrap();
/// let b = build_request(json!({ "b": 2, "a": 1 })).unwrap();
/// assert_eq!(a.id(), b.id());
///
/// let explicit = build_request(json!({ "id": "todos", "page": 3 })).unwrap();
/// assert_eq!(explicit.id().as_str(), "todos");
/// ```
pub fn build_request(query: Value) -> Result<Request, ValidationError> {
    let Value::Object(fields) = &query else {
        return Err(ValidationError::NotAnObject(kind_of(&query)));
    };

    let id = explicit_id(fields).unwrap_or_else(|| canonical_string(&query));

    Ok(Request {
        id: RequestId(id),
        query,
    })
}

fn explicit_id(fields: &Map<String, Value>) -> Option<String> {
    match fields.get("id")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Rebuild a value with every object's keys in sorted order.
///
/// Arrays keep their element order.
#[must_use]
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(fields) => {
            let mut keys: Vec<&String> = fields.keys().collect();
            keys.sort();

            let mut sorted = Map::with_capacity(fields.len());
            for key in keys {
                if let Some(inner) = fields.get(key) {
                    sorted.insert(key.clone(), canonicalize(inner));
                }
            }
            Value::Object(sorted)
        },
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Canonical JSON text of a value (see [`canonicalize`]).
#[must_use]
pub fn canonical_string(value: &Value) -> String {
    canonicalize(value).to_string()
}

const fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can unwrap
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_does_not_change_id() {
        let a = build_request(json!({ "a": 1, "b": 2 })).unwrap();
        let b = build_request(json!({ "b": 2, "a": 1 })).unwrap();
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_nested_key_order_does_not_change_id() {
        let a = build_request(json!({ "filter": { "x": 1, "y": [ { "p": 1, "q": 2 } ] } })).unwrap();
        let b = build_request(json!({ "filter": { "y": [ { "q": 2, "p": 1 } ], "x": 1 } })).unwrap();
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_array_order_changes_id() {
        let a = build_request(json!({ "arr": [1, 2] })).unwrap();
        let b = build_request(json!({ "arr": [2, 1] })).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_explicit_id_is_used_verbatim() {
        let request = build_request(json!({ "id": "b-then-a", "z": 1, "a": 2 })).unwrap();
        assert_eq!(request.id().as_str(), "b-then-a");
        assert_eq!(request.field("z"), Some(&json!(1)));
    }

    #[test]
    fn test_numeric_id_is_used() {
        let request = build_request(json!({ "id": 42 })).unwrap();
        assert_eq!(request.id().as_str(), "42");
    }

    #[test]
    fn test_empty_id_falls_back_to_canonical_form() {
        let request = build_request(json!({ "id": "", "b": 1 })).unwrap();
        assert_eq!(request.id().as_str(), r#"{"b":1,"id":""}"#);
    }

    #[test]
    fn test_empty_query_has_stable_id() {
        let request = build_request(json!({})).unwrap();
        assert_eq!(request.id().as_str(), "{}");
    }

    #[test]
    fn test_non_object_queries_are_rejected() {
        assert_eq!(
            build_request(json!([1, 2])),
            Err(ValidationError::NotAnObject("an array"))
        );
        assert_eq!(
            build_request(json!("todos")),
            Err(ValidationError::NotAnObject("a string"))
        );
        assert_eq!(build_request(Value::Null), Err(ValidationError::NotAnObject("null")));
    }

    #[test]
    fn test_from_id_has_no_query() {
        let request = Request::from_id(RequestId::new("gone"));
        assert_eq!(request.id().as_str(), "gone");
        assert!(request.query().is_null());
    }
}

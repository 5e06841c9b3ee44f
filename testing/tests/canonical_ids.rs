//! Property tests for request identity.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use fetchline_core::{Status, ValidationError, build_request, canonical_string};
use fetchline_runtime::Client;
use fetchline_testing::properties::{json_leaf, json_query, json_value, reversed_keys};
use fetchline_testing::{CountingFetcher, RecordingListener, eventually};
use proptest::prelude::*;
use serde_json::{Value, json};
use std::time::Duration;

proptest! {
    /// Key order never changes the id of a query.
    #[test]
    fn prop_id_ignores_key_order(query in json_query()) {
        let a = build_request(query.clone()).unwrap();
        let b = build_request(reversed_keys(&query)).unwrap();
        prop_assert_eq!(a.id(), b.id());
    }

    /// Without an `id` field the id is the canonical serialization.
    #[test]
    fn prop_id_is_canonical_json(query in json_query()) {
        let request = build_request(query.clone()).unwrap();
        prop_assert_eq!(request.id().as_str(), canonical_string(&query));

        let parsed: Value = serde_json::from_str(request.id().as_str()).unwrap();
        prop_assert_eq!(parsed, query);
    }

    /// A non-empty string `id` wins over every other field.
    #[test]
    fn prop_explicit_id_is_used_verbatim(query in json_query(), id in "[a-z0-9:-]{1,12}") {
        let mut query = query;
        query["id"] = Value::from(id.clone());
        let request = build_request(query).unwrap();
        prop_assert_eq!(request.id().as_str(), id.as_str());
    }

    /// Array element order is significant.
    #[test]
    fn prop_array_order_changes_the_id(a in json_value(), b in json_value()) {
        prop_assume!(a != b);
        let forward = build_request(json!({ "items": [a.clone(), b.clone()] })).unwrap();
        let backward = build_request(json!({ "items": [b, a] })).unwrap();
        prop_assert_ne!(forward.id(), backward.id());
    }

    /// Only JSON objects are queries.
    #[test]
    fn prop_scalars_are_rejected(value in json_leaf()) {
        let err = build_request(value).unwrap_err();
        prop_assert!(matches!(err, ValidationError::NotAnObject(_)));
    }
}

#[test]
fn test_numeric_id_is_used() {
    let request = build_request(json!({ "id": 42, "page": 1 })).unwrap();
    assert_eq!(request.id().as_str(), "42");
}

#[test]
fn test_empty_id_falls_back_to_canonical_form() {
    let request = build_request(json!({ "id": "", "b": 1, "a": 2 })).unwrap();
    assert_eq!(request.id().as_str(), r#"{"a":2,"b":1,"id":""}"#);
}

#[tokio::test]
async fn test_reordered_queries_share_one_fetch() {
    let fetcher = CountingFetcher::resolving(json!(["row"]));
    let client = Client::builder(fetcher.clone()).build().unwrap();

    let first = RecordingListener::new();
    let second = RecordingListener::new();
    let a = build_request(json!({ "table": "todos", "filter": { "done": false, "owner": 7 } })).unwrap();
    let b = build_request(json!({ "filter": { "owner": 7, "done": false }, "table": "todos" })).unwrap();

    let _a = client.fetch(&a, Some(first.listener()));
    let _b = client.fetch(&b, Some(second.listener()));

    assert!(
        eventually(Duration::from_secs(2), || {
            second.last_status() == Some(Status::Completed)
        })
        .await
    );
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(first.last(), second.last());
}

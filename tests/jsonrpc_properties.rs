//! Property tests for the JSON-RPC framing law (spec §8: "round-trip
//! `decode(encode(frame)) == frame` for all valid frames").

use mcp_broker::types::{decode, encode, Frame};
use proptest::prelude::*;
use serde_json::{json, Value};

fn arb_id() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::from),
        "[a-zA-Z0-9_-]{1,16}".prop_map(Value::from),
    ]
}

fn arb_request() -> impl Strategy<Value = Frame> {
    (arb_id(), "[a-z/]{1,24}").prop_map(|(id, method)| Frame::request(id, method, None))
}

fn arb_notification() -> impl Strategy<Value = Frame> {
    "[a-z/]{1,24}".prop_map(|method| Frame::notification(method, None))
}

fn arb_response_ok() -> impl Strategy<Value = Frame> {
    arb_id().prop_map(|id| Frame::response_ok(id, json!({"ok": true})))
}

proptest! {
    #[test]
    fn request_round_trips(frame in arb_request()) {
        let bytes = encode(&frame).unwrap();
        let decoded = decode(&bytes).unwrap();
        prop_assert_eq!(decoded.id, frame.id);
        prop_assert_eq!(decoded.method, frame.method);
        prop_assert_eq!(decoded.jsonrpc, frame.jsonrpc);
    }

    #[test]
    fn notification_round_trips(frame in arb_notification()) {
        let bytes = encode(&frame).unwrap();
        let decoded = decode(&bytes).unwrap();
        prop_assert!(decoded.id.is_none());
        prop_assert_eq!(decoded.method, frame.method);
    }

    #[test]
    fn response_round_trips_preserving_id_type(frame in arb_response_ok()) {
        let bytes = encode(&frame).unwrap();
        let decoded = decode(&bytes).unwrap();
        // The id's JSON type (number vs string) must survive the
        // round-trip bit-for-bit, per spec §4.A.
        prop_assert_eq!(decoded.id, frame.id);
        prop_assert_eq!(decoded.result, frame.result);
    }
}

#[test]
fn bad_version_is_rejected_on_decode() {
    let bytes = br#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#;
    assert!(decode(bytes).is_err());
}

#[test]
fn response_with_both_result_and_error_is_rejected() {
    let bytes = br#"{"jsonrpc":"2.0","id":1,"result":"x","error":{"code":-1,"message":"bad"}}"#;
    assert!(decode(bytes).is_err());
}

#[test]
fn unknown_top_level_fields_are_ignored_on_decode() {
    let bytes = br#"{"jsonrpc":"2.0","id":1,"method":"ping","extra_vendor_field":true}"#;
    let frame = decode(bytes).unwrap();
    assert_eq!(frame.method.as_deref(), Some("ping"));
}

use serde_json::json;

use super::*;
use crate::message::MessageType;

fn ids(stream: &MessageStream) -> Vec<String> {
    stream.snapshot().into_iter().map(|m| m.id).collect()
}

#[test]
fn seed_then_append_preserves_order() {
    let stream = MessageStream::new();
    stream.seed_history(vec![
        json!({"id": "m1", "type": "CHAT", "sender": "a", "content": "1"}),
        json!({"id": "m2", "type": "CHAT", "sender": "b", "content": "2"}),
    ]);
    stream.append(r#"{"id":"m3","type":"CHAT","sender":"a","content":"3"}"#);
    stream.append(r#"{"id":"m4","type":"LEAVE","sender":"b"}"#);

    assert_eq!(ids(&stream), vec!["m1", "m2", "m3", "m4"]);
}

#[test]
fn seed_history_replaces_log_wholesale() {
    let stream = MessageStream::new();
    stream.append(r#"{"id":"old","type":"CHAT","sender":"a"}"#);
    stream.seed_history(vec![json!({"id": "h1", "type": "CHAT", "sender": "a"})]);
    assert_eq!(ids(&stream), vec!["h1"]);
}

#[test]
fn seed_history_skips_malformed_records() {
    let stream = MessageStream::new();
    stream.seed_history(vec![json!("just text"), json!({"id": "ok", "type": "JOIN", "sender": "a"}), json!(3)]);
    assert_eq!(ids(&stream), vec!["ok"]);
}

#[test]
fn append_drops_non_json_bodies() {
    let stream = MessageStream::new();
    assert!(stream.append("hello there").is_none());
    assert!(stream.is_empty());
}

#[test]
fn append_keeps_duplicates_and_unknown_types() {
    let stream = MessageStream::new();
    let body = r#"{"id":"x","type":"CHAT","sender":"a","content":"same"}"#;
    stream.append(body);
    stream.append(body);
    let unknown = stream.append(r#"{"type":"TYPING","sender":"a"}"#).expect("stored");

    assert_eq!(unknown.kind, MessageType::Unknown);
    assert_eq!(stream.len(), 3);
    assert_eq!(stream.rendered("a").len(), 2);
}

#[test]
fn updates_counter_advances_on_each_mutation() {
    let stream = MessageStream::new();
    let updates = stream.updates();
    stream.seed_history(Vec::new());
    stream.append(r#"{"type":"JOIN","sender":"a"}"#);
    assert_eq!(*updates.borrow(), 2);
}

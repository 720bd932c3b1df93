//! API surface tests. These don't need Postgres.

use outreach_events::{AppendEvent, StoredEvent};
use serde_json::json;
use uuid::Uuid;

#[test]
fn append_event_minimal_construction() {
    let event = AppendEvent::new("lead_replied", json!({"lead_id": "x"}));
    assert_eq!(event.event_type, "lead_replied");
    assert!(event.subject_id.is_none());
    assert!(event.actor.is_none());
    assert_eq!(event.schema_v, 1);
}

#[test]
fn append_event_full_builder_chain() {
    let subject = Uuid::new_v4();
    let event = AppendEvent::new("manual_cancel", json!({}))
        .with_subject(subject)
        .with_actor("ingestor")
        .with_schema_v(2);

    assert_eq!(event.subject_id, Some(subject));
    assert_eq!(event.actor.as_deref(), Some("ingestor"));
    assert_eq!(event.schema_v, 2);
}

#[test]
fn stored_event_is_serializable() {
    let stored = StoredEvent {
        seq: 42,
        ts: chrono::Utc::now(),
        event_type: "credit_exhausted".to_string(),
        subject_id: Some(Uuid::new_v4()),
        actor: Some("scheduler".to_string()),
        payload: json!({"company_id": "c"}),
        schema_v: 1,
    };

    let json = serde_json::to_value(&stored).unwrap();
    assert_eq!(json["seq"], 42);
    assert_eq!(json["event_type"], "credit_exhausted");
    assert_eq!(json["payload"]["company_id"], "c");
}

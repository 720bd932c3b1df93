//! Journal: append-only record of ingested events and notifications.
//!
//! Anything that implements `EventLike` can be journaled. Production writes go
//! to the Postgres `EventStore`; tests use `MemoryJournal`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use outreach_events::{AppendEvent, EventStore, StoredEvent};

/// A fact with a stable type string and an optional subject it is about.
pub trait EventLike: Serialize + Send + Sync {
    /// The value stored in the `event_type` column.
    fn event_type_str(&self) -> String;

    /// The enrollment, lead, company or sequence this fact concerns.
    fn subject_id(&self) -> Option<Uuid>;
}

#[async_trait]
pub trait Journal: Send + Sync {
    async fn append(&self, event: AppendEvent) -> Result<StoredEvent>;

    /// Everything recorded about one subject, oldest first.
    async fn by_subject(&self, subject_id: Uuid) -> Result<Vec<StoredEvent>>;
}

/// Serialize and append an `EventLike` under the given actor.
pub async fn record<E: EventLike>(journal: &dyn Journal, event: &E, actor: &str) -> Result<StoredEvent> {
    let mut append = AppendEvent::new(event.event_type_str(), serde_json::to_value(event)?)
        .with_actor(actor);
    if let Some(subject) = event.subject_id() {
        append = append.with_subject(subject);
    }
    journal.append(append).await
}

#[async_trait]
impl Journal for EventStore {
    async fn append(&self, event: AppendEvent) -> Result<StoredEvent> {
        EventStore::append(self, event).await
    }

    async fn by_subject(&self, subject_id: Uuid) -> Result<Vec<StoredEvent>> {
        self.read_by_subject(subject_id).await
    }
}

/// In-memory journal. Assigns incrementing sequence numbers.
pub struct MemoryJournal {
    next_seq: AtomicI64,
    events: Mutex<Vec<StoredEvent>>,
}

impl Default for MemoryJournal {
    fn default() -> Self {
        Self {
            next_seq: AtomicI64::new(1),
            events: Mutex::new(Vec::new()),
        }
    }
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StoredEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<StoredEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn append(&self, event: AppendEvent) -> Result<StoredEvent> {
        let stored = StoredEvent {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            ts: Utc::now(),
            event_type: event.event_type,
            subject_id: event.subject_id,
            actor: event.actor,
            payload: event.payload,
            schema_v: event.schema_v,
        };
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(stored.clone());
        Ok(stored)
    }

    async fn by_subject(&self, subject_id: Uuid) -> Result<Vec<StoredEvent>> {
        Ok(self
            .events()
            .into_iter()
            .filter(|e| e.subject_id == Some(subject_id))
            .collect())
    }
}

#[async_trait]
impl<J: Journal + ?Sized> Journal for Arc<J> {
    async fn append(&self, event: AppendEvent) -> Result<StoredEvent> {
        (**self).append(event).await
    }

    async fn by_subject(&self, subject_id: Uuid) -> Result<Vec<StoredEvent>> {
        (**self).by_subject(subject_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Ping {
        target: Uuid,
    }

    impl EventLike for Ping {
        fn event_type_str(&self) -> String {
            "ping".to_string()
        }

        fn subject_id(&self) -> Option<Uuid> {
            Some(self.target)
        }
    }

    #[tokio::test]
    async fn record_serializes_with_subject_and_actor() {
        let journal = MemoryJournal::new();
        let target = Uuid::new_v4();

        let first = record(&journal, &Ping { target }, "test").await.unwrap();
        let second = record(&journal, &Ping { target }, "test").await.unwrap();

        assert_eq!(first.seq + 1, second.seq);
        assert_eq!(first.event_type, "ping");
        assert_eq!(first.subject_id, Some(target));
        assert_eq!(first.actor.as_deref(), Some("test"));
        assert_eq!(first.payload["target"], serde_json::json!(target));
        assert_eq!(journal.events_of_type("ping").len(), 2);
    }

    #[tokio::test]
    async fn by_subject_returns_only_that_subject_in_order() {
        let journal = MemoryJournal::new();
        let target = Uuid::new_v4();

        record(&journal, &Ping { target }, "scheduler").await.unwrap();
        record(&journal, &Ping { target: Uuid::new_v4() }, "scheduler").await.unwrap();
        record(&journal, &Ping { target }, "ingestor").await.unwrap();

        let history = journal.by_subject(target).await.unwrap();
        let actors: Vec<_> = history.iter().map(|e| e.actor.as_deref()).collect();
        assert_eq!(actors, vec![Some("scheduler"), Some("ingestor")]);
        assert!(history[0].seq < history[1].seq);
    }
}

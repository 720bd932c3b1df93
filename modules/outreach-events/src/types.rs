use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One journaled fact, as read back from the `events` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredEvent {
    pub seq: i64,
    pub ts: DateTime<Utc>,
    pub event_type: String,
    /// The enrollment, lead, company or sequence the fact is about.
    pub subject_id: Option<Uuid>,
    /// Which component recorded it, e.g. `ingestor` or `scheduler`.
    pub actor: Option<String>,
    pub payload: serde_json::Value,
    pub schema_v: i16,
}

impl StoredEvent {
    /// Deserialize the payload back into the type that produced it.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.payload)
    }
}

/// A fact waiting to be journaled. `seq` and `ts` are assigned on append.
#[derive(Debug, Clone)]
pub struct AppendEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub subject_id: Option<Uuid>,
    pub actor: Option<String>,
    pub schema_v: i16,
}

impl AppendEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            subject_id: None,
            actor: None,
            schema_v: 1,
        }
    }

    pub fn with_subject(mut self, subject_id: Uuid) -> Self {
        self.subject_id = Some(subject_id);
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_schema_v(mut self, v: i16) -> Self {
        self.schema_v = v;
        self
    }
}

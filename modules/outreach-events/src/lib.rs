//! Append-only journal of engagement facts.
//!
//! Stores opaque JSONB payloads keyed by event type and an optional subject
//! (the enrollment, lead, or company the fact is about). Knows nothing about
//! sequences or credits; callers bring their own serializable event types.

pub mod store;
pub mod types;

pub use store::EventStore;
pub use types::{AppendEvent, StoredEvent};

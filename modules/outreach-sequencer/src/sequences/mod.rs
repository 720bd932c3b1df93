//! Sequence definition store. Definitions are versioned and immutable once
//! published; the scheduler always reads the exact version an enrollment is
//! bound to.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use outreach_common::{EngagementSequence, Result};

pub use memory::MemorySequenceCatalog;
pub use postgres::PgSequenceCatalog;

#[async_trait]
pub trait SequenceCatalog: Send + Sync {
    /// Store `sequence` as the next version of its id. The version and active
    /// flag on the argument are ignored; the stored copy is returned.
    async fn publish(&self, sequence: EngagementSequence) -> Result<EngagementSequence>;

    /// One exact version. `None` if it was never published.
    async fn version(&self, sequence_id: Uuid, version: u32) -> Result<Option<EngagementSequence>>;

    /// The highest published version.
    async fn latest(&self, sequence_id: Uuid) -> Result<Option<EngagementSequence>>;

    /// Flip the active flag on every version of the sequence. Returns false if
    /// the sequence is unknown.
    async fn set_active(&self, sequence_id: Uuid, active: bool) -> Result<bool>;

    /// Latest version of every active sequence owned by the company.
    async fn active_sequences(&self, company_id: Uuid) -> Result<Vec<EngagementSequence>>;
}

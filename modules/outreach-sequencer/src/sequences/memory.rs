use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use outreach_common::{EngagementSequence, Result};

use super::SequenceCatalog;

#[derive(Default)]
pub struct MemorySequenceCatalog {
    // sequence id -> version -> definition
    versions: RwLock<BTreeMap<Uuid, BTreeMap<u32, EngagementSequence>>>,
}

impl MemorySequenceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop one stored version, as if it had been purged.
    pub fn remove_version(&self, sequence_id: Uuid, version: u32) -> bool {
        self.versions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&sequence_id)
            .is_some_and(|versions| versions.remove(&version).is_some())
    }
}

#[async_trait]
impl SequenceCatalog for MemorySequenceCatalog {
    async fn publish(&self, mut sequence: EngagementSequence) -> Result<EngagementSequence> {
        sequence.normalize()?;

        let mut all = self.versions.write().unwrap_or_else(PoisonError::into_inner);
        let versions = all.entry(sequence.id).or_default();
        let (next, active) = match versions.last_key_value() {
            Some((v, prev)) => (v + 1, prev.is_active),
            None => (1, true),
        };
        sequence.version = next;
        sequence.is_active = active;
        versions.insert(next, sequence.clone());
        Ok(sequence)
    }

    async fn version(&self, sequence_id: Uuid, version: u32) -> Result<Option<EngagementSequence>> {
        Ok(self
            .versions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&sequence_id)
            .and_then(|versions| versions.get(&version))
            .cloned())
    }

    async fn latest(&self, sequence_id: Uuid) -> Result<Option<EngagementSequence>> {
        Ok(self
            .versions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&sequence_id)
            .and_then(|versions| versions.last_key_value())
            .map(|(_, seq)| seq.clone()))
    }

    async fn set_active(&self, sequence_id: Uuid, active: bool) -> Result<bool> {
        let mut all = self.versions.write().unwrap_or_else(PoisonError::into_inner);
        let Some(versions) = all.get_mut(&sequence_id) else {
            return Ok(false);
        };
        for seq in versions.values_mut() {
            seq.is_active = active;
        }
        Ok(true)
    }

    async fn active_sequences(&self, company_id: Uuid) -> Result<Vec<EngagementSequence>> {
        Ok(self
            .versions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(|versions| versions.last_key_value().map(|(_, seq)| seq))
            .filter(|seq| seq.company_id == company_id && seq.is_active)
            .cloned()
            .collect())
    }
}

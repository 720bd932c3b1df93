use thiserror::Error;
use uuid::Uuid;

use crate::types::ParseEnumError;

#[derive(Error, Debug)]
pub enum SequencerError {
    #[error("Insufficient credit for company {company_id}: requested {requested}, available {available}")]
    InsufficientCredit {
        company_id: Uuid,
        requested: u64,
        available: u64,
    },

    #[error("Retryable executor failure: {0}")]
    RetryableExecutorFailure(String),

    #[error("Fatal executor failure: {0}")]
    FatalExecutorFailure(String),

    #[error("Concurrent modification of enrollment {enrollment_id}")]
    ConcurrentModification { enrollment_id: Uuid },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Lead {lead_id} already has an open enrollment")]
    AlreadyEnrolled { lead_id: Uuid },

    #[error("Sequence {0} is not active")]
    SequenceInactive(Uuid),

    #[error("Invalid sequence: {0}")]
    InvalidSequence(String),

    #[error("Lead {0} has converted and cannot be enrolled")]
    LeadConverted(Uuid),

    #[error("Lead and sequence belong to different companies")]
    CompanyMismatch,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Parse(#[from] ParseEnumError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl SequencerError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }

    /// Errors the scheduler recovers from without operator action.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InsufficientCredit { .. }
                | Self::RetryableExecutorFailure(_)
                | Self::ConcurrentModification { .. }
        )
    }
}

pub type Result<T, E = SequencerError> = std::result::Result<T, E>;

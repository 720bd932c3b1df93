//! External events the engine reacts to.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use outreach_common::LeadTemperature;

use crate::journal::EventLike;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngagementEvent {
    LeadReplied {
        lead_id: Uuid,
    },
    TemperatureOverride {
        lead_id: Uuid,
        temperature: LeadTemperature,
    },
    CreditsReplenished {
        company_id: Uuid,
        amount: u64,
    },
    ManualCancel {
        enrollment_id: Uuid,
    },
    ResumeEnrollment {
        enrollment_id: Uuid,
    },
    SequenceDeactivated {
        sequence_id: Uuid,
    },
}

impl EngagementEvent {
    pub fn type_str(&self) -> &'static str {
        match self {
            Self::LeadReplied { .. } => "lead_replied",
            Self::TemperatureOverride { .. } => "temperature_override",
            Self::CreditsReplenished { .. } => "credits_replenished",
            Self::ManualCancel { .. } => "manual_cancel",
            Self::ResumeEnrollment { .. } => "resume_enrollment",
            Self::SequenceDeactivated { .. } => "sequence_deactivated",
        }
    }
}

impl EventLike for EngagementEvent {
    fn event_type_str(&self) -> String {
        format!("event.{}", self.type_str())
    }

    fn subject_id(&self) -> Option<Uuid> {
        Some(match self {
            Self::LeadReplied { lead_id } | Self::TemperatureOverride { lead_id, .. } => *lead_id,
            Self::CreditsReplenished { company_id, .. } => *company_id,
            Self::ManualCancel { enrollment_id } | Self::ResumeEnrollment { enrollment_id } => {
                *enrollment_id
            }
            Self::SequenceDeactivated { sequence_id } => *sequence_id,
        })
    }
}

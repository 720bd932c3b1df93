//! Step executor: validates a step's payload and hands the action to a
//! delivery channel. Transport concerns stay behind `DeliveryChannel`.

pub mod webhook;

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use outreach_common::ActionKind;

pub use webhook::WebhookChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageChannel {
    Email,
    Sms,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MessagePayload {
    pub channel: MessageChannel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TagPayload {
    pub tag: String,
}

/// A step's action with its payload parsed into the shape its kind requires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "action_kind", content = "payload", rename_all = "snake_case")]
pub enum StepAction {
    SendMessage(MessagePayload),
    Wait,
    WaitForReply,
    TagLead(TagPayload),
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: ActionKind,
        source: serde_json::Error,
    },

    #[error("invalid {kind} payload: {message}")]
    Invalid { kind: ActionKind, message: String },
}

impl StepAction {
    pub fn from_parts(kind: ActionKind, payload: &serde_json::Value) -> Result<Self, PayloadError> {
        let malformed = |source| PayloadError::Malformed { kind, source };
        let invalid = |message: &str| PayloadError::Invalid {
            kind,
            message: message.to_string(),
        };

        match kind {
            ActionKind::SendMessage => {
                let message = MessagePayload::deserialize(payload).map_err(malformed)?;
                if message.body.trim().is_empty() {
                    return Err(invalid("message body is empty"));
                }
                if message.channel == MessageChannel::Sms && message.subject.is_some() {
                    return Err(invalid("sms messages have no subject"));
                }
                Ok(Self::SendMessage(message))
            }
            ActionKind::TagLead => {
                let tag = TagPayload::deserialize(payload).map_err(malformed)?;
                if tag.tag.trim().is_empty() {
                    return Err(invalid("tag is empty"));
                }
                Ok(Self::TagLead(tag))
            }
            ActionKind::Wait => Ok(Self::Wait),
            ActionKind::WaitForReply => Ok(Self::WaitForReply),
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Self::SendMessage(_) => ActionKind::SendMessage,
            Self::Wait => ActionKind::Wait,
            Self::WaitForReply => ActionKind::WaitForReply,
            Self::TagLead(_) => ActionKind::TagLead,
        }
    }

    /// Whether running this action touches a delivery channel.
    pub fn needs_delivery(&self) -> bool {
        matches!(self, Self::SendMessage(_) | Self::TagLead(_))
    }
}

/// Outcome of one executor invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    Success,
    RetryableFailure(String),
    FatalFailure(String),
}

/// Who and what a step is being executed for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepContext {
    pub enrollment_id: Uuid,
    pub lead_id: Uuid,
    pub company_id: Uuid,
    pub sequence_id: Uuid,
    pub sequence_version: u32,
    pub step_position: u32,
    /// 1 for the first try of this step.
    pub attempt: u32,
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        ctx: &StepContext,
        action_kind: ActionKind,
        payload: &serde_json::Value,
    ) -> ExecutionResult;
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DeliveryError {
    pub retryable: bool,
    pub message: String,
}

impl DeliveryError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

/// Transport for actions that leave the engine.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn deliver(&self, ctx: &StepContext, action: &StepAction) -> Result<(), DeliveryError>;
}

/// Channel that only logs. Used when no delivery endpoint is configured.
pub struct LogChannel;

#[async_trait]
impl DeliveryChannel for LogChannel {
    async fn deliver(&self, ctx: &StepContext, action: &StepAction) -> Result<(), DeliveryError> {
        info!(
            enrollment_id = %ctx.enrollment_id,
            lead_id = %ctx.lead_id,
            action_kind = %action.kind(),
            "Delivery channel not configured, logging action only"
        );
        Ok(())
    }
}

/// Executes steps by validating the payload and dispatching to a channel.
pub struct ChannelExecutor {
    channel: Arc<dyn DeliveryChannel>,
}

impl ChannelExecutor {
    pub fn new(channel: Arc<dyn DeliveryChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl StepExecutor for ChannelExecutor {
    async fn execute(
        &self,
        ctx: &StepContext,
        action_kind: ActionKind,
        payload: &serde_json::Value,
    ) -> ExecutionResult {
        let action = match StepAction::from_parts(action_kind, payload) {
            Ok(action) => action,
            Err(e) => {
                warn!(enrollment_id = %ctx.enrollment_id, error = %e, "Rejecting step payload");
                return ExecutionResult::FatalFailure(e.to_string());
            }
        };

        if !action.needs_delivery() {
            debug!(enrollment_id = %ctx.enrollment_id, %action_kind, "No delivery needed");
            return ExecutionResult::Success;
        }

        match self.channel.deliver(ctx, &action).await {
            Ok(()) => ExecutionResult::Success,
            Err(e) if e.retryable => ExecutionResult::RetryableFailure(e.message),
            Err(e) => ExecutionResult::FatalFailure(e.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct RecordingChannel {
        delivered: Mutex<Vec<StepAction>>,
        fail_with: Option<DeliveryError>,
    }

    impl RecordingChannel {
        fn new(fail_with: Option<DeliveryError>) -> Arc<Self> {
            Arc::new(Self {
                delivered: Mutex::new(Vec::new()),
                fail_with,
            })
        }
    }

    #[async_trait]
    impl DeliveryChannel for RecordingChannel {
        async fn deliver(&self, _ctx: &StepContext, action: &StepAction) -> Result<(), DeliveryError> {
            self.delivered.lock().unwrap().push(action.clone());
            match &self.fail_with {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }
    }

    fn ctx() -> StepContext {
        StepContext {
            enrollment_id: Uuid::new_v4(),
            lead_id: Uuid::new_v4(),
            company_id: Uuid::new_v4(),
            sequence_id: Uuid::new_v4(),
            sequence_version: 1,
            step_position: 1,
            attempt: 1,
        }
    }

    #[test]
    fn parses_message_payload() {
        let action = StepAction::from_parts(
            ActionKind::SendMessage,
            &json!({"channel": "email", "subject": "Hello", "body": "Hi there"}),
        )
        .unwrap();
        assert_eq!(
            action,
            StepAction::SendMessage(MessagePayload {
                channel: MessageChannel::Email,
                subject: Some("Hello".into()),
                body: "Hi there".into(),
            })
        );
    }

    #[test]
    fn rejects_bad_payloads() {
        let cases = [
            (ActionKind::SendMessage, json!({"channel": "fax", "body": "x"})),
            (ActionKind::SendMessage, json!({"channel": "email", "body": "  "})),
            (ActionKind::SendMessage, json!({"channel": "sms", "subject": "s", "body": "x"})),
            (ActionKind::SendMessage, json!({"channel": "email", "body": "x", "extra": 1})),
            (ActionKind::TagLead, json!({})),
            (ActionKind::TagLead, json!({"tag": ""})),
        ];
        for (kind, payload) in cases {
            assert!(
                StepAction::from_parts(kind, &payload).is_err(),
                "expected {kind} {payload} to be rejected"
            );
        }
    }

    #[test]
    fn wait_steps_ignore_payload() {
        assert_eq!(
            StepAction::from_parts(ActionKind::Wait, &json!(null)).unwrap(),
            StepAction::Wait
        );
        assert_eq!(
            StepAction::from_parts(ActionKind::WaitForReply, &json!({"anything": true})).unwrap(),
            StepAction::WaitForReply
        );
    }

    #[test]
    fn serialized_action_is_tagged_by_kind() {
        let action = StepAction::TagLead(TagPayload { tag: "vip".into() });
        assert_eq!(
            serde_json::to_value(&action).unwrap(),
            json!({"action_kind": "tag_lead", "payload": {"tag": "vip"}})
        );
    }

    #[tokio::test]
    async fn malformed_payload_is_fatal_and_never_delivered() {
        let channel = RecordingChannel::new(None);
        let executor = ChannelExecutor::new(channel.clone());

        let result = executor
            .execute(&ctx(), ActionKind::SendMessage, &json!({"body": 5}))
            .await;
        assert!(matches!(result, ExecutionResult::FatalFailure(_)));
        assert!(channel.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn waits_succeed_without_delivery() {
        let channel = RecordingChannel::new(Some(DeliveryError::fatal("should not be called")));
        let executor = ChannelExecutor::new(channel.clone());

        let result = executor.execute(&ctx(), ActionKind::Wait, &json!({})).await;
        assert_eq!(result, ExecutionResult::Success);
        assert!(channel.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delivery_errors_map_to_execution_results() {
        let payload = json!({"tag": "hot"});

        let retry = ChannelExecutor::new(RecordingChannel::new(Some(DeliveryError::retryable("503"))));
        assert_eq!(
            retry.execute(&ctx(), ActionKind::TagLead, &payload).await,
            ExecutionResult::RetryableFailure("503".into())
        );

        let fatal = ChannelExecutor::new(RecordingChannel::new(Some(DeliveryError::fatal("400"))));
        assert_eq!(
            fatal.execute(&ctx(), ActionKind::TagLead, &payload).await,
            ExecutionResult::FatalFailure("400".into())
        );

        let ok = RecordingChannel::new(None);
        let executor = ChannelExecutor::new(ok.clone());
        assert_eq!(
            executor.execute(&ctx(), ActionKind::TagLead, &payload).await,
            ExecutionResult::Success
        );
        assert_eq!(ok.delivered.lock().unwrap().len(), 1);
    }
}

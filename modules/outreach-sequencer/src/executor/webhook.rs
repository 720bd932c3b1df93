use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use tracing::warn;

use super::{DeliveryChannel, DeliveryError, StepAction, StepContext};

/// Delivers actions by POSTing JSON to an HTTP endpoint.
pub struct WebhookChannel {
    url: String,
    http: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(url: String) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_client(url: String, http: reqwest::Client) -> Self {
        Self { url, http }
    }
}

/// Map a non-success status to a delivery error. Server errors and rate
/// limiting can succeed later; other client errors will not.
pub fn classify_status(status: StatusCode) -> Option<DeliveryError> {
    if status.is_success() {
        return None;
    }
    let message = format!("delivery endpoint returned {status}");
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Some(DeliveryError::retryable(message))
    } else {
        Some(DeliveryError::fatal(message))
    }
}

#[async_trait]
impl DeliveryChannel for WebhookChannel {
    async fn deliver(&self, ctx: &StepContext, action: &StepAction) -> Result<(), DeliveryError> {
        let payload = json!({
            "enrollment_id": ctx.enrollment_id,
            "lead_id": ctx.lead_id,
            "company_id": ctx.company_id,
            "sequence_id": ctx.sequence_id,
            "sequence_version": ctx.sequence_version,
            "step_position": ctx.step_position,
            "attempt": ctx.attempt,
            "action": action,
        });

        let resp = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DeliveryError::retryable(format!("delivery request failed: {e}")))?;

        match classify_status(resp.status()) {
            None => Ok(()),
            Some(err) => {
                let body = resp.text().await.unwrap_or_default();
                warn!(
                    enrollment_id = %ctx.enrollment_id,
                    error = %err,
                    body = %body,
                    "Delivery webhook returned non-success"
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::OK).is_none());
        assert!(classify_status(StatusCode::ACCEPTED).is_none());

        for retryable in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::TOO_MANY_REQUESTS,
        ] {
            assert!(classify_status(retryable).unwrap().retryable, "{retryable}");
        }

        for fatal in [
            StatusCode::BAD_REQUEST,
            StatusCode::UNAUTHORIZED,
            StatusCode::NOT_FOUND,
            StatusCode::UNPROCESSABLE_ENTITY,
        ] {
            assert!(!classify_status(fatal).unwrap().retryable, "{fatal}");
        }
    }
}

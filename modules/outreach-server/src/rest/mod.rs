pub mod debug_fetch;

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use outreach_common::{
    ActionKind, Company, EngagementSequence, Enrollment, Lead, LeadTemperature, SequenceStep,
    SequencerError,
};
use outreach_events::StoredEvent;
use outreach_sequencer::{EngagementEvent, IngestOutcome, Sequencer, StepAction, TickReport};

pub struct AppState {
    pub sequencer: Sequencer,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(sequencer: Sequencer, http: reqwest::Client) -> Self {
        Self { sequencer, http }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(|| async { "ok" }))
        // Engine
        .route("/api/events", post(api_ingest_event))
        .route("/api/tick", post(api_tick))
        .route("/api/enrollments", post(api_enroll))
        .route("/api/enrollments/{id}", get(api_enrollment_detail))
        .route("/api/enrollments/{id}/events", get(api_enrollment_events))
        // Setup
        .route("/api/companies", post(api_open_company))
        .route("/api/companies/{id}/credits", get(api_company_credits))
        .route("/api/leads", post(api_register_lead))
        .route("/api/sequences", post(api_publish_sequence))
        // Debug
        .route("/api/debug/fetch", post(debug_fetch::api_debug_fetch))
        .with_state(state)
        // Method + path + status + latency
        .layer(
            tower_http::trace::TraceLayer::new_for_http().make_span_with(
                |request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        path = %request.uri().path(),
                    )
                },
            ),
        )
}

// --- Errors ---

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
pub struct ApiError(SequencerError);

impl From<SequencerError> for ApiError {
    fn from(error: SequencerError) -> Self {
        Self(error)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            SequencerError::NotFound { .. } => StatusCode::NOT_FOUND,
            SequencerError::AlreadyEnrolled { .. } | SequencerError::ConcurrentModification { .. } => {
                StatusCode::CONFLICT
            }
            SequencerError::SequenceInactive(_)
            | SequencerError::InvalidSequence(_)
            | SequencerError::LeadConverted(_)
            | SequencerError::CompanyMismatch
            | SequencerError::Parse(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SequencerError::InsufficientCredit { .. } => StatusCode::PAYMENT_REQUIRED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// --- Engine ---

pub async fn api_ingest_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<EngagementEvent>,
) -> ApiResult<IngestOutcome> {
    Ok(Json(state.sequencer.handle(event, Utc::now()).await?))
}

#[derive(Deserialize)]
pub struct TickParams {
    /// Evaluate as of this instant instead of the wall clock.
    now: Option<DateTime<Utc>>,
}

pub async fn api_tick(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TickParams>,
) -> ApiResult<TickReport> {
    let now = params.now.unwrap_or_else(Utc::now);
    Ok(Json(state.sequencer.tick(now).await?))
}

#[derive(Deserialize)]
pub struct EnrollRequest {
    lead_id: Uuid,
    sequence_id: Uuid,
}

pub async fn api_enroll(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EnrollRequest>,
) -> Result<(StatusCode, Json<Enrollment>), ApiError> {
    let enrollment = state
        .sequencer
        .enroll(body.lead_id, body.sequence_id, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(enrollment)))
}

pub async fn api_enrollment_detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Enrollment> {
    Ok(Json(state.sequencer.enrollment(id).await?))
}

pub async fn api_enrollment_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<StoredEvent>> {
    Ok(Json(state.sequencer.history(id).await?))
}

// --- Setup ---

#[derive(Deserialize)]
pub struct OpenCompanyRequest {
    name: String,
    credits: u64,
}

pub async fn api_open_company(
    State(state): State<Arc<AppState>>,
    Json(body): Json<OpenCompanyRequest>,
) -> Result<(StatusCode, Json<Company>), ApiError> {
    let company = Company::new(body.name, body.credits);
    state.sequencer.open_company(&company).await?;
    Ok((StatusCode::CREATED, Json(company)))
}

#[derive(Serialize)]
pub struct CreditsResponse {
    company_id: Uuid,
    credits_remaining: u64,
}

pub async fn api_company_credits(
    State(state): State<Arc<AppState>>,
    Path(company_id): Path<Uuid>,
) -> ApiResult<CreditsResponse> {
    let credits_remaining = state.sequencer.balance(company_id).await?;
    Ok(Json(CreditsResponse {
        company_id,
        credits_remaining,
    }))
}

#[derive(Deserialize)]
pub struct RegisterLeadRequest {
    company_id: Uuid,
    #[serde(default = "default_temperature")]
    temperature: LeadTemperature,
}

fn default_temperature() -> LeadTemperature {
    LeadTemperature::Cold
}

pub async fn api_register_lead(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterLeadRequest>,
) -> Result<(StatusCode, Json<Lead>), ApiError> {
    // Fails for unknown companies.
    state.sequencer.balance(body.company_id).await?;
    let lead = Lead::new(body.company_id, body.temperature);
    state.sequencer.register_lead(&lead).await?;
    Ok((StatusCode::CREATED, Json(lead)))
}

#[derive(Deserialize)]
pub struct StepRequest {
    position: u32,
    action_kind: ActionKind,
    #[serde(default)]
    delay_after_previous_secs: u64,
    #[serde(default)]
    action_payload: serde_json::Value,
}

#[derive(Deserialize)]
pub struct PublishSequenceRequest {
    /// Publish a new version of an existing sequence.
    id: Option<Uuid>,
    company_id: Uuid,
    steps: Vec<StepRequest>,
}

pub async fn api_publish_sequence(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PublishSequenceRequest>,
) -> Result<(StatusCode, Json<EngagementSequence>), ApiError> {
    let mut steps = Vec::with_capacity(body.steps.len());
    for step in body.steps {
        StepAction::from_parts(step.action_kind, &step.action_payload).map_err(|e| {
            SequencerError::InvalidSequence(format!("step {}: {e}", step.position))
        })?;
        steps.push(SequenceStep::new(
            step.position,
            step.action_kind,
            step.delay_after_previous_secs,
            step.action_payload,
        ));
    }

    let mut sequence = EngagementSequence::new(body.company_id, steps)?;
    if let Some(id) = body.id {
        sequence.id = id;
    }
    let published = state.sequencer.publish_sequence(sequence).await?;
    Ok((StatusCode::CREATED, Json(published)))
}

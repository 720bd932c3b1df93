//! Debug proxy: fetches an arbitrary URL server-side and hands back the raw
//! body. Unrelated to sequencing; kept for inspecting delivery endpoints.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::{debug, warn};

use super::AppState;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_URL_LEN: usize = 2048;

#[derive(Deserialize)]
pub struct FetchRequest {
    url: String,
}

/// Returns the upstream body verbatim with its content type, or a 500 with
/// `{"error": ...}` when anything goes wrong, including a malformed request.
pub async fn api_debug_fetch(
    State(state): State<Arc<AppState>>,
    body: Result<Json<FetchRequest>, JsonRejection>,
) -> Response {
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "Debug fetch request rejected");
            return error_response(rejection.body_text());
        }
    };

    match fetch(&state.http, &body.url).await {
        Ok((content_type, bytes)) => {
            debug!(url = %body.url, bytes = bytes.len(), "Debug fetch complete");
            let mut response = (StatusCode::OK, bytes).into_response();
            if let Some(content_type) = content_type {
                response.headers_mut().insert(header::CONTENT_TYPE, content_type);
            }
            response
        }
        Err(e) => {
            warn!(url = %body.url, error = %e, "Debug fetch failed");
            error_response(format!("{e:#}"))
        }
    }
}

fn error_response(message: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn parse_url(raw: &str) -> anyhow::Result<url::Url> {
    let raw = raw.trim();
    if raw.len() > MAX_URL_LEN {
        bail!("URL too long (max {MAX_URL_LEN} characters)");
    }
    let url = url::Url::parse(raw).context("Invalid URL")?;
    if url.scheme() != "http" && url.scheme() != "https" {
        bail!("URL must use http or https scheme");
    }
    Ok(url)
}

async fn fetch(http: &reqwest::Client, raw: &str) -> anyhow::Result<(Option<HeaderValue>, Bytes)> {
    let url = parse_url(raw)?;
    let response = http
        .get(url)
        .timeout(FETCH_TIMEOUT)
        .send()
        .await
        .context("Request failed")?;

    let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
    let bytes = response.bytes().await.context("Failed to read body")?;
    Ok((content_type, bytes))
}

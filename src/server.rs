//! Small HTTP surface for ad-hoc lookups.
//!
//! Accepts an audio upload, fingerprints it and answers with the match
//! decision against the live index. Batch work goes through the workers;
//! this endpoint exists for spot checks and operator tooling.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::index::FingerprintIndex;
use crate::matcher::{self, MatchDecision};
use crate::{dsp, segment};

const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub index: Arc<dyn FingerprintIndex>,
    pub config: Arc<EngineConfig>,
}

#[derive(Serialize)]
/// JSON response for the `/lookup` endpoint.
pub struct LookupResponse {
    #[serde(flatten)]
    pub decision: MatchDecision,
    pub query_len: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/lookup", post(lookup))
        .route("/health", get(|| async { "healthy" }))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// Handle a multipart upload and return the match decision as JSON.
///
/// Expects a form field named `file` containing the audio payload.
async fn lookup(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<LookupResponse>, StatusCode> {
    let mut audio_bytes = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?
    {
        if field.name() == Some("file") {
            audio_bytes = field
                .bytes()
                .await
                .map_err(|_| StatusCode::BAD_REQUEST)?
                .to_vec();
        }
    }
    if audio_bytes.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let config = Arc::clone(&state.config);
    let fingerprint = tokio::task::spawn_blocking(move || {
        dsp::fingerprint_bytes(&audio_bytes, &config)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    .map_err(|e| {
        warn!(error = %e, "lookup upload failed to decode");
        StatusCode::UNPROCESSABLE_ENTITY
    })?;

    // Ad-hoc clips are usually short; sample only when the fingerprint is
    // long enough for the window table to apply.
    let (query, query_len) = if fingerprint.len() >= state.config.sampling.min_matchable {
        let (query, plan) = segment::sample(&fingerprint, &state.config.sampling.anchors);
        (query, plan.query_len)
    } else {
        let len = fingerprint.len();
        (fingerprint, len)
    };

    let candidates = state
        .index
        .find_candidates(&query, &state.config.search)
        .await
        .map_err(|e| {
            warn!(error = %e, "candidate search failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let decision = matcher::decide(&candidates, query_len, &state.config.search, &state.config.audio);
    info!(
        matched = decision.matched,
        score = decision.score,
        query_len,
        "lookup served"
    );
    Ok(Json(LookupResponse { decision, query_len }))
}

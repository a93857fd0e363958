use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::{counter, histogram};
use serde_json::json;
use tracing::{error, warn};

use idrelay_core::signature::{SignatureError, Verification};
use idrelay_core::types::RawEvent;

use crate::pipeline::{self, PipelineOutcome};
use crate::problem::ProblemResponse;
use crate::router::AppState;

/// Header carrying the provider's hex HMAC digest of the body.
pub const DIGEST_HEADER: &str = "x-payload-digest";

/// Inbound webhook endpoint.
///
/// Authentication happens here, on the exact wire bytes, before anything
/// else runs. The remaining stages execute on a spawned task so a client
/// that disconnects after the signature check cannot abort the pipeline
/// between the cache update and delivery.
pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let started = Instant::now();
    let received_at = state.now();
    counter!("webhook_ingress_total").increment(1);

    let claimed = headers
        .get(DIGEST_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    match state.verifier().verify(&body, claimed.as_deref()) {
        Ok(Verification::Verified) => {}
        Ok(Verification::Skipped) => {
            warn!(stage = "auth", "accepting unsigned payload, verification is disabled");
        }
        Err(err) => {
            counter!("webhook_invalid_signature_total").increment(1);
            histogram!("webhook_ack_latency_seconds").record(started.elapsed().as_secs_f64());
            warn!(stage = "auth", error = %err, "rejected inbound payload");
            let problem_type = match err {
                SignatureError::MissingSignature => "missing_signature",
                SignatureError::SignatureMismatch => "invalid_signature",
            };
            return Err(ProblemResponse::forbidden(problem_type, err.to_string()));
        }
    }

    let raw = Arc::new(RawEvent {
        payload: body.to_vec(),
        claimed_signature: claimed,
        received_at,
    });

    let outcome = tokio::spawn(pipeline::run(state, raw))
        .await
        .map_err(|err| {
            error!(stage = "pipeline", error = %err, "pipeline task failed");
            ProblemResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "event processing failed",
            )
        })?;

    histogram!("webhook_ack_latency_seconds").record(started.elapsed().as_secs_f64());

    match outcome {
        PipelineOutcome::Delivered { subject_id } => Ok((
            StatusCode::OK,
            Json(json!({ "subject_id": subject_id, "outcome": "delivered" })),
        )
            .into_response()),
        PipelineOutcome::Accepted { subject_id } => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "subject_id": subject_id, "outcome": "accepted" })),
        )
            .into_response()),
        PipelineOutcome::Quarantined { subject_id } => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "subject_id": subject_id, "outcome": "quarantined" })),
        )
            .into_response()),
        PipelineOutcome::Invalid {
            problem_type,
            detail,
        } => Err(ProblemResponse::bad_request(problem_type, detail)),
    }
}

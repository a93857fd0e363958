use axum::{extract::State, Json};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use idrelay_storage::DeadLetterError;

use crate::problem::ProblemResponse;
use crate::router::AppState;

#[derive(Debug, Deserialize)]
pub struct ReplayRequest {
    /// Permanent entries fail identically on every blind resend, so they are
    /// skipped unless an operator opts in after fixing the downstream side.
    #[serde(default)]
    pub include_permanent: bool,
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplaySummary {
    pub scanned: usize,
    pub delivered: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Operator-driven replay of the dead-letter store.
///
/// Entries are resent oldest first. Before each attempt the attempt counter
/// is bumped, and a delivered entry is removed with a keyed delete so a
/// concurrent replay of the same entry cannot double-claim it.
pub async fn handle(
    State(state): State<AppState>,
    body: Option<Json<ReplayRequest>>,
) -> Result<Json<ReplaySummary>, ProblemResponse> {
    let include_permanent = body.map(|Json(req)| req.include_permanent).unwrap_or(false);
    let summary = replay_pending(&state, include_permanent).await?;
    Ok(Json(summary))
}

pub async fn replay_pending(
    state: &AppState,
    include_permanent: bool,
) -> Result<ReplaySummary, ProblemResponse> {
    let repo = state.storage().dead_letters();
    let pending = repo.list_pending().await.map_err(storage_problem)?;

    let mut summary = ReplaySummary::default();
    for entry in pending {
        summary.scanned += 1;

        if entry.permanent && !include_permanent {
            summary.skipped += 1;
            counter!("replay_total", "result" => "skipped").increment(1);
            continue;
        }

        let body: Value = match serde_json::from_str(&entry.payload_json) {
            Ok(body) => body,
            Err(err) => {
                summary.skipped += 1;
                counter!("replay_total", "result" => "skipped").increment(1);
                warn!(stage = "replay", id = %entry.id, error = %err, "stored payload is unreadable");
                continue;
            }
        };

        match repo.record_attempt(&entry.id, state.now()).await {
            Ok(_) => {}
            Err(DeadLetterError::NotFound) => {
                // Another replay claimed this entry since the listing.
                summary.skipped += 1;
                counter!("replay_total", "result" => "skipped").increment(1);
                continue;
            }
            Err(err) => return Err(storage_problem(err)),
        }

        match state.forwarder().forward_body(&body).await {
            Ok(_) => {
                let claimed = repo.mark_delivered(&entry.id).await.map_err(storage_problem)?;
                if claimed {
                    summary.delivered += 1;
                    counter!("replay_total", "result" => "delivered").increment(1);
                    info!(stage = "replay", id = %entry.id, subject_id = %entry.subject_id, "dead letter delivered");
                } else {
                    summary.skipped += 1;
                    counter!("replay_total", "result" => "skipped").increment(1);
                }
            }
            Err(err) => {
                summary.failed += 1;
                counter!("replay_total", "result" => "failed").increment(1);
                warn!(stage = "replay", id = %entry.id, error = %err, "replay attempt failed");
            }
        }
    }

    info!(
        stage = "replay",
        scanned = summary.scanned,
        delivered = summary.delivered,
        failed = summary.failed,
        skipped = summary.skipped,
        "replay pass finished"
    );
    Ok(summary)
}

fn storage_problem(err: DeadLetterError) -> ProblemResponse {
    tracing::error!(stage = "replay", error = %err, "dead-letter store unavailable");
    ProblemResponse::new(
        axum::http::StatusCode::INTERNAL_SERVER_ERROR,
        "storage_error",
        "dead-letter store unavailable",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{app_router, AppState};
    use crate::telemetry;
    use axum::{body::Body, http::Request, http::StatusCode};
    use chrono::Utc;
    use http_body_util::BodyExt;
    use httpmock::prelude::*;
    use idrelay_core::signature::SignatureVerifier;
    use idrelay_downstream::{ProviderClient, RecordClient};
    use idrelay_storage::{Database, FailureKind, NewDeadLetter, StatusCache};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;
    use url::Url;

    // Each test gets its own named in-memory database; replay scans the
    // whole store, so shared rows would corrupt the summary counts.
    async fn setup_state(db: &str, downstream_base: &Url) -> AppState {
        let metrics = telemetry::init_metrics().expect("metrics init");
        let database = Database::connect(&format!("sqlite:file:{db}?mode=memory&cache=shared"))
            .await
            .expect("connect");
        database.run_migrations().await.expect("migrations");

        let http = reqwest::Client::builder().build().expect("client");
        let forwarder = RecordClient::new(
            downstream_base.clone(),
            Duration::from_millis(500),
            http.clone(),
        );
        let provider = ProviderClient::new(
            downstream_base.clone(),
            "app-token",
            Duration::from_millis(500),
            http,
        );

        AppState::new(
            metrics,
            database,
            StatusCache::new(),
            SignatureVerifier::new(b"test-secret".to_vec()),
            forwarder,
            provider,
        )
    }

    async fn seed(state: &AppState, subject: &str, kind: FailureKind) -> String {
        let entry = state
            .storage()
            .dead_letters()
            .record(NewDeadLetter {
                subject_id: subject,
                event_type: "reviewed",
                payload_json: json!({
                    "subject_id": subject,
                    "event_type": "reviewed",
                    "review_outcome": "approved",
                })
                .to_string(),
                failure_reason: "downstream answered 503".to_string(),
                kind,
                failed_at: Utc::now(),
            })
            .await
            .expect("seed entry");
        entry.id
    }

    async fn post_replay(state: AppState, body: Option<Value>) -> (StatusCode, ReplaySummary) {
        let request = match body {
            Some(body) => Request::builder()
                .method("POST")
                .uri("/ops/dead-letters/replay")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => Request::builder()
                .method("POST")
                .uri("/ops/dead-letters/replay")
                .body(Body::empty())
                .unwrap(),
        };
        let response = app_router(state)
            .oneshot(request)
            .await
            .expect("response");
        let status = response.status();
        let collected = response.into_body().collect().await.expect("body");
        let summary: ReplaySummary =
            serde_json::from_slice(&collected.to_bytes()).unwrap_or_default();
        (status, summary)
    }

    #[tokio::test]
    async fn replay_delivers_and_removes_transient_entries() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/")).expect("url");
        let state = setup_state("rp_delivers", &base).await;

        let id = seed(&state, "user_42", FailureKind::Transient).await;
        let downstream = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/verification-events")
                    .json_body_partial(r#"{"subject_id": "user_42"}"#);
                then.status(200).json_body(json!({}));
            })
            .await;

        let (status, summary) = post_replay(state.clone(), None).await;
        assert_eq!(status, StatusCode::OK);
        downstream.assert_async().await;
        assert_eq!(
            summary,
            ReplaySummary {
                scanned: 1,
                delivered: 1,
                failed: 0,
                skipped: 0,
            }
        );

        let pending = state
            .storage()
            .dead_letters()
            .list_pending()
            .await
            .expect("list");
        assert!(
            pending.iter().all(|entry| entry.id != id),
            "delivered entry is removed"
        );
    }

    #[tokio::test]
    async fn failed_replay_keeps_the_entry_and_counts_the_attempt() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/")).expect("url");
        let state = setup_state("rp_failed_attempt", &base).await;

        let id = seed(&state, "user_1", FailureKind::Transient).await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/verification-events");
                then.status(503);
            })
            .await;

        let (status, summary) = post_replay(state.clone(), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.delivered, 0);

        let pending = state
            .storage()
            .dead_letters()
            .list_pending()
            .await
            .expect("list");
        let entry = pending
            .iter()
            .find(|entry| entry.id == id)
            .expect("entry survives");
        assert_eq!(entry.attempt_count, 2);
    }

    #[tokio::test]
    async fn permanent_entries_are_skipped_unless_opted_in() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/")).expect("url");
        let state = setup_state("rp_permanent_skip", &base).await;

        seed(&state, "user_9", FailureKind::Permanent).await;
        let downstream = server
            .mock_async(|when, then| {
                when.method(POST).path("/verification-events");
                then.status(200).json_body(json!({}));
            })
            .await;

        let (_, summary) = post_replay(state.clone(), None).await;
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.delivered, 0);
        assert_eq!(downstream.hits_async().await, 0);

        let (_, summary) =
            post_replay(state.clone(), Some(json!({ "include_permanent": true }))).await;
        assert_eq!(summary.delivered, 1);
        assert_eq!(downstream.hits_async().await, 1);
    }

    #[tokio::test]
    async fn replay_processes_oldest_failures_first() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/")).expect("url");
        let state = setup_state("rp_oldest_first", &base).await;

        seed(&state, "user_a", FailureKind::Transient).await;
        seed(&state, "user_b", FailureKind::Transient).await;

        server
            .mock_async(|when, then| {
                when.method(POST).path("/verification-events");
                then.status(200).json_body(json!({}));
            })
            .await;

        let (_, summary) = post_replay(state.clone(), None).await;
        assert_eq!(summary.scanned, 2);
        assert_eq!(summary.delivered, 2);
        assert!(state
            .storage()
            .dead_letters()
            .list_pending()
            .await
            .expect("list")
            .is_empty());
    }
}

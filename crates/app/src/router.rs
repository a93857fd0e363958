use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::{error, info};

use idrelay_core::signature::SignatureVerifier;
use idrelay_downstream::{ProviderClient, ProviderError, RecordClient};
use idrelay_storage::{Database, StatusCache};

use crate::problem::ProblemResponse;
use crate::{replay, telemetry, webhook};

/// Shared application state injected into every handler.
///
/// The status cache and the database are the only mutable state shared
/// across concurrent pipeline runs; everything else here is a cheap clone.
#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    cache: StatusCache,
    verifier: SignatureVerifier,
    forwarder: RecordClient,
    provider: ProviderClient,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        cache: StatusCache,
        verifier: SignatureVerifier,
        forwarder: RecordClient,
        provider: ProviderClient,
    ) -> Self {
        Self {
            metrics,
            storage,
            cache,
            verifier,
            forwarder,
            provider,
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn cache(&self) -> &StatusCache {
        &self.cache
    }

    pub fn verifier(&self) -> &SignatureVerifier {
        &self.verifier
    }

    pub fn forwarder(&self) -> &RecordClient {
        &self.forwarder
    }

    pub fn provider(&self) -> &ProviderClient {
        &self.provider
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/webhooks/verification", post(webhook::handle))
        .route("/subjects/:subject_id/status", get(subject_status))
        .route("/subjects/:subject_id/reset", post(subject_reset))
        .route("/ops/dead-letters", get(list_dead_letters))
        .route("/ops/dead-letters/replay", post(replay::handle))
        .route("/ops/dead-letters/:id", delete(purge_dead_letter))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(body))
        .unwrap()
}

/// Status lookup with read-through: a cache miss falls back to the
/// provider's own status query and populates the cache with the answer.
async fn subject_status(
    State(state): State<AppState>,
    Path(subject_id): Path<String>,
) -> Result<Response, ProblemResponse> {
    if let Some(record) = state.cache().lookup(&subject_id).await {
        counter!("api_status_requests_total", "result" => "hit").increment(1);
        return Ok(Json(record).into_response());
    }

    match state.provider().fetch_status(&subject_id).await {
        Ok(status) => {
            counter!("api_status_requests_total", "result" => "miss").increment(1);
            let record = state
                .cache()
                .populate(status.into_record(&subject_id, state.now()))
                .await;
            Ok(Json(record).into_response())
        }
        Err(ProviderError::UnknownSubject) => {
            counter!("api_status_requests_total", "result" => "unknown_subject").increment(1);
            Err(ProblemResponse::not_found(
                "subject_not_found",
                format!("subject {subject_id} has no verification history"),
            ))
        }
        Err(err) => {
            // A provider outage must stay distinguishable from "unverified".
            counter!("api_status_requests_total", "result" => "provider_error").increment(1);
            error!(stage = "status", subject_id, error = %err, "provider status query failed");
            Err(ProblemResponse::bad_gateway(
                "provider_unavailable",
                "provider status query failed",
            ))
        }
    }
}

/// Resets the subject's profile at the provider, then evicts the cached
/// record so stale state is never served after a reset.
async fn subject_reset(
    State(state): State<AppState>,
    Path(subject_id): Path<String>,
) -> Result<StatusCode, ProblemResponse> {
    state
        .provider()
        .reset_profile(&subject_id)
        .await
        .map_err(|err| {
            error!(stage = "reset", subject_id, error = %err, "profile reset failed");
            ProblemResponse::bad_gateway("provider_unavailable", "profile reset failed")
        })?;

    let evicted = state.cache().evict(&subject_id).await;
    info!(stage = "reset", subject_id, evicted, "profile reset completed");
    Ok(StatusCode::NO_CONTENT)
}

async fn list_dead_letters(
    State(state): State<AppState>,
) -> Result<Response, ProblemResponse> {
    let pending = state
        .storage()
        .dead_letters()
        .list_pending()
        .await
        .map_err(|err| {
            error!(stage = "ops", error = %err, "failed to list dead letters");
            ProblemResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_error",
                "failed to list dead letters",
            )
        })?;
    Ok(Json(pending).into_response())
}

async fn purge_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ProblemResponse> {
    let removed = state
        .storage()
        .dead_letters()
        .purge(&id)
        .await
        .map_err(|err| {
            error!(stage = "ops", id, error = %err, "failed to purge dead letter");
            ProblemResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_error",
                "failed to purge dead letter",
            )
        })?;

    if removed {
        info!(stage = "ops", id, "dead letter purged");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ProblemResponse::not_found(
            "dead_letter_not_found",
            format!("no dead-letter entry with id {id}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use httpmock::prelude::*;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;
    use url::Url;

    // Each test gets its own named in-memory database so parallel tests
    // cannot observe one another's rows.
    async fn setup_state(db: &str, collaborator_base: &Url) -> AppState {
        let metrics = telemetry::init_metrics().expect("metrics init");
        let database = Database::connect(&format!("sqlite:file:{db}?mode=memory&cache=shared"))
            .await
            .expect("connect");
        database.run_migrations().await.expect("migrations");

        let http = reqwest::Client::builder().build().expect("client");
        let forwarder = RecordClient::new(
            collaborator_base.clone(),
            Duration::from_secs(1),
            http.clone(),
        );
        let provider = ProviderClient::new(
            collaborator_base.clone(),
            "app-token",
            Duration::from_secs(1),
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

    async fn local_state(db: &str) -> AppState {
        let base = Url::parse("http://127.0.0.1:9/").expect("url");
        setup_state(db, &base).await
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = app_router(local_state("rt_healthz").await);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exports_build_info() {
        let app = app_router(local_state("rt_metrics").await);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
        let collected = response
            .into_body()
            .collect()
            .await
            .expect("body should read");
        let body = String::from_utf8(collected.to_bytes().to_vec()).expect("utf-8");
        assert!(body.contains("app_build_info"));
        assert!(body.contains("app_uptime_seconds"));
    }

    #[tokio::test]
    async fn status_miss_reads_through_to_provider() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/")).expect("url");
        let state = setup_state("rt_status_miss", &base).await;

        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/subjects/user_42/status");
                then.status(200).json_body(json!({
                    "reviewStatus": "completed",
                    "levelName": "basic-kyc",
                    "reviewResult": {"reviewStatus": "completed"}
                }));
            })
            .await;

        let app = app_router(state.clone());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/subjects/user_42/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        mock.assert_async().await;

        let collected = response.into_body().collect().await.expect("body");
        let body: Value = serde_json::from_slice(&collected.to_bytes()).expect("json");
        assert_eq!(body["subject_id"], "user_42");
        assert_eq!(body["last_event"], "reviewed");
        assert_eq!(body["last_review_outcome"], "approved");

        // The answer is now cached; a second lookup must not hit the provider.
        let app = app_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/subjects/user_42/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(mock.hits_async().await, 1);
    }

    #[tokio::test]
    async fn provider_outage_is_a_bad_gateway_not_unverified() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/")).expect("url");
        let state = setup_state("rt_outage", &base).await;

        server
            .mock_async(|when, then| {
                when.method(GET).path("/subjects/user_1/status");
                then.status(503);
            })
            .await;

        let response = app_router(state)
            .oneshot(
                Request::builder()
                    .uri("/subjects/user_1/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn reset_evicts_the_cached_record() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/")).expect("url");
        let state = setup_state("rt_reset", &base).await;

        server
            .mock_async(|when, then| {
                when.method(POST).path("/subjects/user_42/reset");
                then.status(204);
            })
            .await;

        state
            .cache()
            .populate(idrelay_core::types::StatusRecord {
                subject_id: "user_42".to_string(),
                last_event: idrelay_core::types::EventKind::Reviewed,
                last_review_outcome: Some(idrelay_core::types::ReviewOutcome::Approved),
                level_name: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await;

        let response = app_router(state.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/subjects/user_42/reset")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(state.cache().lookup("user_42").await.is_none());
    }

    #[tokio::test]
    async fn purge_of_unknown_entry_is_not_found() {
        let response = app_router(local_state("rt_purge_missing").await)
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/ops/dead-letters/no-such-id")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

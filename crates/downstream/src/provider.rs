use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use idrelay_core::types::{EventKind, ReviewOutcome, StatusRecord};

/// Client for the identity-verification provider's own APIs.
///
/// Used only for cache misses (status query) and the profile-reset
/// collaborator; webhook traffic never flows through here.
#[derive(Clone)]
pub struct ProviderClient {
    http: Client,
    base_url: Url,
    app_token: String,
    timeout: Duration,
}

impl ProviderClient {
    pub fn new(
        base_url: Url,
        app_token: impl Into<String>,
        timeout: Duration,
        http: Client,
    ) -> Self {
        Self {
            http,
            base_url,
            app_token: app_token.into(),
            timeout,
        }
    }

    /// Fetches the authoritative status document for a subject.
    ///
    /// The provider is authoritative but network-fallible; timeouts and 5xx
    /// surface as errors rather than a false "unverified".
    pub async fn fetch_status(&self, subject_id: &str) -> Result<ProviderStatus, ProviderError> {
        let url = self
            .base_url
            .join(&format!("subjects/{subject_id}/status"))?;
        let response = self.authorized_request(Method::GET, url).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ProviderError::UnknownSubject);
        }
        parse_json(response).await
    }

    /// Resets the subject's verification profile at the provider. Callers
    /// must evict the subject from the status cache once this succeeds.
    pub async fn reset_profile(&self, subject_id: &str) -> Result<(), ProviderError> {
        let url = self.base_url.join(&format!("subjects/{subject_id}/reset"))?;
        let response = self.authorized_request(Method::POST, url).send().await?;
        ensure_success(response).await
    }

    fn authorized_request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        // Every provider call is bounded; a hung provider surfaces as an
        // error instead of stalling the handler.
        self.http
            .request(method, url)
            .header("X-App-Token", &self.app_token)
            .timeout(self.timeout)
    }
}

/// Status document returned by the provider.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    #[serde(default)]
    pub review_status: Option<String>,
    #[serde(default)]
    pub level_name: Option<String>,
    #[serde(default)]
    pub review_result: Option<ProviderReviewResult>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderReviewResult {
    #[serde(default)]
    pub review_status: Option<String>,
}

impl ProviderStatus {
    /// Projects the status document into a cacheable record, using the same
    /// lifecycle vocabulary the normalizer produces.
    pub fn into_record(self, subject_id: &str, now: DateTime<Utc>) -> StatusRecord {
        let (last_event, last_review_outcome) = match self.review_status.as_deref() {
            Some("init") => (EventKind::Created, None),
            Some("pending") | Some("queued") | Some("prechecked") => (EventKind::Pending, None),
            Some("onHold") => (EventKind::OnHold, None),
            Some("completed") => {
                let outcome = match self
                    .review_result
                    .as_ref()
                    .and_then(|result| result.review_status.as_deref())
                {
                    Some("completed") => ReviewOutcome::Approved,
                    Some("rejected") => ReviewOutcome::Rejected,
                    _ => ReviewOutcome::Unknown,
                };
                (EventKind::Reviewed, Some(outcome))
            }
            _ => (EventKind::Unclassified, None),
        };

        StatusRecord {
            subject_id: subject_id.to_string(),
            last_event,
            last_review_outcome,
            level_name: self.level_name,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Errors produced by the provider client.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("subject is unknown to the provider")]
    UnknownSubject,
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

async fn ensure_success(response: Response) -> Result<(), ProviderError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(ProviderError::Status { status, body });
    }
    Ok(())
}

async fn parse_json<T>(response: Response) -> Result<T, ProviderError>
where
    T: serde::de::DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(ProviderError::Status { status, body });
    }

    Ok(response.json().await?)
}

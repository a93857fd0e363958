use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use idrelay_core::types::CanonicalEvent;

/// Client delivering canonical events to the downstream system-of-record.
///
/// Delivery is a single bounded-timeout call; this client never retries.
/// Recovery from failure is the replay operation's concern, driven by the
/// stored dead-letter entries.
#[derive(Clone)]
pub struct RecordClient {
    http: Client,
    base_url: Url,
    timeout: Duration,
}

impl RecordClient {
    pub fn new(base_url: Url, timeout: Duration, http: Client) -> Self {
        Self {
            http,
            base_url,
            timeout,
        }
    }

    /// Forwards one canonical event.
    pub async fn forward(&self, event: &CanonicalEvent) -> Result<DownstreamAck, ForwardError> {
        self.forward_body(&event.wire_body()).await
    }

    /// Forwards an already-projected wire body; used by the replay driver,
    /// which resends the stored projection verbatim.
    pub async fn forward_body(&self, body: &Value) -> Result<DownstreamAck, ForwardError> {
        let url = self.base_url.join("verification-events")?;
        let response = self
            .http
            .post(url)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        if status.is_client_error() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<unavailable>"));
            return Err(ForwardError::Permanent { status, body });
        }
        if !status.is_success() {
            return Err(ForwardError::Transient(format!(
                "downstream answered {status}"
            )));
        }

        let ack: Value = response
            .json()
            .await
            .map_err(|err| ForwardError::Transient(format!("malformed downstream ack: {err}")))?;
        if !ack.is_object() {
            return Err(ForwardError::Transient(
                "downstream ack is not a JSON object".to_string(),
            ));
        }

        Ok(DownstreamAck {
            status: status.as_u16(),
            reference: ack
                .get("reference")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

fn classify_send_error(err: reqwest::Error) -> ForwardError {
    if err.is_timeout() {
        ForwardError::Transient("downstream call timed out".to_string())
    } else {
        ForwardError::Transient(format!("downstream call failed: {err}"))
    }
}

/// Acknowledgement returned by the downstream system-of-record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownstreamAck {
    pub status: u16,
    pub reference: Option<String>,
}

/// Delivery failures, split by whether blind replay can ever succeed.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    /// Timeouts, connection errors, 5xx and malformed acks.
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// Downstream rejected the payload itself; replaying it unchanged will
    /// keep failing.
    #[error("downstream rejected the payload ({status}): {body}")]
    Permanent { status: StatusCode, body: String },
}

impl ForwardError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }
}

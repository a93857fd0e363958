use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A webhook payload exactly as received on the wire, before any parsing.
///
/// The payload bytes are what the provider signed; re-serializing parsed JSON
/// can change byte layout and invalidate the signature, so these bytes are
/// captured once and treated as immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub payload: Vec<u8>,
    pub claimed_signature: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Lifecycle category of a verification event.
///
/// Closed set: any provider type outside the four known ones is carried as
/// `Unclassified` so downstream auditing is not silently lossy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Pending,
    OnHold,
    Reviewed,
    Unclassified,
}

impl EventKind {
    /// Canonical label used across storage, telemetry and the wire projection.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Pending => "pending",
            Self::OnHold => "on_hold",
            Self::Reviewed => "reviewed",
            Self::Unclassified => "unclassified",
        }
    }

    /// Returns `true` for the four known lifecycle categories.
    pub fn is_classified(self) -> bool {
        !matches!(self, Self::Unclassified)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal review outcome, present only on `Reviewed` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewOutcome {
    Approved,
    Rejected,
    Unknown,
}

impl ReviewOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ReviewOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized, internal representation of one provider notification.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalEvent {
    pub kind: EventKind,
    /// Stable external identifier for the verified person or entity.
    pub subject_id: String,
    /// Provider-side applicant identifier, kept verbatim.
    pub applicant_id: String,
    /// Provider type string as received; only meaningful for audit when
    /// `kind` is `Unclassified`.
    pub provider_type: String,
    pub review_outcome: Option<ReviewOutcome>,
    /// Verbatim reject labels in provider order; empty unless Rejected.
    pub rejection_reasons: Vec<String>,
    /// Verification tier the subject was asked to complete.
    pub level_name: Option<String>,
    pub received_at: DateTime<Utc>,
    /// Back-reference to the originating payload for audit and debugging
    /// only; control decisions never read it.
    pub raw: Arc<RawEvent>,
}

impl CanonicalEvent {
    /// JSON projection sent to the downstream system-of-record and stored in
    /// dead-letter entries.
    pub fn wire_body(&self) -> Value {
        json!({
            "subject_id": self.subject_id,
            "applicant_id": self.applicant_id,
            "event_type": self.kind.as_str(),
            "provider_type": self.provider_type,
            "review_outcome": self.review_outcome.map(ReviewOutcome::as_str),
            "rejection_reasons": self.rejection_reasons,
            "level_name": self.level_name,
            "received_at": self.received_at,
        })
    }
}

/// Latest known verification state for one subject.
///
/// Owned exclusively by the status cache; there is at most one record per
/// subject at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub subject_id: String,
    pub last_event: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_review_outcome: Option<ReviewOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

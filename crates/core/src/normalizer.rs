use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::types::{CanonicalEvent, EventKind, RawEvent, ReviewOutcome};

/// Marker the provider uses when the applicant id embeds our external id.
const EXTERNAL_ID_MARKER: &str = ";externalUserId=";

/// Errors that can occur while normalizing an inbound payload.
#[derive(Debug, Error)]
pub enum NormalizerError {
    #[error("failed to parse payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
    #[error("applicant identifier does not yield a subject id")]
    MissingSubjectId,
}

/// Deterministic normalizer turning provider webhook JSON into
/// [`CanonicalEvent`] values.
pub struct Normalizer;

impl Normalizer {
    /// Converts a raw provider payload into a [`CanonicalEvent`].
    ///
    /// Pure function of the parsed payload: the same raw bytes always yield
    /// the same canonical fields. Unrecognized provider types are carried as
    /// [`EventKind::Unclassified`] rather than dropped; an unrecoverable
    /// subject id fails closed.
    pub fn normalize(raw: Arc<RawEvent>) -> Result<CanonicalEvent, NormalizerError> {
        let payload: ProviderPayload = serde_json::from_slice(&raw.payload)?;

        let subject_id = recover_subject_id(&payload.applicant_id)?;
        let kind = classify(&payload.event_type);

        let (review_outcome, rejection_reasons) = match kind {
            EventKind::Reviewed => {
                let outcome = payload
                    .review_result
                    .as_ref()
                    .and_then(|result| result.review_status.as_deref())
                    .map(map_review_status)
                    .unwrap_or(ReviewOutcome::Unknown);
                let reasons = if outcome == ReviewOutcome::Rejected {
                    payload
                        .review_result
                        .map(|result| result.reject_labels)
                        .unwrap_or_default()
                } else {
                    Vec::new()
                };
                (Some(outcome), reasons)
            }
            _ => (None, Vec::new()),
        };

        Ok(CanonicalEvent {
            kind,
            subject_id,
            applicant_id: payload.applicant_id,
            provider_type: payload.event_type,
            review_outcome,
            rejection_reasons,
            level_name: payload.level_name,
            received_at: raw.received_at,
            raw,
        })
    }
}

/// Recovers the external subject id from the provider's applicant id.
///
/// The applicant id may be a composite embedding our id after
/// [`EXTERNAL_ID_MARKER`]; split on the first occurrence and take the
/// remainder, otherwise the applicant id itself is the subject id. An empty
/// result is rejected rather than guessed at.
fn recover_subject_id(applicant_id: &str) -> Result<String, NormalizerError> {
    let candidate = match applicant_id.split_once(EXTERNAL_ID_MARKER) {
        Some((_, remainder)) => remainder,
        None => applicant_id,
    };
    if candidate.is_empty() {
        return Err(NormalizerError::MissingSubjectId);
    }
    Ok(candidate.to_string())
}

fn classify(provider_type: &str) -> EventKind {
    match provider_type {
        "applicantCreated" => EventKind::Created,
        "applicantPending" => EventKind::Pending,
        "applicantOnHold" => EventKind::OnHold,
        "applicantReviewed" => EventKind::Reviewed,
        _ => EventKind::Unclassified,
    }
}

fn map_review_status(value: &str) -> ReviewOutcome {
    match value {
        "completed" => ReviewOutcome::Approved,
        "rejected" => ReviewOutcome::Rejected,
        _ => ReviewOutcome::Unknown,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderPayload {
    #[serde(rename = "type")]
    event_type: String,
    applicant_id: String,
    #[serde(default)]
    level_name: Option<String>,
    #[serde(default)]
    review_result: Option<ReviewResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewResult {
    #[serde(default)]
    review_status: Option<String>,
    #[serde(default)]
    reject_labels: Vec<String>,
}

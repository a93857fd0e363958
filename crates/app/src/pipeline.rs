use std::sync::Arc;

use metrics::counter;
use tracing::{error, info, warn};

use idrelay_core::normalizer::{Normalizer, NormalizerError};
use idrelay_core::types::RawEvent;
use idrelay_storage::{FailureKind, NewDeadLetter, NewEventAudit};

use crate::router::AppState;

/// Terminal state of one authenticated webhook run.
pub enum PipelineOutcome {
    /// Cache updated and the downstream acknowledged the event.
    Delivered { subject_id: String },
    /// Cache updated; delivery failed and a dead letter was recorded.
    Accepted { subject_id: String },
    /// Cache updated; the event is unclassified and was quarantined without
    /// a delivery attempt.
    Quarantined { subject_id: String },
    /// The payload never made it past normalization. No state changed.
    Invalid {
        problem_type: &'static str,
        detail: String,
    },
}

/// Runs the post-authentication stages for one raw event.
///
/// Stage order is fixed: normalize, audit, cache update, then delivery.
/// The cache is updated before the forward attempt so downstream outages
/// never mask a status change, and a delivery failure is absorbed into the
/// dead-letter store instead of surfacing to the webhook caller.
pub async fn run(state: AppState, raw: Arc<RawEvent>) -> PipelineOutcome {
    let event = match Normalizer::normalize(raw) {
        Ok(event) => event,
        Err(err) => {
            let problem_type = match &err {
                NormalizerError::MalformedPayload(_) => "malformed_payload",
                NormalizerError::MissingSubjectId => "missing_subject_id",
            };
            counter!("normalize_failure_total", "reason" => problem_type).increment(1);
            warn!(stage = "normalize", error = %err, "rejected inbound payload");
            return PipelineOutcome::Invalid {
                problem_type,
                detail: err.to_string(),
            };
        }
    };

    // Audit is best effort; a failed insert must not drop the signal itself.
    let payload_text = String::from_utf8_lossy(&event.raw.payload);
    if let Err(err) = state
        .storage()
        .event_audit()
        .insert(NewEventAudit {
            subject_id: &event.subject_id,
            event_type: event.kind.as_str(),
            payload: &payload_text,
            received_at: event.received_at,
        })
        .await
    {
        error!(
            stage = "audit",
            subject_id = %event.subject_id,
            error = %err,
            "failed to persist audit copy"
        );
    }

    state.cache().upsert(&event, || state.now()).await;

    if !event.kind.is_classified() {
        counter!("forward_outcome_total", "result" => "quarantined").increment(1);
        warn!(
            stage = "classify",
            subject_id = %event.subject_id,
            provider_type = %event.provider_type,
            "unclassified event quarantined"
        );
        record_dead_letter(
            &state,
            &event.subject_id,
            event.kind.as_str(),
            event.wire_body().to_string(),
            format!("unclassified provider type {}", event.provider_type),
            FailureKind::Unclassified,
        )
        .await;
        return PipelineOutcome::Quarantined {
            subject_id: event.subject_id,
        };
    }

    match state.forwarder().forward(&event).await {
        Ok(ack) => {
            counter!("forward_outcome_total", "result" => "delivered").increment(1);
            info!(
                stage = "forward",
                subject_id = %event.subject_id,
                event_type = %event.kind,
                downstream_status = ack.status,
                reference = ack.reference.as_deref().unwrap_or("-"),
                "event delivered"
            );
            PipelineOutcome::Delivered {
                subject_id: event.subject_id,
            }
        }
        Err(err) => {
            let kind = if err.is_permanent() {
                FailureKind::Permanent
            } else {
                FailureKind::Transient
            };
            counter!(
                "forward_outcome_total",
                "result" => if err.is_permanent() { "permanent" } else { "transient" }
            )
            .increment(1);
            warn!(
                stage = "forward",
                subject_id = %event.subject_id,
                event_type = %event.kind,
                error = %err,
                "delivery failed, recording dead letter"
            );
            record_dead_letter(
                &state,
                &event.subject_id,
                event.kind.as_str(),
                event.wire_body().to_string(),
                err.to_string(),
                kind,
            )
            .await;
            PipelineOutcome::Accepted {
                subject_id: event.subject_id,
            }
        }
    }
}

async fn record_dead_letter(
    state: &AppState,
    subject_id: &str,
    event_type: &str,
    payload_json: String,
    failure_reason: String,
    kind: FailureKind,
) {
    let result = state
        .storage()
        .dead_letters()
        .record(NewDeadLetter {
            subject_id,
            event_type,
            payload_json,
            failure_reason,
            kind,
            failed_at: state.now(),
        })
        .await;

    let kind_label = match kind {
        FailureKind::Transient => "transient",
        FailureKind::Permanent => "permanent",
        FailureKind::Unclassified => "unclassified",
    };

    match result {
        Ok(entry) => {
            counter!("dead_letter_recorded_total", "kind" => kind_label).increment(1);
            info!(stage = "dead_letter", subject_id, id = %entry.id, "dead letter recorded");
        }
        Err(err) => {
            // Both the delivery and the durable fallback failed; this is the
            // one place the relay can actually lose an event, so it logs at
            // the highest severity.
            error!(
                stage = "dead_letter",
                subject_id,
                error = %err,
                "failed to record dead letter after delivery failure"
            );
        }
    }
}

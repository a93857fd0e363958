use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use idrelay_core::types::{CanonicalEvent, StatusRecord};

/// Process-wide keyed store of the latest known verification status per
/// subject.
///
/// This is a read-through cache in front of the provider's own status query,
/// not a system of record: it never calls out to the network, and a miss is
/// answered by the caller querying the provider and then populating it.
///
/// All mutation goes through the write lock, so two concurrent upserts for
/// the same subject cannot interleave into a corrupted merge and
/// `updated_at` reflects true completion order.
#[derive(Clone, Default)]
pub struct StatusCache {
    records: Arc<RwLock<HashMap<String, StatusRecord>>>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a canonical event to the cached record for its subject,
    /// creating the record on first sight.
    ///
    /// `last_event` and `last_review_outcome` are overwritten, `created_at`
    /// is preserved and `updated_at` refreshed. Unclassified events only
    /// touch `last_event`; a previously cached outcome and level survive
    /// them. Applying the identical event twice yields the same record
    /// modulo `updated_at`.
    ///
    /// `clock` is called after the write lock is held, so `updated_at`
    /// is stamped in the order writers completed. A timestamp sampled by
    /// the caller before the lock could be older than the record it
    /// overwrites.
    pub async fn upsert(
        &self,
        event: &CanonicalEvent,
        clock: impl Fn() -> DateTime<Utc>,
    ) -> StatusRecord {
        let mut records = self.records.write().await;
        let now = clock();
        let record = records
            .entry(event.subject_id.clone())
            .and_modify(|record| {
                record.last_event = event.kind;
                if event.kind.is_classified() {
                    record.last_review_outcome = event.review_outcome;
                    if event.level_name.is_some() {
                        record.level_name = event.level_name.clone();
                    }
                }
                record.updated_at = now;
            })
            .or_insert_with(|| StatusRecord {
                subject_id: event.subject_id.clone(),
                last_event: event.kind,
                last_review_outcome: if event.kind.is_classified() {
                    event.review_outcome
                } else {
                    None
                },
                level_name: if event.kind.is_classified() {
                    event.level_name.clone()
                } else {
                    None
                },
                created_at: now,
                updated_at: now,
            });
        record.clone()
    }

    pub async fn lookup(&self, subject_id: &str) -> Option<StatusRecord> {
        self.records.read().await.get(subject_id).cloned()
    }

    /// Removes the record entirely; the subject reverts to "no prior
    /// verification". Used by the profile-reset collaborator.
    pub async fn evict(&self, subject_id: &str) -> bool {
        self.records.write().await.remove(subject_id).is_some()
    }

    /// Fills a miss with a record fetched from the provider.
    ///
    /// Insert-if-absent: a webhook that completed its upsert while the
    /// provider query was in flight is fresher than the queried snapshot and
    /// must not be clobbered.
    pub async fn populate(&self, record: StatusRecord) -> StatusRecord {
        let mut records = self.records.write().await;
        records
            .entry(record.subject_id.clone())
            .or_insert(record)
            .clone()
    }
}

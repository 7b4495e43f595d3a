use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::domain::{Fill, IdempotencyKey, OrderIntent};

/// Placement registry that prevents duplicate submissions.
///
/// Every placement claims its idempotency key before anything is sent. A
/// second placement with the same key either gets the cached fill, is refused
/// while the first is still running, or (after a failure) proceeds in
/// recovery mode, where the gateway asks the venue about the key before
/// submitting anything new.
pub struct PlacementRegistry {
    records: DashMap<String, PlacementRecord>,
    ttl: Duration,
}

#[derive(Debug, Clone)]
struct PlacementRecord {
    fingerprint: String,
    status: PlacementStatus,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
enum PlacementStatus {
    Pending,
    Completed(Fill),
    Failed(String),
}

/// Outcome of claiming a key
#[derive(Debug, Clone)]
pub enum IdempotencyResult {
    /// Never seen; submit normally
    New,
    /// A previous attempt failed; the venue may still hold an order for this key
    Recover { previous_error: String },
    /// Already filled; return the cached fill
    Completed(Fill),
    /// Another placement with this key is running right now
    InFlight,
    /// Key reused for a different request
    Conflict,
}

impl PlacementRegistry {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            records: DashMap::new(),
            ttl: Duration::seconds(ttl_secs.min(i64::MAX as u64) as i64),
        }
    }

    /// Claim `intent.idempotency_key` for a placement attempt
    pub fn check_or_create(&self, intent: &OrderIntent) -> IdempotencyResult {
        let fingerprint = intent.fingerprint();
        let key = intent.idempotency_key.as_str().to_string();
        let now = Utc::now();

        match self.records.entry(key.clone()) {
            Entry::Vacant(entry) => {
                debug!("New idempotency key: {}", entry.key());
                entry.insert(PlacementRecord {
                    fingerprint,
                    status: PlacementStatus::Pending,
                    updated_at: now,
                });
                IdempotencyResult::New
            }
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if record.fingerprint != fingerprint {
                    warn!(
                        "Idempotency key {} reused for a different request",
                        key
                    );
                    return IdempotencyResult::Conflict;
                }
                match &record.status {
                    PlacementStatus::Completed(fill) => {
                        info!("Duplicate placement for {}, returning cached fill", key);
                        IdempotencyResult::Completed(fill.clone())
                    }
                    PlacementStatus::Pending => IdempotencyResult::InFlight,
                    PlacementStatus::Failed(error) => {
                        let previous_error = error.clone();
                        record.status = PlacementStatus::Pending;
                        record.updated_at = now;
                        IdempotencyResult::Recover { previous_error }
                    }
                }
            }
        }
    }

    pub fn mark_completed(&self, key: &IdempotencyKey, fill: &Fill) {
        if let Some(mut record) = self.records.get_mut(key.as_str()) {
            record.status = PlacementStatus::Completed(fill.clone());
            record.updated_at = Utc::now();
            debug!("Marked idempotency key {} as completed", key);
        }
    }

    pub fn mark_failed(&self, key: &IdempotencyKey, error: &str) {
        if let Some(mut record) = self.records.get_mut(key.as_str()) {
            record.status = PlacementStatus::Failed(error.to_string());
            record.updated_at = Utc::now();
            debug!("Marked idempotency key {} as failed: {}", key, error);
        }
    }

    /// Drop a claim when nothing was ever sent, so the key starts fresh
    pub fn release(&self, key: &IdempotencyKey) {
        self.records.remove(key.as_str());
    }

    /// Remove settled records older than the TTL; returns how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let cutoff = Utc::now() - self.ttl;
        let before = self.records.len();
        self.records.retain(|_, r| {
            matches!(r.status, PlacementStatus::Pending) || r.updated_at > cutoff
        });
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            info!("Cleaned up {} expired idempotency keys", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

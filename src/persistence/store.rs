use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::coordination::RetryPolicy;
use crate::domain::{Allocation, KillSwitchState, Position, PositionKey};
use crate::error::StoreError;

/// A stored value and the version it was written at.
///
/// Versions come from one store-wide sequence, so a key that is archived and
/// later recreated never reuses an old version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

/// Durable record of live positions, allocations and the kill switch.
///
/// Every write is a compare-and-set against the version the caller last
/// read; `expected = None` means the key must be absent. Writing a CLOSED
/// position archives it and frees the key.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_position(
        &self,
        key: &PositionKey,
    ) -> Result<Option<Versioned<Position>>, StoreError>;

    /// Returns the new version; 0 when the write archived the position
    async fn put_position(
        &self,
        position: Position,
        expected: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// Positions in OPEN or CLOSING
    async fn list_open_positions(&self) -> Result<Vec<Position>, StoreError>;

    /// Recently archived positions, newest last
    async fn list_closed_positions(&self, limit: usize) -> Result<Vec<Position>, StoreError>;

    async fn get_kill_switch_state(
        &self,
    ) -> Result<Option<Versioned<KillSwitchState>>, StoreError>;

    async fn set_kill_switch_state(
        &self,
        state: KillSwitchState,
        expected: Option<u64>,
    ) -> Result<u64, StoreError>;

    async fn get_allocation(
        &self,
        strategy_id: &str,
    ) -> Result<Option<Versioned<Allocation>>, StoreError>;

    async fn put_allocation(
        &self,
        allocation: Allocation,
        expected: Option<u64>,
    ) -> Result<u64, StoreError>;

    async fn list_allocations(&self) -> Result<Vec<Allocation>, StoreError>;

    /// Make all accepted writes durable
    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Read-modify-write a position under the compare-and-set loop.
///
/// `mutate` sees the freshest stored value on every attempt and returns the
/// value to write, or `None` to leave the key untouched. Conflicts are retried
/// per `policy`; exhaustion surfaces as `RetriesExhausted`.
pub async fn update_position<F>(
    store: &dyn StateStore,
    key: &PositionKey,
    policy: &RetryPolicy,
    mut mutate: F,
) -> Result<Option<Position>, StoreError>
where
    F: FnMut(Option<&Position>) -> Option<Position> + Send,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let current = store.get_position(key).await?;
        let expected = current.as_ref().map(|v| v.version);
        let Some(next) = mutate(current.as_ref().map(|v| &v.value)) else {
            return Ok(None);
        };

        match store.put_position(next.clone(), expected).await {
            Ok(version) => {
                debug!(key = %key, version, status = %next.status, "Position written");
                return Ok(Some(next));
            }
            Err(e) if e.is_conflict() => {
                if !policy.should_retry(attempt) {
                    warn!(key = %key, attempt, "Position CAS retries exhausted");
                    return Err(StoreError::RetriesExhausted {
                        key: key.to_string(),
                        attempts: attempt,
                    });
                }
                debug!(key = %key, attempt, "Position CAS conflict, re-reading");
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Unconditionally write `position`, retrying over concurrent writers
pub async fn upsert_position(
    store: &dyn StateStore,
    position: Position,
    policy: &RetryPolicy,
) -> Result<(), StoreError> {
    let key = position.key();
    update_position(store, &key, policy, |_| Some(position.clone())).await?;
    Ok(())
}

/// Read-modify-write a strategy allocation
pub async fn update_allocation<F>(
    store: &dyn StateStore,
    strategy_id: &str,
    policy: &RetryPolicy,
    mut mutate: F,
) -> Result<Option<Allocation>, StoreError>
where
    F: FnMut(Option<&Allocation>) -> Option<Allocation> + Send,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let current = store.get_allocation(strategy_id).await?;
        let expected = current.as_ref().map(|v| v.version);
        let Some(next) = mutate(current.as_ref().map(|v| &v.value)) else {
            return Ok(None);
        };

        match store.put_allocation(next.clone(), expected).await {
            Ok(_) => return Ok(Some(next)),
            Err(e) if e.is_conflict() => {
                if !policy.should_retry(attempt) {
                    return Err(StoreError::RetriesExhausted {
                        key: format!("allocation/{strategy_id}"),
                        attempts: attempt,
                    });
                }
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

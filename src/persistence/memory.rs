use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::store::{StateStore, Versioned};
use crate::domain::{Allocation, KillSwitchState, Position, PositionKey, PositionStatus};
use crate::error::StoreError;

const DEFAULT_ARCHIVE_LIMIT: usize = 1_000;

/// Serializable image of the whole store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub next_version: u64,
    pub positions: Vec<Versioned<Position>>,
    #[serde(default)]
    pub closed: Vec<Position>,
    pub kill_switch: Option<Versioned<KillSwitchState>>,
    #[serde(default)]
    pub allocations: Vec<Versioned<Allocation>>,
}

/// In-process store; every key is guarded by the map shard lock so a
/// compare-and-set is atomic.
pub struct MemoryStateStore {
    sequence: AtomicU64,
    positions: DashMap<PositionKey, Versioned<Position>>,
    allocations: DashMap<String, Versioned<Allocation>>,
    kill_switch: RwLock<Option<Versioned<KillSwitchState>>>,
    closed: RwLock<VecDeque<Position>>,
    archive_limit: usize,
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            sequence: AtomicU64::new(0),
            positions: DashMap::new(),
            allocations: DashMap::new(),
            kill_switch: RwLock::new(None),
            closed: RwLock::new(VecDeque::new()),
            archive_limit: DEFAULT_ARCHIVE_LIMIT,
        }
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut store = Self::new();
        let mut max_version = snapshot.next_version;
        for p in snapshot.positions {
            max_version = max_version.max(p.version);
            store.positions.insert(p.value.key(), p);
        }
        for a in snapshot.allocations {
            max_version = max_version.max(a.version);
            store.allocations.insert(a.value.strategy_id.clone(), a);
        }
        if let Some(ks) = &snapshot.kill_switch {
            max_version = max_version.max(ks.version);
        }
        store.sequence.store(max_version, Ordering::SeqCst);
        *store.kill_switch.get_mut() = snapshot.kill_switch;
        *store.closed.get_mut() = snapshot.closed.into_iter().collect();
        store
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        let mut positions: Vec<_> = self.positions.iter().map(|e| e.value().clone()).collect();
        positions.sort_by(|a, b| a.value.key().cmp(&b.value.key()));
        let mut allocations: Vec<_> = self.allocations.iter().map(|e| e.value().clone()).collect();
        allocations.sort_by(|a, b| a.value.strategy_id.cmp(&b.value.strategy_id));

        StoreSnapshot {
            next_version: self.sequence.load(Ordering::SeqCst),
            positions,
            closed: self.closed.read().await.iter().cloned().collect(),
            kill_switch: self.kill_switch.read().await.clone(),
            allocations,
        }
    }

    fn next_version(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn conflict(key: String, expected: Option<u64>, actual: Option<u64>) -> StoreError {
        StoreError::Conflict {
            key,
            expected,
            actual,
        }
    }

    async fn archive(&self, position: Position) {
        let mut closed = self.closed.write().await;
        closed.push_back(position);
        while closed.len() > self.archive_limit {
            closed.pop_front();
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get_position(
        &self,
        key: &PositionKey,
    ) -> Result<Option<Versioned<Position>>, StoreError> {
        Ok(self.positions.get(key).map(|e| e.value().clone()))
    }

    async fn put_position(
        &self,
        position: Position,
        expected: Option<u64>,
    ) -> Result<u64, StoreError> {
        let key = position.key();
        let closing_out = position.status == PositionStatus::Closed;

        let archived = match self.positions.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let actual = entry.get().version;
                if expected != Some(actual) {
                    return Err(Self::conflict(key.to_string(), expected, Some(actual)));
                }
                if closing_out {
                    entry.remove();
                    Some(position)
                } else {
                    let version = self.next_version();
                    entry.insert(Versioned {
                        value: position,
                        version,
                    });
                    return Ok(version);
                }
            }
            Entry::Vacant(entry) => {
                if expected.is_some() {
                    return Err(Self::conflict(key.to_string(), expected, None));
                }
                if closing_out {
                    Some(position)
                } else {
                    let version = self.next_version();
                    entry.insert(Versioned {
                        value: position,
                        version,
                    });
                    return Ok(version);
                }
            }
        };

        if let Some(position) = archived {
            self.archive(position).await;
        }
        Ok(0)
    }

    async fn list_open_positions(&self) -> Result<Vec<Position>, StoreError> {
        let mut open: Vec<Position> = self
            .positions
            .iter()
            .filter(|e| e.value().value.is_live())
            .map(|e| e.value().value.clone())
            .collect();
        open.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(open)
    }

    async fn list_closed_positions(&self, limit: usize) -> Result<Vec<Position>, StoreError> {
        let closed = self.closed.read().await;
        let skip = closed.len().saturating_sub(limit);
        Ok(closed.iter().skip(skip).cloned().collect())
    }

    async fn get_kill_switch_state(
        &self,
    ) -> Result<Option<Versioned<KillSwitchState>>, StoreError> {
        Ok(self.kill_switch.read().await.clone())
    }

    async fn set_kill_switch_state(
        &self,
        state: KillSwitchState,
        expected: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut slot = self.kill_switch.write().await;
        let actual = slot.as_ref().map(|v| v.version);
        if actual != expected {
            return Err(Self::conflict("kill_switch".into(), expected, actual));
        }
        let version = self.next_version();
        *slot = Some(Versioned {
            value: state,
            version,
        });
        Ok(version)
    }

    async fn get_allocation(
        &self,
        strategy_id: &str,
    ) -> Result<Option<Versioned<Allocation>>, StoreError> {
        Ok(self.allocations.get(strategy_id).map(|e| e.value().clone()))
    }

    async fn put_allocation(
        &self,
        allocation: Allocation,
        expected: Option<u64>,
    ) -> Result<u64, StoreError> {
        let key = allocation.strategy_id.clone();
        match self.allocations.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let actual = entry.get().version;
                if expected != Some(actual) {
                    return Err(Self::conflict(
                        format!("allocation/{key}"),
                        expected,
                        Some(actual),
                    ));
                }
                let version = self.next_version();
                entry.insert(Versioned {
                    value: allocation,
                    version,
                });
                Ok(version)
            }
            Entry::Vacant(entry) => {
                if expected.is_some() {
                    return Err(Self::conflict(format!("allocation/{key}"), expected, None));
                }
                let version = self.next_version();
                entry.insert(Versioned {
                    value: allocation,
                    version,
                });
                Ok(version)
            }
        }
    }

    async fn list_allocations(&self) -> Result<Vec<Allocation>, StoreError> {
        let mut all: Vec<_> = self
            .allocations
            .iter()
            .map(|e| e.value().value.clone())
            .collect();
        all.sort_by(|a, b| a.strategy_id.cmp(&b.strategy_id));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::RetryPolicy;
    use crate::domain::{MarketKind, PositionSide};
    use crate::persistence::store::update_position;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn open_position(size: Decimal) -> Position {
        Position {
            strategy_id: "momentum".into(),
            symbol: "BTCUSDT".into(),
            venue: "paper".into(),
            side: PositionSide::Long,
            market: MarketKind::Perp,
            size,
            entry_price: dec!(50000),
            hedge_entry_price: None,
            opened_at: Utc::now(),
            status: PositionStatus::Open,
            exit_price: None,
            realized_pnl: None,
            closed_at: None,
            close_reason: None,
        }
    }

    #[tokio::test]
    async fn test_cas_rejects_stale_version() {
        let store = MemoryStateStore::new();
        let v1 = store.put_position(open_position(dec!(1)), None).await.unwrap();

        // Creating again without the version conflicts
        let err = store
            .put_position(open_position(dec!(2)), None)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let v2 = store
            .put_position(open_position(dec!(2)), Some(v1))
            .await
            .unwrap();
        assert!(v2 > v1);
        assert!(store
            .put_position(open_position(dec!(3)), Some(v1))
            .await
            .unwrap_err()
            .is_conflict());
    }

    #[tokio::test]
    async fn test_closed_write_archives_and_frees_key() {
        let store = MemoryStateStore::new();
        let v1 = store.put_position(open_position(dec!(1)), None).await.unwrap();

        let mut closed = open_position(dec!(1));
        closed.status = PositionStatus::Closed;
        assert_eq!(store.put_position(closed, Some(v1)).await.unwrap(), 0);

        let key = PositionKey::new("momentum", "BTCUSDT");
        assert!(store.get_position(&key).await.unwrap().is_none());
        assert!(store.list_open_positions().await.unwrap().is_empty());
        assert_eq!(store.list_closed_positions(10).await.unwrap().len(), 1);

        // A fresh position on the same key gets a strictly newer version
        let v3 = store.put_position(open_position(dec!(1)), None).await.unwrap();
        assert!(v3 > v1);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStateStore::new());
        store.put_position(open_position(dec!(0)), None).await.unwrap();
        let key = PositionKey::new("momentum", "BTCUSDT");

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                update_position(store.as_ref(), &key, &RetryPolicy::store(), |current| {
                    current.map(|p| {
                        let mut next = p.clone();
                        next.size += dec!(1);
                        next
                    })
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let stored = store.get_position(&key).await.unwrap().unwrap();
        assert_eq!(stored.value.size, dec!(32));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_keeps_sequence() {
        let store = MemoryStateStore::new();
        let v = store.put_position(open_position(dec!(1)), None).await.unwrap();
        let restored = MemoryStateStore::from_snapshot(store.snapshot().await);

        let got = restored
            .get_position(&PositionKey::new("momentum", "BTCUSDT"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.version, v);
        let next = restored
            .put_position(open_position(dec!(2)), Some(v))
            .await
            .unwrap();
        assert!(next > v);
    }
}

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::memory::{MemoryStateStore, StoreSnapshot};
use super::store::{StateStore, Versioned};
use crate::domain::{Allocation, KillSwitchState, Position, PositionKey};
use crate::error::StoreError;

/// Memory store persisted as a JSON snapshot after every accepted write.
///
/// A write is applied to a staged copy and reaches memory only once that copy
/// is on disk. The snapshot is synced to a sibling temp file and renamed into
/// place, so a crash leaves either the previous or the new image on disk.
pub struct FileStateStore {
    inner: MemoryStateStore,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStateStore {
    /// Open the store at `path`, loading an existing snapshot if present
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Io(format!("{}: {}", parent.display(), e)))?;
        }

        let inner = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: StoreSnapshot = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Corrupt(format!("{}: {}", path.display(), e)))?;
                info!(
                    path = %path.display(),
                    positions = snapshot.positions.len(),
                    "Loaded state snapshot"
                );
                MemoryStateStore::from_snapshot(snapshot)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No state snapshot, starting empty");
                MemoryStateStore::new()
            }
            Err(e) => return Err(StoreError::Io(format!("{}: {}", path.display(), e))),
        };

        Ok(Self {
            inner,
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `write` to a staged copy, persist it, then commit to memory.
    /// Writers are serialized so the staged copy matches `inner` throughout.
    async fn commit<F>(&self, write: F) -> Result<u64, StoreError>
    where
        F: for<'a> Fn(&'a MemoryStateStore) -> BoxFuture<'a, Result<u64, StoreError>>,
    {
        let _guard = self.write_lock.lock().await;
        let staged = MemoryStateStore::from_snapshot(self.inner.snapshot().await);
        let version = write(&staged).await?;
        self.write_snapshot(&staged.snapshot().await).await?;
        write(&self.inner).await?;
        Ok(version)
    }

    async fn write_snapshot(&self, snapshot: &StoreSnapshot) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| StoreError::Io(format!("serialize snapshot: {}", e)))?;

        let tmp = self.path.with_extension("json.tmp");
        let write = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &self.path).await
        };
        write.await.map_err(|e| {
            error!(path = %self.path.display(), "State snapshot write failed: {}", e);
            StoreError::Io(format!("{}: {}", self.path.display(), e))
        })?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "State snapshot written");
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get_position(
        &self,
        key: &PositionKey,
    ) -> Result<Option<Versioned<Position>>, StoreError> {
        self.inner.get_position(key).await
    }

    async fn put_position(
        &self,
        position: Position,
        expected: Option<u64>,
    ) -> Result<u64, StoreError> {
        self.commit(|store| store.put_position(position.clone(), expected))
            .await
    }

    async fn list_open_positions(&self) -> Result<Vec<Position>, StoreError> {
        self.inner.list_open_positions().await
    }

    async fn list_closed_positions(&self, limit: usize) -> Result<Vec<Position>, StoreError> {
        self.inner.list_closed_positions(limit).await
    }

    async fn get_kill_switch_state(
        &self,
    ) -> Result<Option<Versioned<KillSwitchState>>, StoreError> {
        self.inner.get_kill_switch_state().await
    }

    async fn set_kill_switch_state(
        &self,
        state: KillSwitchState,
        expected: Option<u64>,
    ) -> Result<u64, StoreError> {
        self.commit(|store| store.set_kill_switch_state(state.clone(), expected))
            .await
    }

    async fn get_allocation(
        &self,
        strategy_id: &str,
    ) -> Result<Option<Versioned<Allocation>>, StoreError> {
        self.inner.get_allocation(strategy_id).await
    }

    async fn put_allocation(
        &self,
        allocation: Allocation,
        expected: Option<u64>,
    ) -> Result<u64, StoreError> {
        self.commit(|store| store.put_allocation(allocation.clone(), expected))
            .await
    }

    async fn list_allocations(&self) -> Result<Vec<Allocation>, StoreError> {
        self.inner.list_allocations().await
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.write_snapshot(&self.inner.snapshot().await).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::KillSwitchState;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let store = FileStateStore::open(&path).await.unwrap();
            let mut ks = KillSwitchState::new(Utc::now().date_naive());
            ks.roll_day(Utc::now().date_naive(), dec!(10000));
            store.set_kill_switch_state(ks, None).await.unwrap();
        }

        let reopened = FileStateStore::open(&path).await.unwrap();
        let ks = reopened.get_kill_switch_state().await.unwrap().unwrap();
        assert_eq!(ks.value.high_water_mark, dec!(10000));
        assert!(reopened.list_open_positions().await.unwrap().is_empty());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();

        match FileStateStore::open(&path).await {
            Err(StoreError::Corrupt(_)) => {}
            other => panic!("expected corrupt snapshot, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_failed_write_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let store = FileStateStore::open(state_dir.join("state.json")).await.unwrap();

        let today = Utc::now().date_naive();
        let mut ks = KillSwitchState::new(today);
        ks.roll_day(today, dec!(10000));
        let version = store.set_kill_switch_state(ks.clone(), None).await.unwrap();

        std::fs::remove_dir_all(&state_dir).unwrap();
        ks.roll_day(today, dec!(12000));
        match store.set_kill_switch_state(ks, Some(version)).await {
            Err(StoreError::Io(_)) => {}
            other => panic!("expected io error, got {:?}", other),
        }

        let current = store.get_kill_switch_state().await.unwrap().unwrap();
        assert_eq!(current.version, version);
        assert_eq!(current.value.high_water_mark, dec!(10000));
    }

    #[tokio::test]
    async fn test_version_conflict_does_not_touch_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = FileStateStore::open(&path).await.unwrap();

        let today = Utc::now().date_naive();
        let mut ks = KillSwitchState::new(today);
        ks.roll_day(today, dec!(10000));
        store.set_kill_switch_state(ks.clone(), None).await.unwrap();
        let on_disk = std::fs::read(&path).unwrap();

        match store.set_kill_switch_state(ks, Some(99)).await {
            Err(StoreError::Conflict { .. }) => {}
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(std::fs::read(&path).unwrap(), on_disk);
    }
}

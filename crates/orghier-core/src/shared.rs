//! Shared handle for concurrent use
//!
//! Readers run concurrently; writers are serialized behind the lock and each
//! write runs as one store transaction.

use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::HierarchyResult;
use crate::store::{HierarchyStore, RepairTransaction};

/// Cloneable, lock-guarded [`HierarchyStore`].
#[derive(Debug, Clone, Default)]
pub struct SharedHierarchy {
    inner: Arc<RwLock<HierarchyStore>>,
}

impl SharedHierarchy {
    /// Wrap an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing store.
    pub fn from_store(store: HierarchyStore) -> Self {
        Self {
            inner: Arc::new(RwLock::new(store)),
        }
    }

    /// Run `f` against a read lock.
    pub async fn read<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&HierarchyStore) -> T,
    {
        let store = self.inner.read().await;
        f(&store)
    }

    /// Run `f` as one transaction under the write lock.
    ///
    /// On error nothing `f` did is kept.
    pub async fn write<T, F>(&self, label: &'static str, f: F) -> HierarchyResult<T>
    where
        F: FnOnce(&mut RepairTransaction<'_>) -> HierarchyResult<T>,
    {
        let mut store = self.inner.write().await;
        store.transaction(label, f)
    }

    /// Copy of the current store.
    pub async fn snapshot(&self) -> HierarchyStore {
        self.inner.read().await.clone()
    }
}

//! Directory sources
//!
//! A [`DirectorySource`] answers "what does the directory say about this
//! person or group": a record of multi-valued attributes keyed by the
//! entity's directory key (for example a username).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::SyncResult;

/// Attributes the directory holds for one key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    /// Directory key, e.g. a username
    pub key: String,

    /// Multi-valued attributes
    pub attributes: HashMap<String, Vec<String>>,
}

impl DirectoryRecord {
    /// Create a record with no attributes.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            attributes: HashMap::new(),
        }
    }

    /// Append values to an attribute.
    pub fn with_values<I, V>(mut self, attribute: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.attributes
            .entry(attribute.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Values of an attribute; empty if absent.
    pub fn values(&self, attribute: &str) -> &[String] {
        self.attributes
            .get(attribute)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// A directory service that can be queried by key.
#[async_trait]
pub trait DirectorySource: Send + Sync {
    /// Look up a record; `None` if the directory has no such key.
    async fn lookup(&self, key: &str) -> SyncResult<Option<DirectoryRecord>>;

    /// Get source name for logging.
    fn name(&self) -> &str;
}

/// In-memory directory, for tests and for deployments that load a directory
/// dump up front.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    records: Arc<RwLock<HashMap<String, DirectoryRecord>>>,
}

impl StaticDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a record.
    pub async fn insert(&self, record: DirectoryRecord) {
        self.records.write().await.insert(record.key.clone(), record);
    }

    /// Remove a record.
    pub async fn remove(&self, key: &str) -> Option<DirectoryRecord> {
        self.records.write().await.remove(key)
    }

    /// Number of records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the directory is empty.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl DirectorySource for StaticDirectory {
    async fn lookup(&self, key: &str) -> SyncResult<Option<DirectoryRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    fn name(&self) -> &str {
        "static"
    }
}

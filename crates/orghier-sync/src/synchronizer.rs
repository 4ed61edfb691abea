//! Directory-driven membership synchronization

use chrono::{DateTime, Utc};
use orghier_core::{DirectorySyncConfig, EntityId, EntityKind, MembershipChanges, SharedHierarchy};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::SyncResult;
use crate::source::{DirectoryRecord, DirectorySource};

/// An entity to synchronize and the key the directory knows it by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTarget {
    /// Users or projects
    pub kind: EntityKind,

    /// Entity in the membership ledger
    pub entity: EntityId,

    /// Directory key
    pub key: String,
}

impl SyncTarget {
    /// Create a user target.
    pub fn user(entity: EntityId, key: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::User,
            entity,
            key: key.into(),
        }
    }

    /// Create a project target.
    pub fn project(entity: EntityId, key: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Project,
            entity,
            key: key.into(),
        }
    }
}

/// Outcome of a batch run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run finished
    pub finished_at: DateTime<Utc>,

    /// Targets whose memberships changed
    pub changed: Vec<String>,

    /// Targets already up to date
    pub unchanged: usize,

    /// Keys the directory does not know
    pub missing: Vec<String>,

    /// Keys that failed, with the error
    pub failed: Vec<(String, String)>,
}

/// Keeps memberships in line with a [`DirectorySource`].
///
/// For each target the primary attribute's values come first, then the
/// secondary attribute's. When the primary attribute is present, the first
/// of its values marks the primary membership.
#[derive(Debug)]
pub struct DirectorySynchronizer<S> {
    source: Arc<S>,
    hierarchy: SharedHierarchy,
    config: DirectorySyncConfig,
}

impl<S: DirectorySource> DirectorySynchronizer<S> {
    /// Create a synchronizer over `hierarchy`.
    pub fn new(source: Arc<S>, hierarchy: SharedHierarchy, config: DirectorySyncConfig) -> Self {
        Self {
            source,
            hierarchy,
            config,
        }
    }

    /// Get the sync configuration.
    pub fn config(&self) -> &DirectorySyncConfig {
        &self.config
    }

    /// Directory strings for a record, primary values first, and whether the
    /// first one is the primary affiliation.
    fn directory_strings(&self, record: &DirectoryRecord) -> (Vec<String>, bool) {
        let primary = record.values(&self.config.primary_attribute_name);
        let secondary = record.values(&self.config.secondary_attribute_name);
        let strings = primary.iter().chain(secondary).cloned().collect();
        (strings, !primary.is_empty())
    }

    async fn fetch(&self, target: &SyncTarget) -> SyncResult<Option<DirectoryRecord>> {
        let record = self.source.lookup(&target.key).await?;
        if record.is_none() {
            warn!(
                source = self.source.name(),
                key = %target.key,
                "Directory has no record"
            );
        }
        Ok(record)
    }

    /// Synchronize one target.
    ///
    /// Returns `None` if the directory has no record for the key; the
    /// target's memberships are then left alone.
    pub async fn sync_one(&self, target: &SyncTarget) -> SyncResult<Option<MembershipChanges>> {
        let Some(record) = self.fetch(target).await? else {
            return Ok(None);
        };
        let (strings, first_is_primary) = self.directory_strings(&record);
        let options = self.config.sync_options(first_is_primary);
        let (kind, entity) = (target.kind, target.entity);
        let changes = self
            .hierarchy
            .write("directory_sync", move |tx| {
                tx.sync_memberships(kind, entity, &strings, options)
            })
            .await?;
        debug!(
            key = %target.key,
            kind = %kind,
            added = changes.added.len(),
            removed = changes.removed.len(),
            "Synchronized memberships"
        );
        Ok(Some(changes))
    }

    /// Report what [`sync_one`](Self::sync_one) would change.
    pub async fn preview(&self, target: &SyncTarget) -> SyncResult<Option<MembershipChanges>> {
        let Some(record) = self.fetch(target).await? else {
            return Ok(None);
        };
        let (strings, first_is_primary) = self.directory_strings(&record);
        let options = self.config.sync_options(first_is_primary);
        let changes = self
            .hierarchy
            .read(|store| store.preview_sync(target.kind, target.entity, &strings, options))
            .await?;
        Ok(Some(changes))
    }

    /// Synchronize every target, continuing past failures.
    pub async fn sync_all(&self, targets: &[SyncTarget]) -> SyncReport {
        let started_at = Utc::now();
        let mut report = SyncReport {
            started_at,
            finished_at: started_at,
            changed: Vec::new(),
            unchanged: 0,
            missing: Vec::new(),
            failed: Vec::new(),
        };

        for target in targets {
            match self.sync_one(target).await {
                Ok(Some(changes)) if changes.is_empty() => report.unchanged += 1,
                Ok(Some(_)) => report.changed.push(target.key.clone()),
                Ok(None) => report.missing.push(target.key.clone()),
                Err(err) => {
                    warn!(key = %target.key, error = %err, "Directory sync failed");
                    report.failed.push((target.key.clone(), err.to_string()));
                }
            }
        }

        report.finished_at = Utc::now();
        info!(
            source = self.source.name(),
            changed = report.changed.len(),
            unchanged = report.unchanged,
            missing = report.missing.len(),
            failed = report.failed.len(),
            "Directory sync finished"
        );
        report
    }
}

//! # Directory Synchronization
//!
//! Keeps organization memberships in line with what a directory service
//! (typically LDAP) reports for each user or project.
//!
//! ## Overview
//!
//! The orghier-sync crate handles:
//! - **Sources**: The [`DirectorySource`] trait for looking up directory
//!   records by key, with an in-memory [`StaticDirectory`]
//! - **Synchronization**: [`DirectorySynchronizer`] maps a record's
//!   affiliation strings to orgs and reconciles the entity's memberships
//! - **Reporting**: [`SyncReport`] summarizes a batch run
//!
//! ## Usage
//!
//! ```rust,no_run
//! use orghier_core::{DirectorySyncConfig, SharedHierarchy};
//! use orghier_sync::{DirectorySynchronizer, StaticDirectory, SyncTarget};
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! async fn nightly(hierarchy: SharedHierarchy, directory: Arc<StaticDirectory>) {
//!     let config = DirectorySyncConfig::default();
//!     let sync = DirectorySynchronizer::new(directory, hierarchy, config);
//!
//!     let targets = vec![SyncTarget::user(Uuid::now_v7(), "alice")];
//!     let report = sync.sync_all(&targets).await;
//!     println!("{} changed, {} missing", report.changed.len(), report.missing.len());
//! }
//! ```

pub mod error;
pub mod source;
pub mod synchronizer;

pub use error::{SyncError, SyncResult};
pub use source::{DirectoryRecord, DirectorySource, StaticDirectory};
pub use synchronizer::{DirectorySynchronizer, SyncReport, SyncTarget};

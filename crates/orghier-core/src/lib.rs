//! # Organization Hierarchy
//!
//! This crate models an institution's organizational structure as a strict
//! tiered tree, together with the user and project memberships attached to it
//! and the mapping from directory-service strings to orgs.
//!
//! ## Overview
//!
//! The orghier-core crate handles:
//! - **Levels**: An ordered chain of tiers (for example University, College,
//!   Department), ranked from the root down
//! - **Orgs**: A forest of organization units, each sitting on one level and
//!   parented on the level above
//! - **Memberships**: User-org and project-org links with at most one primary
//!   per entity
//! - **Directory mapping**: Opaque directory strings resolved to orgs, with
//!   placeholder creation for strings nobody has mapped yet
//! - **Validation**: A full audit of every structural invariant
//! - **Tier mutation**: Inserting or deleting a whole tier while keeping the
//!   hierarchy valid
//!
//! ## Architecture
//!
//! ```text
//! HierarchyStore
//!   ├─ LevelRegistry ── Level (rank, parent level, export flag)
//!   ├─ OrgTree ──────── Org (code, names, level, parent org)
//!   ├─ MembershipLedger
//!   │     ├─ user links ──→ Org
//!   │     └─ project links ──→ Org
//!   └─ DirectoryMap ─── directory string ──→ Org
//!
//! RepairTransaction: snapshot, mutate, audit, commit or roll back
//! SharedHierarchy:   Arc<RwLock<HierarchyStore>> for async callers
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use orghier_core::{EntityKind, HierarchyStore, MembershipRequest, OrgSpec};
//! use uuid::Uuid;
//!
//! let mut store = HierarchyStore::new();
//! let univ = store.create_level("University", 40, None, true).unwrap();
//! let coll = store.create_level("College", 30, Some(univ), true).unwrap();
//!
//! let umd = store.insert_node(OrgSpec::new("UMD", univ)).unwrap().id;
//! let cmns = store
//!     .insert_node(OrgSpec::new("CMNS", coll).with_parent(umd))
//!     .unwrap()
//!     .id;
//! assert_eq!(store.orgs().fullcode(cmns).as_deref(), Some("UMD-CMNS"));
//!
//! let user = Uuid::now_v7();
//! store
//!     .set_memberships(
//!         EntityKind::User,
//!         user,
//!         &[MembershipRequest::new("UMD-CMNS").with_primary(true)],
//!         Default::default(),
//!     )
//!     .unwrap();
//! assert_eq!(store.primary(EntityKind::User, user).unwrap().org, cmns);
//!
//! // A new top tier pushes the existing roots under a placeholder
//! store.insert_level("Country", 50, None, true).unwrap();
//! assert_eq!(store.orgs().fullcode(cmns).as_deref(), Some("Unknown-UMD-CMNS"));
//! assert!(store.audit().is_ok());
//! ```
//!
//! ## Configuration
//!
//! [`HierarchyConfig::from_env`] reads `ORGHIER_*` environment variables for
//! the validation policy, directory sync and export settings.

pub mod config;
pub mod directory;
pub mod error;
pub mod export;
pub mod import;
pub mod level;
pub mod membership;
pub mod organization;
pub mod query;
pub mod shared;
pub mod store;
pub mod tiers;
pub mod validate;

pub use config::{ConfigError, DirectorySyncConfig, HierarchyConfig, ValidationPolicy};
pub use directory::{DirectoryEntry, DirectoryMap, SyncOptions, UNKNOWN_CODE};
pub use error::{HierarchyError, HierarchyResult};
pub use export::{
    entity_hierarchy_map, hierarchy_rows, render_delimited, render_json, ExportConfig, ExportLeaf,
    HierarchyRow, ProjectRecord,
};
pub use import::ImportSummary;
pub use level::{Level, LevelChain, LevelId, LevelRegistry, LevelUpdate};
pub use membership::{
    EntityId, EntityKind, MembershipChanges, MembershipLedger, MembershipLink, MembershipRequest,
    OrgRef, SetMembershipOptions,
};
pub use organization::{
    validate_code, NameField, Org, OrgId, OrgTree, UniqueNames, FULLCODE_SEPARATOR,
};
pub use query::{MembershipQuery, OrgQuery};
pub use shared::SharedHierarchy;
pub use store::{HierarchyStore, NodeOutcome, OrgSpec, RepairTransaction};
pub use tiers::PLACEHOLDER_PREFIX;
pub use validate::{
    validate_levels, validate_orgs, HierarchyInvariantError, HierarchyValidator,
    OrgValidationOptions, Violation,
};

//! Hierarchy store and transactions
//!
//! `HierarchyStore` owns the level registry, the org tree, the membership
//! ledger and the directory map. Multi-step mutations run inside a
//! [`RepairTransaction`]: the guard snapshots the state on entry and puts it
//! back on every exit path that does not commit. Repair transactions also
//! suspend inline structural checks for their own duration; the suspension is
//! tied to the guard's lifetime, so an early return or a panic cannot leave
//! checks disabled.

use std::ops::{Deref, DerefMut};
use tracing::{debug, info, warn};

use crate::config::{HierarchyConfig, ValidationPolicy};
use crate::directory::DirectoryMap;
use crate::error::{HierarchyError, HierarchyResult};
use crate::level::{LevelId, LevelRegistry, LevelUpdate};
use crate::membership::MembershipLedger;
use crate::organization::{validate_code, Org, OrgId, OrgTree};
use crate::validate::{HierarchyInvariantError, HierarchyValidator, OrgValidationOptions};

/// Everything a transaction snapshots.
#[derive(Debug, Clone, Default)]
pub(crate) struct HierarchyState {
    pub(crate) levels: LevelRegistry,
    pub(crate) orgs: OrgTree,
    pub(crate) memberships: MembershipLedger,
    pub(crate) directory: DirectoryMap,
    /// Memoized "Unknown" root org for directory placeholders
    pub(crate) unknown_root: Option<OrgId>,
}

/// In-memory organization hierarchy.
///
/// # Examples
///
/// ```
/// use orghier_core::{HierarchyStore, OrgSpec};
///
/// let mut store = HierarchyStore::new();
/// let univ = store.create_level("University", 40, None, true).unwrap();
/// let umd = store
///     .insert_node(OrgSpec::new("UMD", univ).with_names("UMCP", "University of Maryland"))
///     .unwrap();
/// assert!(umd.created);
/// assert_eq!(store.orgs().get(umd.id).unwrap().shortname, "UMCP");
/// ```
#[derive(Debug, Clone, Default)]
pub struct HierarchyStore {
    state: HierarchyState,
    policy: ValidationPolicy,
    depth: u32,
    suspended: u32,
}

impl HierarchyStore {
    /// Create an empty store with the default validation policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store with the given validation policy.
    pub fn with_policy(policy: ValidationPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Create an empty store from loaded configuration.
    pub fn from_config(config: &HierarchyConfig) -> Self {
        Self::with_policy(config.validation)
    }

    /// The level registry.
    pub fn levels(&self) -> &LevelRegistry {
        &self.state.levels
    }

    /// The org tree.
    pub fn orgs(&self) -> &OrgTree {
        &self.state.orgs
    }

    /// The membership ledger.
    pub fn memberships(&self) -> &MembershipLedger {
        &self.state.memberships
    }

    /// The directory-string map.
    pub fn directory(&self) -> &DirectoryMap {
        &self.state.directory
    }

    /// Active validation policy.
    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    pub(crate) fn state(&self) -> &HierarchyState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut HierarchyState {
        &mut self.state
    }

    /// Check if inline structural checks are active (no repair in progress).
    pub fn checks_enabled(&self) -> bool {
        self.suspended == 0
    }

    /// Borrow a validator over the current state.
    pub fn validator(&self) -> HierarchyValidator<'_> {
        HierarchyValidator::new(&self.state.levels, &self.state.orgs, &self.state.memberships)
    }

    /// Audit the level chain.
    pub fn validate_levels(&self) -> Result<(), HierarchyInvariantError> {
        self.validator().validate_levels()
    }

    /// Audit the org tree (and the ledger, if requested).
    pub fn validate_orgs(&self, options: &OrgValidationOptions) -> Result<(), HierarchyInvariantError> {
        self.validator().validate_orgs(options)
    }

    /// Audit everything with the store's policy.
    pub fn audit(&self) -> Result<(), HierarchyInvariantError> {
        self.validator().audit(&self.policy.org_options())
    }

    /// Run `f` atomically.
    ///
    /// If `f` fails, or the commit audit fails, every change made inside is
    /// discarded. Inline checks stay active.
    pub fn transaction<T, F>(&mut self, label: &'static str, f: F) -> HierarchyResult<T>
    where
        F: FnOnce(&mut RepairTransaction<'_>) -> HierarchyResult<T>,
    {
        let mut tx = RepairTransaction::begin(self, label, false);
        let value = f(&mut tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run `f` atomically with inline structural checks suspended.
    ///
    /// Used by the tier mutator, whose intermediate states are not valid
    /// hierarchies.
    pub(crate) fn repair<T, F>(&mut self, label: &'static str, f: F) -> HierarchyResult<T>
    where
        F: FnOnce(&mut RepairTransaction<'_>) -> HierarchyResult<T>,
    {
        let mut tx = RepairTransaction::begin(self, label, true);
        let value = f(&mut tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Append a level: the first root, or a new leaf below the current leaf.
    ///
    /// Use [`HierarchyStore::insert_level`] to splice a tier anywhere else.
    pub fn create_level(
        &mut self,
        name: impl Into<String>,
        rank: i32,
        parent: Option<LevelId>,
        export_flag: bool,
    ) -> HierarchyResult<LevelId> {
        let name = name.into();
        let id = self.state.levels.append(name.clone(), rank, parent, export_flag)?;
        info!(level = %name, rank, "Created level");
        Ok(id)
    }

    /// Edit a level's name, rank or export flag.
    pub fn update_level(&mut self, id: LevelId, update: LevelUpdate) -> HierarchyResult<()> {
        self.state.levels.update(id, update)?;
        debug!(level = %id, "Updated level");
        Ok(())
    }

    /// Delete a level nothing refers to.
    ///
    /// Fails with `ReferentialIntegrity` while any org sits on the level or
    /// another level names it as parent. [`HierarchyStore::delete_level`]
    /// repairs those references first.
    pub fn remove_level(&mut self, id: LevelId) -> HierarchyResult<()> {
        let level = self.state.levels.require(id)?.clone();
        if let Some(child) = self.state.levels.child(id) {
            return Err(HierarchyError::ReferentialIntegrity {
                entity: "level",
                id,
                reason: format!("level '{}' is the parent of '{}'", level.name, child.name),
            });
        }
        let orgs = self.state.orgs.at_level(id).len();
        if orgs > 0 {
            return Err(HierarchyError::ReferentialIntegrity {
                entity: "level",
                id,
                reason: format!("{} org(s) are on level '{}'", orgs, level.name),
            });
        }
        self.state.levels.remove_unchecked(id);
        info!(level = %level.name, "Removed level");
        Ok(())
    }

    /// Create or update the org identified by `(parent, code)`.
    ///
    /// On creation a missing short name defaults to the long name and then
    /// the code; a missing long name defaults to the short name and then the
    /// code. On update only the fields set in `spec` change. Fails with
    /// `StructuralMismatch` if the parent does not sit on the level's parent
    /// level.
    pub fn insert_node(&mut self, spec: OrgSpec) -> HierarchyResult<NodeOutcome> {
        validate_code(&spec.code)?;
        let level = self.state.levels.require(spec.level)?.clone();
        if let Some(parent) = spec.parent {
            self.state.orgs.require(parent)?;
        }
        if self.checks_enabled() {
            self.check_placement(&spec.code, level.parent, spec.parent)?;
        }

        if let Some(existing) = self.state.orgs.find_child(spec.parent, &spec.code) {
            let mut org = existing.clone();
            if org.level != spec.level && self.state.orgs.has_children(org.id) {
                return Err(HierarchyError::StructuralMismatch {
                    org: spec.code,
                    reason: "cannot move an org with children to another level".to_string(),
                });
            }
            let before = org.clone();
            org.level = spec.level;
            if let Some(shortname) = spec.shortname {
                org.shortname = shortname;
            }
            if let Some(longname) = spec.longname {
                org.longname = longname;
            }
            if let Some(selectable) = spec.selectable_for_user {
                org.selectable_for_user = selectable;
            }
            if let Some(selectable) = spec.selectable_for_project {
                org.selectable_for_project = selectable;
            }
            let updated = org != before;
            if updated {
                self.state.orgs.replace(org)?;
                debug!(org = %spec.code, "Updated org");
            }
            return Ok(NodeOutcome {
                id: before.id,
                created: false,
                updated,
            });
        }

        let shortname = spec
            .shortname
            .clone()
            .or_else(|| spec.longname.clone())
            .unwrap_or_else(|| spec.code.clone());
        let longname = spec
            .longname
            .clone()
            .or_else(|| spec.shortname.clone())
            .unwrap_or_else(|| spec.code.clone());
        let org = Org::new(spec.code, spec.level, spec.parent, shortname, longname).with_selectable(
            spec.selectable_for_user.unwrap_or(true),
            spec.selectable_for_project.unwrap_or(true),
        );
        let id = self.state.orgs.insert(org)?;
        info!(
            org = %self.state.orgs.fullcode(id).unwrap_or_default(),
            level = %level.name,
            "Created org"
        );
        Ok(NodeOutcome {
            id,
            created: true,
            updated: false,
        })
    }

    /// Create a new org under `spec.parent`.
    ///
    /// Unlike [`insert_node`](Self::insert_node) this never updates: it fails
    /// with `UniquenessConflict` if the parent already has a child with the
    /// same code. Imports and directory sync keep using the upsert.
    pub fn create_org(&mut self, spec: OrgSpec) -> HierarchyResult<NodeOutcome> {
        validate_code(&spec.code)?;
        if self.state.orgs.find_child(spec.parent, &spec.code).is_some() {
            return Err(HierarchyError::UniquenessConflict {
                field: "code",
                scope: self.state.orgs.scope_name(spec.parent),
                value: spec.code,
            });
        }
        self.insert_node(spec)
    }

    fn check_placement(
        &self,
        code: &str,
        level_parent: Option<LevelId>,
        parent: Option<OrgId>,
    ) -> HierarchyResult<()> {
        match (level_parent, parent) {
            (None, None) => Ok(()),
            (None, Some(_)) => Err(HierarchyError::StructuralMismatch {
                org: code.to_string(),
                reason: "orgs on the root level may not have a parent".to_string(),
            }),
            (Some(expected), None) => Err(HierarchyError::StructuralMismatch {
                org: code.to_string(),
                reason: format!(
                    "a parent on level '{}' is required",
                    self.level_name(expected)
                ),
            }),
            (Some(expected), Some(parent)) => {
                let parent = self.state.orgs.require(parent)?;
                if parent.level == expected {
                    Ok(())
                } else {
                    Err(HierarchyError::StructuralMismatch {
                        org: code.to_string(),
                        reason: format!(
                            "parent '{}' is on level '{}', expected '{}'",
                            parent.code,
                            self.level_name(parent.level),
                            self.level_name(expected)
                        ),
                    })
                }
            }
        }
    }

    fn level_name(&self, id: LevelId) -> String {
        self.state
            .levels
            .get(id)
            .map(|l| l.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    /// Delete a childless org.
    ///
    /// Fails with `ReferentialIntegrity` if the org has children, or has
    /// membership links and `dissociate` is false. With `dissociate`, its
    /// links are removed along with it. Directory entries pointing at the org
    /// are always removed.
    pub fn delete_org(&mut self, id: OrgId, dissociate: bool) -> HierarchyResult<()> {
        let org = self.state.orgs.require(id)?.clone();
        let children = self.state.orgs.children(Some(id)).len();
        if children > 0 {
            return Err(HierarchyError::ReferentialIntegrity {
                entity: "org",
                id,
                reason: format!("org '{}' has {} child org(s)", org.code, children),
            });
        }
        if !dissociate && self.state.memberships.references_org(id) {
            return Err(HierarchyError::ReferentialIntegrity {
                entity: "org",
                id,
                reason: format!("org '{}' has membership links", org.code),
            });
        }
        let fullcode = self.state.orgs.fullcode(id).unwrap_or_default();
        let links = self.state.memberships.remove_org(id);
        let entries = self.state.directory.remove_for_org(id);
        self.detach_org(id);
        info!(org = %fullcode, links, entries, "Deleted org");
        Ok(())
    }

    /// Remove the org record and forget it as the memoized unknown root.
    pub(crate) fn detach_org(&mut self, id: OrgId) -> Option<Org> {
        if self.state.unknown_root == Some(id) {
            self.state.unknown_root = None;
        }
        self.state.orgs.remove_unchecked(id)
    }

    /// Look up an org by fullcode, failing with `NotFound`.
    pub fn org_by_fullcode(&self, fullcode: &str) -> HierarchyResult<&Org> {
        self.state
            .orgs
            .by_fullcode(fullcode)
            .ok_or_else(|| HierarchyError::org_not_found(fullcode))
    }

    /// Look up a level by name, failing with `NotFound`.
    pub fn level_by_name(&self, name: &str) -> HierarchyResult<LevelId> {
        self.state
            .levels
            .by_name(name)
            .map(|l| l.id)
            .ok_or_else(|| HierarchyError::level_not_found(name))
    }
}

/// Desired state of one org for [`HierarchyStore::insert_node`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgSpec {
    /// Code, unique among siblings
    pub code: String,

    /// Target level
    pub level: LevelId,

    /// Parent org (None at the root level)
    pub parent: Option<OrgId>,

    /// Short name; defaulted on creation, kept on update when unset
    pub shortname: Option<String>,

    /// Long name; defaulted on creation, kept on update when unset
    pub longname: Option<String>,

    /// User selectability; true on creation when unset
    pub selectable_for_user: Option<bool>,

    /// Project selectability; true on creation when unset
    pub selectable_for_project: Option<bool>,
}

impl OrgSpec {
    /// Start a spec for `code` on `level`.
    pub fn new(code: impl Into<String>, level: LevelId) -> Self {
        Self {
            code: code.into(),
            level,
            parent: None,
            shortname: None,
            longname: None,
            selectable_for_user: None,
            selectable_for_project: None,
        }
    }

    /// Set the parent org.
    pub fn with_parent(mut self, parent: OrgId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Set the short name.
    pub fn with_shortname(mut self, shortname: impl Into<String>) -> Self {
        self.shortname = Some(shortname.into());
        self
    }

    /// Set the long name.
    pub fn with_longname(mut self, longname: impl Into<String>) -> Self {
        self.longname = Some(longname.into());
        self
    }

    /// Set both names.
    pub fn with_names(self, shortname: impl Into<String>, longname: impl Into<String>) -> Self {
        self.with_shortname(shortname).with_longname(longname)
    }

    /// Set selectability for users and projects.
    pub fn with_selectable(mut self, for_user: bool, for_project: bool) -> Self {
        self.selectable_for_user = Some(for_user);
        self.selectable_for_project = Some(for_project);
        self
    }
}

/// Result of [`HierarchyStore::insert_node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeOutcome {
    /// Id of the created or existing org
    pub id: OrgId,

    /// A new org was created
    pub created: bool,

    /// An existing org had fields changed
    pub updated: bool,
}

/// Scoped transaction over a [`HierarchyStore`].
///
/// Dereferences to the store, so every store operation is available inside.
/// Dropping the guard without [`commit`](RepairTransaction::commit) restores
/// the state captured when it began. A repair transaction also holds inline
/// checks suspended until it is committed or dropped.
pub struct RepairTransaction<'a> {
    store: &'a mut HierarchyStore,
    snapshot: Option<HierarchyState>,
    label: &'static str,
    suspends: bool,
    released: bool,
}

impl<'a> RepairTransaction<'a> {
    fn begin(store: &'a mut HierarchyStore, label: &'static str, suspends: bool) -> Self {
        let snapshot = Some(store.state.clone());
        store.depth += 1;
        if suspends {
            store.suspended += 1;
        }
        debug!(transaction = label, depth = store.depth, "Began transaction");
        Self {
            store,
            snapshot,
            label,
            suspends,
            released: false,
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.store.depth -= 1;
        if self.suspends {
            self.store.suspended -= 1;
        }
    }

    /// Keep the changes.
    ///
    /// Inline checks are restored first. The outermost commit then runs the
    /// audit if the policy asks for it; a failed audit rolls everything back.
    pub fn commit(mut self) -> HierarchyResult<()> {
        self.release();
        if self.store.depth == 0 && self.store.policy.audit_on_commit {
            self.store.audit()?;
        }
        self.snapshot = None;
        debug!(transaction = self.label, "Committed transaction");
        Ok(())
    }
}

impl Drop for RepairTransaction<'_> {
    fn drop(&mut self) {
        self.release();
        if let Some(snapshot) = self.snapshot.take() {
            warn!(transaction = self.label, "Rolling back transaction");
            self.store.state = snapshot;
        }
    }
}

impl Deref for RepairTransaction<'_> {
    type Target = HierarchyStore;

    fn deref(&self) -> &HierarchyStore {
        &*self.store
    }
}

impl DerefMut for RepairTransaction<'_> {
    fn deref_mut(&mut self) -> &mut HierarchyStore {
        &mut *self.store
    }
}

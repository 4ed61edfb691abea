//! Membership ledger
//!
//! This module provides the many-to-many links between external entities
//! (users and projects) and org nodes. Each `(org, entity)` pair appears at
//! most once, and each entity has at most one primary link. Promotion always
//! demotes the previous primary first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;
use uuid::Uuid;

use crate::error::{HierarchyError, HierarchyResult};
use crate::organization::OrgId;
use crate::store::HierarchyStore;

/// External entity identifier (user or project).
pub type EntityId = Uuid;

/// Kind of external entity a membership link belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A user account
    User,

    /// A project
    Project,
}

impl EntityKind {
    /// Both entity kinds.
    pub const ALL: [EntityKind; 2] = [EntityKind::User, EntityKind::Project];

    /// Get string representation of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Project => "project",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Link between an entity and an org.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MembershipLink {
    /// Unique link ID
    pub id: Uuid,

    /// Kind of the linked entity
    pub kind: EntityKind,

    /// Org ID
    pub org: OrgId,

    /// Entity ID
    pub entity: EntityId,

    /// Whether this is the entity's main affiliation
    pub is_primary: bool,

    /// When the link was created
    pub created_at: DateTime<Utc>,

    /// When the link was last updated
    pub updated_at: DateTime<Utc>,
}

impl MembershipLink {
    /// Creates a new link.
    pub fn new(kind: EntityKind, entity: EntityId, org: OrgId, is_primary: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            kind,
            org,
            entity,
            is_primary,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Reference to an org, by id or by fullcode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrgRef {
    /// Direct id
    Id(OrgId),

    /// Hyphen-joined fullcode, e.g. `UMD-CMNS-PHYS`
    Fullcode(String),
}

impl From<OrgId> for OrgRef {
    fn from(id: OrgId) -> Self {
        OrgRef::Id(id)
    }
}

impl From<&str> for OrgRef {
    fn from(code: &str) -> Self {
        OrgRef::Fullcode(code.to_string())
    }
}

impl From<String> for OrgRef {
    fn from(code: String) -> Self {
        OrgRef::Fullcode(code)
    }
}

/// One desired membership in a `set_memberships` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipRequest {
    /// Target org
    pub org: OrgRef,

    /// Explicit primary flag; `None` leaves an existing link's flag alone
    /// and creates new links as non-primary
    pub is_primary: Option<bool>,
}

impl MembershipRequest {
    /// Request a membership without an explicit primary flag.
    pub fn new(org: impl Into<OrgRef>) -> Self {
        Self {
            org: org.into(),
            is_primary: None,
        }
    }

    /// Request a membership with an explicit primary flag.
    pub fn with_primary(mut self, is_primary: bool) -> Self {
        self.is_primary = Some(is_primary);
        self
    }
}

/// Options for `set_memberships`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetMembershipOptions {
    /// Remove existing links whose org is not in the desired list
    pub delete: bool,

    /// The first distinct org without an explicit flag becomes primary
    pub default_first_primary: bool,

    /// Also link every ancestor of the requested orgs
    pub add_parents: bool,
}

/// What a membership operation changed.
///
/// An empty report means the call was a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipChanges {
    /// Orgs newly linked
    pub added: Vec<OrgId>,

    /// Orgs unlinked
    pub removed: Vec<OrgId>,

    /// Org whose link became primary (the last one, if several)
    pub primary_set: Option<OrgId>,

    /// Orgs whose links lost the primary flag
    pub primary_cleared: Vec<OrgId>,
}

impl MembershipChanges {
    /// Check if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.primary_set.is_none()
            && self.primary_cleared.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
struct LinkTable {
    links: BTreeMap<(EntityId, OrgId), MembershipLink>,
}

/// All membership links, one table per entity kind.
#[derive(Debug, Clone, Default)]
pub struct MembershipLedger {
    users: LinkTable,
    projects: LinkTable,
}

impl MembershipLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, kind: EntityKind) -> &LinkTable {
        match kind {
            EntityKind::User => &self.users,
            EntityKind::Project => &self.projects,
        }
    }

    fn table_mut(&mut self, kind: EntityKind) -> &mut LinkTable {
        match kind {
            EntityKind::User => &mut self.users,
            EntityKind::Project => &mut self.projects,
        }
    }

    /// Iterate over every link of `kind`.
    pub fn iter(&self, kind: EntityKind) -> impl Iterator<Item = &MembershipLink> {
        self.table(kind).links.values()
    }

    /// Total number of links of `kind`.
    pub fn len(&self, kind: EntityKind) -> usize {
        self.table(kind).links.len()
    }

    /// Get the link between `entity` and `org`.
    pub fn get(&self, kind: EntityKind, entity: EntityId, org: OrgId) -> Option<&MembershipLink> {
        self.table(kind).links.get(&(entity, org))
    }

    /// All links for an entity.
    pub fn for_entity(&self, kind: EntityKind, entity: EntityId) -> Vec<&MembershipLink> {
        self.table(kind)
            .links
            .range((entity, Uuid::nil())..=(entity, Uuid::max()))
            .map(|(_, link)| link)
            .collect()
    }

    /// All links pointing at an org.
    pub fn for_org(&self, kind: EntityKind, org: OrgId) -> Vec<&MembershipLink> {
        self.iter(kind).filter(|l| l.org == org).collect()
    }

    /// Check if any link of either kind points at `org`.
    pub fn references_org(&self, org: OrgId) -> bool {
        EntityKind::ALL
            .iter()
            .any(|kind| self.iter(*kind).any(|l| l.org == org))
    }

    /// The entity's primary link, if any.
    pub fn primary(&self, kind: EntityKind, entity: EntityId) -> Option<&MembershipLink> {
        self.for_entity(kind, entity).into_iter().find(|l| l.is_primary)
    }

    /// Add a link with inline checks.
    ///
    /// Fails with `UniquenessConflict` if the pair is already linked and with
    /// `PrimaryConflict` if a primary link is requested while another exists.
    pub fn insert(
        &mut self,
        kind: EntityKind,
        entity: EntityId,
        org: OrgId,
        is_primary: bool,
    ) -> HierarchyResult<()> {
        if self.get(kind, entity, org).is_some() {
            return Err(HierarchyError::UniquenessConflict {
                field: "membership",
                value: format!("{} {} in org {}", kind, entity, org),
                scope: format!("{} memberships", kind),
            });
        }
        if is_primary {
            self.check_no_primary(kind, entity, org)?;
        }
        self.table_mut(kind)
            .links
            .insert((entity, org), MembershipLink::new(kind, entity, org, is_primary));
        Ok(())
    }

    /// Set the primary flag on an existing link with inline checks.
    pub fn set_flag(
        &mut self,
        kind: EntityKind,
        entity: EntityId,
        org: OrgId,
        is_primary: bool,
    ) -> HierarchyResult<()> {
        if is_primary {
            self.check_no_primary(kind, entity, org)?;
        }
        let link = self
            .table_mut(kind)
            .links
            .get_mut(&(entity, org))
            .ok_or_else(|| HierarchyError::NotFound {
                entity: "membership",
                key: format!("{} {} in org {}", kind, entity, org),
            })?;
        if link.is_primary != is_primary {
            link.is_primary = is_primary;
            link.updated_at = Utc::now();
        }
        Ok(())
    }

    fn check_no_primary(&self, kind: EntityKind, entity: EntityId, org: OrgId) -> HierarchyResult<()> {
        match self.primary(kind, entity) {
            Some(existing) if existing.org != org => Err(HierarchyError::PrimaryConflict {
                entity,
                existing: existing.org,
                requested: org,
            }),
            _ => Ok(()),
        }
    }

    /// Clear the entity's primary flag, returning the org that held it.
    pub fn demote(&mut self, kind: EntityKind, entity: EntityId) -> Option<OrgId> {
        let org = self.primary(kind, entity)?.org;
        if let Some(link) = self.table_mut(kind).links.get_mut(&(entity, org)) {
            link.is_primary = false;
            link.updated_at = Utc::now();
        }
        Some(org)
    }

    /// Make `org` the entity's primary, creating the link if absent.
    ///
    /// The previous primary is demoted first.
    pub fn promote(
        &mut self,
        kind: EntityKind,
        entity: EntityId,
        org: OrgId,
        changes: &mut MembershipChanges,
    ) -> HierarchyResult<()> {
        if self.get(kind, entity, org).map(|l| l.is_primary).unwrap_or(false) {
            return Ok(());
        }
        if let Some(previous) = self.demote(kind, entity) {
            changes.primary_cleared.push(previous);
        }
        if self.get(kind, entity, org).is_some() {
            self.set_flag(kind, entity, org, true)?;
        } else {
            self.insert(kind, entity, org, true)?;
            changes.added.push(org);
        }
        changes.primary_set = Some(org);
        Ok(())
    }

    /// Remove a link, returning it if it existed.
    pub fn remove(&mut self, kind: EntityKind, entity: EntityId, org: OrgId) -> Option<MembershipLink> {
        self.table_mut(kind).links.remove(&(entity, org))
    }

    /// Reconcile an entity's links with a desired list of orgs.
    ///
    /// Duplicate orgs collapse to one entry: the last explicit flag wins, and
    /// with `default_first_primary` the first distinct org without any
    /// explicit flag becomes primary. Orgs are processed in order of first
    /// appearance. With `delete`, links to orgs not in the list are removed
    /// afterwards.
    pub fn apply(
        &mut self,
        kind: EntityKind,
        entity: EntityId,
        desired: &[(OrgId, Option<bool>)],
        delete: bool,
        default_first_primary: bool,
    ) -> HierarchyResult<MembershipChanges> {
        let mut order: Vec<OrgId> = Vec::new();
        let mut flags: HashMap<OrgId, Option<bool>> = HashMap::new();
        for (org, flag) in desired {
            let entry = flags.entry(*org).or_insert_with(|| {
                order.push(*org);
                None
            });
            if flag.is_some() {
                *entry = *flag;
            }
        }
        if default_first_primary {
            if let Some(first) = order.first() {
                let flag = flags.entry(*first).or_insert(None);
                if flag.is_none() {
                    *flag = Some(true);
                }
            }
        }

        let mut changes = MembershipChanges::default();
        for org in &order {
            let flag = flags.get(org).copied().flatten();
            let existing = self.get(kind, entity, *org).map(|l| l.is_primary);
            match (existing, flag) {
                (Some(false), Some(true)) | (None, Some(true)) => {
                    self.promote(kind, entity, *org, &mut changes)?;
                }
                (Some(true), Some(false)) => {
                    self.set_flag(kind, entity, *org, false)?;
                    changes.primary_cleared.push(*org);
                    if changes.primary_set == Some(*org) {
                        changes.primary_set = None;
                    }
                }
                (None, _) => {
                    self.insert(kind, entity, *org, false)?;
                    changes.added.push(*org);
                }
                _ => {}
            }
        }

        if delete {
            let keep: HashSet<OrgId> = order.iter().copied().collect();
            let stale: Vec<OrgId> = self
                .for_entity(kind, entity)
                .iter()
                .map(|l| l.org)
                .filter(|org| !keep.contains(org))
                .collect();
            for org in stale {
                self.remove(kind, entity, org);
                changes.removed.push(org);
            }
        }

        debug!(
            kind = %kind,
            entity = %entity,
            added = changes.added.len(),
            removed = changes.removed.len(),
            primary = ?changes.primary_set,
            "Applied memberships"
        );
        Ok(changes)
    }

    /// Remove exactly the named links; missing links are ignored.
    pub fn delete(&mut self, kind: EntityKind, entity: EntityId, orgs: &[OrgId]) -> MembershipChanges {
        let mut changes = MembershipChanges::default();
        for org in orgs {
            if self.remove(kind, entity, *org).is_some() {
                changes.removed.push(*org);
            }
        }
        changes
    }

    /// Move every link on `from` to `to` (or drop them when `to` is `None`).
    ///
    /// When the entity already has a link on `to`, the moved link is dropped;
    /// if the moved link was primary, the existing link takes over the flag.
    pub(crate) fn relocate_org(&mut self, from: OrgId, to: Option<OrgId>) -> usize {
        let mut moved = 0;
        for kind in EntityKind::ALL {
            let links: Vec<MembershipLink> = self.for_org(kind, from).into_iter().cloned().collect();
            for link in links {
                self.remove(kind, link.entity, from);
                let Some(target) = to else {
                    continue;
                };
                let table = self.table_mut(kind);
                match table.links.get_mut(&(link.entity, target)) {
                    Some(existing) => {
                        if link.is_primary && !existing.is_primary {
                            existing.is_primary = true;
                            existing.updated_at = Utc::now();
                        }
                    }
                    None => {
                        let mut relocated = MembershipLink::new(kind, link.entity, target, link.is_primary);
                        relocated.created_at = link.created_at;
                        table.links.insert((link.entity, target), relocated);
                    }
                }
                moved += 1;
            }
        }
        moved
    }

    /// Drop every link pointing at `org`, returning how many were removed.
    pub(crate) fn remove_org(&mut self, org: OrgId) -> usize {
        self.relocate_org(org, None)
    }

    /// Insert a record without any checks (used to build corrupted fixtures).
    #[cfg(test)]
    pub(crate) fn insert_unchecked(&mut self, link: MembershipLink) {
        self.table_mut(link.kind)
            .links
            .insert((link.entity, link.org), link);
    }
}

impl HierarchyStore {
    /// Resolve an [`OrgRef`] to an org id.
    pub fn resolve_org_ref(&self, org: &OrgRef) -> HierarchyResult<OrgId> {
        match org {
            OrgRef::Id(id) => self.orgs().require(*id).map(|o| o.id),
            OrgRef::Fullcode(code) => self
                .orgs()
                .by_fullcode(code)
                .map(|o| o.id)
                .ok_or_else(|| HierarchyError::org_not_found(code)),
        }
    }

    /// Reconcile an entity's memberships with `desired`.
    ///
    /// Runs as a single transaction: if any org reference fails to resolve,
    /// nothing changes.
    pub fn set_memberships(
        &mut self,
        kind: EntityKind,
        entity: EntityId,
        desired: &[MembershipRequest],
        options: SetMembershipOptions,
    ) -> HierarchyResult<MembershipChanges> {
        self.transaction("set_memberships", |tx| {
            let mut resolved = Vec::with_capacity(desired.len());
            for request in desired {
                resolved.push((tx.resolve_org_ref(&request.org)?, request.is_primary));
            }
            if options.add_parents {
                let requested: Vec<OrgId> = resolved.iter().map(|(org, _)| *org).collect();
                for org in tx.orgs().with_ancestors(&requested) {
                    resolved.push((org, None));
                }
            }
            tx.state_mut().memberships.apply(
                kind,
                entity,
                &resolved,
                options.delete,
                options.default_first_primary,
            )
        })
    }

    /// Remove the named links for an entity.
    pub fn delete_memberships(
        &mut self,
        kind: EntityKind,
        entity: EntityId,
        orgs: &[OrgRef],
    ) -> HierarchyResult<MembershipChanges> {
        let mut ids = Vec::with_capacity(orgs.len());
        for org in orgs {
            ids.push(self.resolve_org_ref(org)?);
        }
        let changes = self.state_mut().memberships.delete(kind, entity, &ids);
        debug!(kind = %kind, entity = %entity, removed = changes.removed.len(), "Deleted memberships");
        Ok(changes)
    }

    /// The entity's primary link, if any.
    pub fn primary(&self, kind: EntityKind, entity: EntityId) -> Option<&MembershipLink> {
        self.memberships().primary(kind, entity)
    }

    /// Replace the entity's primary link, creating it if absent.
    pub fn set_primary(
        &mut self,
        kind: EntityKind,
        entity: EntityId,
        org: impl Into<OrgRef>,
    ) -> HierarchyResult<MembershipChanges> {
        let org = self.resolve_org_ref(&org.into())?;
        self.transaction("set_primary", |tx| {
            let mut changes = MembershipChanges::default();
            tx.state_mut()
                .memberships
                .promote(kind, entity, org, &mut changes)?;
            Ok(changes)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<OrgId> {
        (0..n).map(|_| Uuid::now_v7()).collect()
    }

    fn primaries(ledger: &MembershipLedger, entity: EntityId) -> Vec<OrgId> {
        ledger
            .for_entity(EntityKind::User, entity)
            .into_iter()
            .filter(|l| l.is_primary)
            .map(|l| l.org)
            .collect()
    }

    #[test]
    fn test_apply_creates_links() {
        let mut ledger = MembershipLedger::new();
        let orgs = ids(2);
        let user = Uuid::now_v7();
        let changes = ledger
            .apply(EntityKind::User, user, &[(orgs[0], None), (orgs[1], None)], false, false)
            .unwrap();
        assert_eq!(changes.added, orgs);
        assert!(ledger.primary(EntityKind::User, user).is_none());
        assert_eq!(ledger.len(EntityKind::User), 2);
        assert_eq!(ledger.len(EntityKind::Project), 0);
    }

    #[test]
    fn test_apply_collapses_duplicates_last_flag_wins() {
        let mut ledger = MembershipLedger::new();
        let orgs = ids(2);
        let user = Uuid::now_v7();
        let desired = [
            (orgs[0], Some(true)),
            (orgs[1], None),
            (orgs[0], Some(false)),
            (orgs[1], Some(true)),
            (orgs[1], None),
        ];
        let changes = ledger.apply(EntityKind::User, user, &desired, false, false).unwrap();
        assert_eq!(changes.added, orgs);
        assert_eq!(primaries(&ledger, user), vec![orgs[1]]);
    }

    #[test]
    fn test_default_first_primary() {
        let mut ledger = MembershipLedger::new();
        let orgs = ids(3);
        let user = Uuid::now_v7();
        let desired = [(orgs[0], None), (orgs[1], None), (orgs[0], None), (orgs[2], None)];
        ledger.apply(EntityKind::User, user, &desired, false, true).unwrap();
        assert_eq!(primaries(&ledger, user), vec![orgs[0]]);

        // Explicit false on the first org suppresses the default
        let other = Uuid::now_v7();
        let desired = [(orgs[0], Some(false)), (orgs[1], None)];
        ledger.apply(EntityKind::User, other, &desired, false, true).unwrap();
        assert!(primaries(&ledger, other).is_empty());
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut ledger = MembershipLedger::new();
        let orgs = ids(2);
        let user = Uuid::now_v7();
        let desired = [(orgs[0], Some(true)), (orgs[1], None)];
        let first = ledger.apply(EntityKind::User, user, &desired, true, false).unwrap();
        assert!(!first.is_empty());
        let second = ledger.apply(EntityKind::User, user, &desired, true, false).unwrap();
        assert!(second.is_empty(), "second apply changed {:?}", second);
    }

    #[test]
    fn test_promotion_demotes_previous_primary() {
        let mut ledger = MembershipLedger::new();
        let orgs = ids(2);
        let user = Uuid::now_v7();
        ledger.apply(EntityKind::User, user, &[(orgs[0], Some(true))], false, false).unwrap();
        let changes = ledger
            .apply(EntityKind::User, user, &[(orgs[1], Some(true))], false, false)
            .unwrap();
        assert_eq!(changes.primary_set, Some(orgs[1]));
        assert_eq!(changes.primary_cleared, vec![orgs[0]]);
        assert_eq!(primaries(&ledger, user), vec![orgs[1]]);
        assert_eq!(ledger.for_entity(EntityKind::User, user).len(), 2);
    }

    #[test]
    fn test_apply_with_delete_removes_stale_links() {
        let mut ledger = MembershipLedger::new();
        let orgs = ids(3);
        let user = Uuid::now_v7();
        ledger
            .apply(EntityKind::User, user, &[(orgs[0], None), (orgs[1], None)], false, false)
            .unwrap();
        let changes = ledger
            .apply(EntityKind::User, user, &[(orgs[1], None), (orgs[2], None)], true, false)
            .unwrap();
        assert_eq!(changes.added, vec![orgs[2]]);
        assert_eq!(changes.removed, vec![orgs[0]]);
    }

    #[test]
    fn test_direct_insert_rejects_second_primary() {
        let mut ledger = MembershipLedger::new();
        let orgs = ids(2);
        let user = Uuid::now_v7();
        ledger.insert(EntityKind::User, user, orgs[0], true).unwrap();
        let err = ledger.insert(EntityKind::User, user, orgs[1], true).unwrap_err();
        assert!(matches!(err, HierarchyError::PrimaryConflict { existing, .. } if existing == orgs[0]));
        let err = ledger.insert(EntityKind::User, user, orgs[0], false).unwrap_err();
        assert!(matches!(err, HierarchyError::UniquenessConflict { .. }));
        ledger.insert(EntityKind::User, user, orgs[1], false).unwrap();
        let err = ledger.set_flag(EntityKind::User, user, orgs[1], true).unwrap_err();
        assert!(matches!(err, HierarchyError::PrimaryConflict { .. }));
    }

    #[test]
    fn test_delete_ignores_missing_links() {
        let mut ledger = MembershipLedger::new();
        let orgs = ids(2);
        let project = Uuid::now_v7();
        ledger.insert(EntityKind::Project, project, orgs[0], false).unwrap();
        let changes = ledger.delete(EntityKind::Project, project, &orgs);
        assert_eq!(changes.removed, vec![orgs[0]]);
        assert!(ledger.delete(EntityKind::Project, project, &orgs).is_empty());
    }

    #[test]
    fn test_relocate_merges_links() {
        let mut ledger = MembershipLedger::new();
        let orgs = ids(2);
        let (child, parent) = (orgs[0], orgs[1]);
        let alice = Uuid::now_v7();
        let bob = Uuid::now_v7();
        let carol = Uuid::now_v7();
        // alice: primary on child, plain on parent -> parent becomes primary
        ledger.insert(EntityKind::User, alice, child, true).unwrap();
        ledger.insert(EntityKind::User, alice, parent, false).unwrap();
        // bob: plain on child, primary on parent -> parent stays primary
        ledger.insert(EntityKind::User, bob, child, false).unwrap();
        ledger.insert(EntityKind::User, bob, parent, true).unwrap();
        // carol: only on child -> moved as-is
        ledger.insert(EntityKind::User, carol, child, false).unwrap();

        assert_eq!(ledger.relocate_org(child, Some(parent)), 3);
        assert!(ledger.for_org(EntityKind::User, child).is_empty());
        assert_eq!(primaries(&ledger, alice), vec![parent]);
        assert_eq!(primaries(&ledger, bob), vec![parent]);
        assert!(primaries(&ledger, carol).is_empty());
        assert_eq!(ledger.for_entity(EntityKind::User, alice).len(), 1);
        assert!(ledger.get(EntityKind::User, carol, parent).is_some());
    }
}

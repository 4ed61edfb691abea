//! Organization tree
//!
//! This module provides the `Org` node and the `OrgTree` that stores every
//! node regardless of tier. Each node is bound to one level; parent links
//! mirror the level chain. Codes, short names and long names are unique
//! within each parent scope, and the set of root nodes is its own scope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use uuid::Uuid;

use crate::error::{HierarchyError, HierarchyResult};
use crate::level::{LevelId, LevelRegistry};
use crate::membership::EntityKind;

/// Org identifier.
pub type OrgId = Uuid;

/// Separator between codes in a fullcode.
pub const FULLCODE_SEPARATOR: char = '-';

/// An organization node placed at one tier of the hierarchy.
///
/// # Examples
///
/// ```
/// use orghier_core::{Level, Org};
///
/// let university = Level::new("University", 40, None, true);
/// let org = Org::new("UMD", university.id, None, "UMCP", "University of Maryland");
/// assert_eq!(org.code, "UMD");
/// assert!(org.is_root());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Org {
    /// Unique identifier for the org
    pub id: OrgId,

    /// Short code, unique among siblings; may not contain '-'
    pub code: String,

    /// Medium-length display name
    pub shortname: String,

    /// Full official name
    pub longname: String,

    /// Tier this org sits on
    pub level: LevelId,

    /// Parent org (None only at the root tier)
    pub parent: Option<OrgId>,

    /// Whether users may be associated with this org
    pub selectable_for_user: bool,

    /// Whether projects may be associated with this org
    pub selectable_for_project: bool,

    /// When the org was created
    pub created_at: DateTime<Utc>,

    /// When the org was last updated
    pub updated_at: DateTime<Utc>,
}

impl Org {
    /// Creates a new org, selectable for both users and projects.
    pub fn new(
        code: impl Into<String>,
        level: LevelId,
        parent: Option<OrgId>,
        shortname: impl Into<String>,
        longname: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            code: code.into(),
            shortname: shortname.into(),
            longname: longname.into(),
            level,
            parent,
            selectable_for_user: true,
            selectable_for_project: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set selectability for users and projects.
    pub fn with_selectable(mut self, for_user: bool, for_project: bool) -> Self {
        self.selectable_for_user = for_user;
        self.selectable_for_project = for_project;
        self
    }

    /// Check if this org has no parent.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Check if the org may be associated with an entity of `kind`.
    pub fn is_selectable_for(&self, kind: EntityKind) -> bool {
        match kind {
            EntityKind::User => self.selectable_for_user,
            EntityKind::Project => self.selectable_for_project,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Validate an org code: non-empty and free of the fullcode separator.
pub fn validate_code(code: &str) -> HierarchyResult<()> {
    if code.trim().is_empty() {
        return Err(HierarchyError::InvalidCode {
            code: code.to_string(),
            reason: "code may not be empty".to_string(),
        });
    }
    if code.contains(FULLCODE_SEPARATOR) {
        return Err(HierarchyError::InvalidCode {
            code: code.to_string(),
            reason: format!("code may not contain '{}'", FULLCODE_SEPARATOR),
        });
    }
    Ok(())
}

/// Name field of an org that carries a per-scope uniqueness constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameField {
    /// The `code` field
    Code,
    /// The `shortname` field
    Shortname,
    /// The `longname` field
    Longname,
}

impl NameField {
    /// All constrained fields.
    pub const ALL: [NameField; 3] = [NameField::Code, NameField::Shortname, NameField::Longname];

    /// Field name for error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            NameField::Code => "code",
            NameField::Shortname => "shortname",
            NameField::Longname => "longname",
        }
    }

    /// Read this field from an org.
    pub fn value<'a>(&self, org: &'a Org) -> &'a str {
        match self {
            NameField::Code => &org.code,
            NameField::Shortname => &org.shortname,
            NameField::Longname => &org.longname,
        }
    }
}

/// Names resolved by [`OrgTree::unique_names`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueNames {
    /// Resolved code
    pub code: String,
    /// Resolved short name
    pub shortname: String,
    /// Resolved long name
    pub longname: String,
}

/// Store of all org nodes, indexed by parent scope.
#[derive(Debug, Clone, Default)]
pub struct OrgTree {
    orgs: HashMap<OrgId, Org>,
    children: HashMap<Option<OrgId>, BTreeSet<OrgId>>,
}

impl OrgTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of orgs.
    pub fn len(&self) -> usize {
        self.orgs.len()
    }

    /// Check if the tree has no orgs.
    pub fn is_empty(&self) -> bool {
        self.orgs.is_empty()
    }

    /// Get an org by id.
    pub fn get(&self, id: OrgId) -> Option<&Org> {
        self.orgs.get(&id)
    }

    /// Get an org by id, failing with `NotFound`.
    pub fn require(&self, id: OrgId) -> HierarchyResult<&Org> {
        self.get(id).ok_or_else(|| HierarchyError::org_not_found(id))
    }

    /// Iterate over all orgs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Org> {
        self.orgs.values()
    }

    /// Orgs directly under `parent` (`None` for the root scope), oldest first.
    pub fn children(&self, parent: Option<OrgId>) -> Vec<&Org> {
        self.children
            .get(&parent)
            .map(|ids| ids.iter().filter_map(|id| self.orgs.get(id)).collect())
            .unwrap_or_default()
    }

    /// Check if `id` has child orgs.
    pub fn has_children(&self, id: OrgId) -> bool {
        self.children
            .get(&Some(id))
            .map(|ids| !ids.is_empty())
            .unwrap_or(false)
    }

    /// Root orgs.
    pub fn roots(&self) -> Vec<&Org> {
        self.children(None)
    }

    /// Orgs placed at `level`, sorted by code.
    pub fn at_level(&self, level: LevelId) -> Vec<&Org> {
        let mut orgs: Vec<&Org> = self.orgs.values().filter(|o| o.level == level).collect();
        orgs.sort_by(|a, b| a.code.cmp(&b.code).then(a.id.cmp(&b.id)));
        orgs
    }

    /// Find the org in `parent`'s scope whose `field` equals `value`.
    pub fn find_in_scope(
        &self,
        parent: Option<OrgId>,
        field: NameField,
        value: &str,
    ) -> Option<&Org> {
        self.children(parent)
            .into_iter()
            .find(|o| field.value(o) == value)
    }

    /// Find the child of `parent` with the given code.
    pub fn find_child(&self, parent: Option<OrgId>, code: &str) -> Option<&Org> {
        self.find_in_scope(parent, NameField::Code, code)
    }

    /// Returns all ancestors of `id`, root first.
    ///
    /// Returns an empty list for a root org or an unknown id.
    pub fn ancestors(&self, id: OrgId) -> Vec<&Org> {
        let mut ancestors = Vec::new();
        let mut current = self.orgs.get(&id).and_then(|o| o.parent);
        while let Some(parent_id) = current {
            // Guard against corrupted cycles
            if ancestors.len() >= self.orgs.len() {
                break;
            }
            let Some(parent) = self.orgs.get(&parent_id) else {
                break;
            };
            ancestors.push(parent);
            current = parent.parent;
        }
        ancestors.reverse();
        ancestors
    }

    /// Returns every descendant of `id` (children, grandchildren, ...).
    ///
    /// Each org appears once; order is breadth-first but callers should not
    /// depend on it.
    pub fn descendants(&self, id: OrgId) -> Vec<&Org> {
        let mut seen: HashSet<OrgId> = HashSet::new();
        let mut out = Vec::new();
        let mut queue: VecDeque<OrgId> = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            for child in self.children(Some(current)) {
                if child.id != id && seen.insert(child.id) {
                    out.push(child);
                    queue.push_back(child.id);
                }
            }
        }
        out
    }

    /// Check if `id` lies below `ancestor`.
    pub fn is_descendant_of(&self, id: OrgId, ancestor: OrgId) -> bool {
        self.ancestors(id).iter().any(|o| o.id == ancestor)
    }

    /// The given orgs followed by every ancestor of each, without duplicates.
    ///
    /// Input order is kept; ancestors not already present are appended
    /// root-first after the org that introduced them. Unknown ids are dropped.
    pub fn with_ancestors(&self, ids: &[OrgId]) -> Vec<OrgId> {
        let mut seen: HashSet<OrgId> = HashSet::new();
        let mut out = Vec::new();
        for id in ids {
            if self.orgs.contains_key(id) && seen.insert(*id) {
                out.push(*id);
            }
        }
        for id in ids {
            for ancestor in self.ancestors(*id) {
                if seen.insert(ancestor.id) {
                    out.push(ancestor.id);
                }
            }
        }
        out
    }

    /// Full code: ancestor codes and our own, root first, joined by '-'.
    ///
    /// # Examples
    ///
    /// ```
    /// use orghier_core::{HierarchyStore, OrgSpec};
    ///
    /// let mut store = HierarchyStore::new();
    /// let univ = store.create_level("University", 40, None, true).unwrap();
    /// let coll = store.create_level("College", 30, Some(univ), true).unwrap();
    /// let umd = store.insert_node(OrgSpec::new("UMD", univ)).unwrap().id;
    /// let cmns = store.insert_node(OrgSpec::new("CMNS", coll).with_parent(umd)).unwrap().id;
    /// assert_eq!(store.orgs().fullcode(cmns).as_deref(), Some("UMD-CMNS"));
    /// ```
    pub fn fullcode(&self, id: OrgId) -> Option<String> {
        let org = self.orgs.get(&id)?;
        let mut parts: Vec<&str> = self.ancestors(id).iter().map(|o| o.code.as_str()).collect();
        parts.push(&org.code);
        Some(parts.join("-"))
    }

    /// Parent's fullcode, '-', then our short name.
    pub fn semifullcode(&self, id: OrgId) -> Option<String> {
        let org = self.orgs.get(&id)?;
        match org.parent.and_then(|p| self.fullcode(p)) {
            Some(parent_code) => Some(format!("{}-{}", parent_code, org.shortname)),
            None => Some(org.shortname.clone()),
        }
    }

    /// Find an org by its fullcode.
    pub fn by_fullcode(&self, fullcode: &str) -> Option<&Org> {
        let mut parent = None;
        let mut found = None;
        for code in fullcode.split(FULLCODE_SEPARATOR) {
            let org = self.find_child(parent, code)?;
            parent = Some(org.id);
            found = Some(org);
        }
        found
    }

    /// Find an org by its semifullcode.
    ///
    /// Short names may themselves contain '-', so every org whose short name
    /// is a suffix of the input is checked.
    pub fn by_semifullcode(&self, semifullcode: &str) -> Option<&Org> {
        let mut candidates: Vec<&Org> = self
            .orgs
            .values()
            .filter(|o| semifullcode.ends_with(o.shortname.as_str()))
            .filter(|o| self.semifullcode(o.id).as_deref() == Some(semifullcode))
            .collect();
        candidates.sort_by_key(|o| o.id);
        candidates.into_iter().next()
    }

    /// Walk `id` and then its ancestors nearest-first, returning the first
    /// org whose level is flagged for export.
    pub fn next_exported_ancestor(&self, id: OrgId, levels: &LevelRegistry) -> Option<&Org> {
        let org = self.orgs.get(&id)?;
        std::iter::once(org)
            .chain(self.ancestors(id).into_iter().rev())
            .find(|o| levels.get(o.level).map(|l| l.export_flag).unwrap_or(false))
    }

    /// Make `code`, `shortname` and `longname` unique within `parent`'s scope.
    ///
    /// Each value is tried as given, then with suffixes 1, 2, 3, ... until no
    /// existing child of `parent` uses it. The three fields are resolved
    /// independently.
    pub fn unique_names(
        &self,
        code: &str,
        shortname: &str,
        longname: &str,
        parent: Option<OrgId>,
    ) -> UniqueNames {
        let siblings = self.children(parent);
        let resolve = |field: NameField, base: &str| -> String {
            let taken: HashSet<&str> = siblings.iter().map(|o| field.value(o)).collect();
            if !taken.contains(base) {
                return base.to_string();
            }
            (1u32..)
                .map(|n| format!("{}{}", base, n))
                .find(|candidate| !taken.contains(candidate.as_str()))
                .unwrap_or_else(|| base.to_string())
        };
        UniqueNames {
            code: resolve(NameField::Code, code),
            shortname: resolve(NameField::Shortname, shortname),
            longname: resolve(NameField::Longname, longname),
        }
    }

    /// Ensure `org`'s names are free within `parent`'s scope, ignoring `org` itself.
    pub fn check_unique(&self, org: &Org, parent: Option<OrgId>) -> HierarchyResult<()> {
        for field in NameField::ALL {
            let value = field.value(org);
            if let Some(existing) = self.find_in_scope(parent, field, value) {
                if existing.id != org.id {
                    return Err(HierarchyError::UniquenessConflict {
                        field: field.as_str(),
                        value: value.to_string(),
                        scope: self.scope_name(parent),
                    });
                }
            }
        }
        Ok(())
    }

    pub(crate) fn scope_name(&self, parent: Option<OrgId>) -> String {
        match parent.and_then(|p| self.fullcode(p)) {
            Some(code) => format!("children of '{}'", code),
            None => "root orgs".to_string(),
        }
    }

    /// Add a new org, enforcing per-scope uniqueness.
    pub(crate) fn insert(&mut self, org: Org) -> HierarchyResult<OrgId> {
        if let Some(parent) = org.parent {
            self.require(parent)?;
        }
        self.check_unique(&org, org.parent)?;
        let id = org.id;
        self.children.entry(org.parent).or_default().insert(id);
        self.orgs.insert(id, org);
        Ok(id)
    }

    /// Replace the stored record for an existing org, enforcing uniqueness.
    ///
    /// The parent link is kept as stored; moves go through [`OrgTree::reparent`].
    pub(crate) fn replace(&mut self, mut org: Org) -> HierarchyResult<()> {
        org.parent = self.require(org.id)?.parent;
        self.check_unique(&org, org.parent)?;
        org.touch();
        self.orgs.insert(org.id, org);
        Ok(())
    }

    /// Move `id` under `parent`, enforcing uniqueness in the new scope.
    pub(crate) fn reparent(&mut self, id: OrgId, parent: Option<OrgId>) -> HierarchyResult<()> {
        let org = self.require(id)?.clone();
        if org.parent == parent {
            return Ok(());
        }
        if let Some(p) = parent {
            self.require(p)?;
            if p == id || self.is_descendant_of(p, id) {
                return Err(HierarchyError::StructuralMismatch {
                    org: org.code.clone(),
                    reason: "cannot move an org below itself".to_string(),
                });
            }
        }
        self.check_unique(&org, parent)?;
        if let Some(siblings) = self.children.get_mut(&org.parent) {
            siblings.remove(&id);
        }
        self.children.entry(parent).or_default().insert(id);
        if let Some(stored) = self.orgs.get_mut(&id) {
            stored.parent = parent;
            stored.touch();
        }
        Ok(())
    }

    /// Remove an org record. Children are left pointing at the removed id.
    pub(crate) fn remove_unchecked(&mut self, id: OrgId) -> Option<Org> {
        let org = self.orgs.remove(&id)?;
        if let Some(siblings) = self.children.get_mut(&org.parent) {
            siblings.remove(&id);
        }
        if self.children.get(&Some(id)).map(|c| c.is_empty()).unwrap_or(false) {
            self.children.remove(&Some(id));
        }
        Some(org)
    }

    /// Insert a record without any checks (used to build corrupted fixtures).
    #[cfg(test)]
    pub(crate) fn insert_unchecked(&mut self, org: Org) {
        self.children.entry(org.parent).or_default().insert(org.id);
        self.orgs.insert(org.id, org);
    }
}

//! Directory-string mapping
//!
//! Maps opaque strings reported by an external directory service to org
//! nodes. Strings nobody has mapped yet can be materialized as placeholder
//! orgs below a per-store "Unknown" container so that administrators can
//! merge them later. The container starts out as a root org; after a new
//! top tier is inserted it sits below that tier's placeholder and keeps
//! collecting placeholders there.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{HierarchyError, HierarchyResult};
use crate::membership::{EntityId, EntityKind, MembershipChanges, OrgRef};
use crate::organization::{Org, OrgId};
use crate::store::HierarchyStore;

/// Code of the root org that collects placeholders.
pub const UNKNOWN_CODE: &str = "Unknown";

const UNKNOWN_LONGNAME: &str = "Container for Unknown organizations";

/// Mapping from one directory string to an org.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Unique entry ID
    pub id: Uuid,

    /// String as reported by the directory service
    pub directory_string: String,

    /// Org the string maps to
    pub org: OrgId,

    /// When the entry was created
    pub created_at: DateTime<Utc>,

    /// When the entry was last updated
    pub updated_at: DateTime<Utc>,
}

impl DirectoryEntry {
    /// Creates a new entry.
    pub fn new(directory_string: impl Into<String>, org: OrgId) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            directory_string: directory_string.into(),
            org,
            created_at: now,
            updated_at: now,
        }
    }
}

/// All directory entries, keyed by directory string.
#[derive(Debug, Clone, Default)]
pub struct DirectoryMap {
    entries: BTreeMap<String, DirectoryEntry>,
}

impl DirectoryMap {
    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up the entry for a string.
    pub fn get(&self, directory_string: &str) -> Option<&DirectoryEntry> {
        self.entries.get(directory_string)
    }

    /// Iterate over entries in string order.
    pub fn iter(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.entries.values()
    }

    /// Entries mapping to `org`.
    pub fn for_org(&self, org: OrgId) -> Vec<&DirectoryEntry> {
        self.entries.values().filter(|e| e.org == org).collect()
    }

    /// Insert or retarget an entry. Returns true if it was created.
    pub(crate) fn upsert(&mut self, directory_string: &str, org: OrgId) -> bool {
        match self.entries.get_mut(directory_string) {
            Some(entry) => {
                if entry.org != org {
                    entry.org = org;
                    entry.updated_at = Utc::now();
                }
                false
            }
            None => {
                self.entries.insert(
                    directory_string.to_string(),
                    DirectoryEntry::new(directory_string, org),
                );
                true
            }
        }
    }

    pub(crate) fn remove(&mut self, directory_string: &str) -> Option<DirectoryEntry> {
        self.entries.remove(directory_string)
    }

    /// Drop every entry mapping to `org`, returning how many were removed.
    pub(crate) fn remove_for_org(&mut self, org: OrgId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.org != org);
        before - self.entries.len()
    }
}

/// Options for [`HierarchyStore::sync_memberships`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Remove memberships whose org is not among the resolved strings
    pub delete: bool,

    /// Create placeholder orgs for unmapped strings
    pub create_unknown: bool,

    /// Keep orgs not flagged selectable for the entity kind
    pub include_nonselectable: bool,

    /// The first string names the primary affiliation
    pub first_is_primary: bool,
}

impl HierarchyStore {
    /// Map `directory_string` to an org, retargeting an existing mapping.
    ///
    /// Returns true if a new entry was created.
    pub fn add_directory_entry(
        &mut self,
        directory_string: &str,
        org: impl Into<OrgRef>,
    ) -> HierarchyResult<bool> {
        let org = self.resolve_org_ref(&org.into())?;
        let created = self.state_mut().directory.upsert(directory_string, org);
        debug!(directory_string, org = %org, created, "Stored directory entry");
        Ok(created)
    }

    /// Remove the mapping for `directory_string`, if any.
    pub fn remove_directory_entry(&mut self, directory_string: &str) -> Option<DirectoryEntry> {
        self.state_mut().directory.remove(directory_string)
    }

    /// The "Unknown" container org, if one exists.
    ///
    /// The memoized id is used while it still names an org with the expected
    /// code. Otherwise a root org with that code is preferred, then the
    /// shallowest non-selectable one. A new top tier pushes the container
    /// below the tier's own "Unknown" placeholder, and that nested container
    /// is still found here rather than replaced.
    pub fn find_unknown_root(&self) -> Option<OrgId> {
        let orgs = self.orgs();
        if let Some(id) = self.state().unknown_root {
            if orgs.get(id).is_some_and(|org| org.code == UNKNOWN_CODE) {
                return Some(id);
            }
        }
        if let Some(root) = orgs.find_child(None, UNKNOWN_CODE) {
            return Some(root.id);
        }
        orgs.iter()
            .filter(|o| o.code == UNKNOWN_CODE && !o.selectable_for_user && !o.selectable_for_project)
            .min_by_key(|o| (orgs.ancestors(o.id).len(), orgs.fullcode(o.id)))
            .map(|o| o.id)
    }

    /// Get or create the "Unknown" container org, memoizing it on this store.
    ///
    /// A new container is created on the root level only when
    /// [`find_unknown_root`](Self::find_unknown_root) finds none.
    pub fn unknown_root(&mut self) -> HierarchyResult<OrgId> {
        if let Some(id) = self.find_unknown_root() {
            self.state_mut().unknown_root = Some(id);
            return Ok(id);
        }
        let root_level = self
            .levels()
            .root()
            .map(|l| l.id)
            .ok_or_else(|| HierarchyError::level_not_found("root"))?;
        let names = self
            .orgs()
            .unique_names(UNKNOWN_CODE, UNKNOWN_CODE, UNKNOWN_LONGNAME, None);
        let org = Org::new(names.code, root_level, None, names.shortname, names.longname)
            .with_selectable(false, false);
        let id = self.state_mut().orgs.insert(org)?;
        self.state_mut().unknown_root = Some(id);
        info!(org = %UNKNOWN_CODE, "Created unknown root org");
        Ok(id)
    }

    fn create_placeholder(&mut self, directory_string: &str) -> HierarchyResult<OrgId> {
        let root = self.unknown_root()?;
        let root_level = self.orgs().require(root)?.level;
        let (level, is_leaf) = match self.levels().child(root_level) {
            Some(level) => (level.id, self.levels().child(level.id).is_none()),
            None => {
                return Err(HierarchyError::StructuralMismatch {
                    org: directory_string.to_string(),
                    reason: "no level below the root level for placeholder orgs".to_string(),
                })
            }
        };

        let taken: HashSet<&str> = self
            .orgs()
            .children(Some(root))
            .into_iter()
            .map(|o| o.code.as_str())
            .collect();
        let code = (1u32..)
            .map(|n| format!("{}_{}", UNKNOWN_CODE, n))
            .find(|c| !taken.contains(c.as_str()))
            .unwrap_or_else(|| format!("{}_{}", UNKNOWN_CODE, Uuid::now_v7().simple()));
        let label = format!("{}: {}", UNKNOWN_CODE, directory_string);
        let names = self.orgs().unique_names(&code, &label, &label, Some(root));

        let policy = *self.policy();
        let org = Org::new(names.code, level, Some(root), names.shortname, names.longname)
            .with_selectable(
                is_leaf || !policy.only_leaves_selectable_for_user,
                is_leaf || !policy.only_leaves_selectable_for_project,
            );
        let id = self.state_mut().orgs.insert(org)?;
        self.state_mut().directory.upsert(directory_string, id);
        info!(
            directory_string,
            org = %self.orgs().fullcode(id).unwrap_or_default(),
            "Created placeholder org for unknown directory string"
        );
        Ok(id)
    }

    /// Map strings to orgs without changing anything; unmapped strings are
    /// skipped. The result is deduplicated and keeps first-seen order.
    pub fn lookup_directory_strings<S: AsRef<str>>(&self, strings: &[S]) -> Vec<OrgId> {
        let mut seen = HashSet::new();
        strings
            .iter()
            .filter_map(|s| self.directory().get(s.as_ref()).map(|e| e.org))
            .filter(|org| seen.insert(*org))
            .collect()
    }

    /// Map strings to orgs.
    ///
    /// Unmapped strings are skipped, or with `create_unknown` materialized as
    /// placeholder orgs below the "Unknown" root together with a directory
    /// entry. The result is deduplicated and keeps first-seen order.
    pub fn resolve<S: AsRef<str>>(
        &mut self,
        strings: &[S],
        create_unknown: bool,
    ) -> HierarchyResult<Vec<OrgId>> {
        self.transaction("resolve_directory_strings", |tx| {
            let mut seen = HashSet::new();
            let mut out = Vec::new();
            for s in strings {
                let s = s.as_ref();
                let mapped = tx.directory().get(s).map(|e| e.org);
                let org = match mapped {
                    Some(org) => org,
                    None if create_unknown => tx.create_placeholder(s)?,
                    None => {
                        warn!(directory_string = s, "Skipping unmapped directory string");
                        continue;
                    }
                };
                if seen.insert(org) {
                    out.push(org);
                }
            }
            Ok(out)
        })
    }

    /// Bring an entity's memberships in line with directory strings.
    ///
    /// With `first_is_primary`, the org the first string resolves to becomes
    /// the primary membership, demoting any other. Calling this twice with the
    /// same input changes nothing the second time.
    pub fn sync_memberships<S: AsRef<str>>(
        &mut self,
        kind: EntityKind,
        entity: EntityId,
        strings: &[S],
        options: SyncOptions,
    ) -> HierarchyResult<MembershipChanges> {
        self.transaction("sync_memberships", |tx| {
            let mut desired: Vec<(OrgId, Option<bool>)> = Vec::new();
            let rest = match (options.first_is_primary, strings.split_first()) {
                (true, Some((first, rest))) => {
                    for org in tx.resolve(std::slice::from_ref(first), options.create_unknown)? {
                        desired.push((org, Some(true)));
                    }
                    rest
                }
                _ => strings,
            };
            for org in tx.resolve(rest, options.create_unknown)? {
                desired.push((org, None));
            }
            if !options.include_nonselectable {
                let orgs = tx.orgs();
                desired.retain(|(org, _)| {
                    orgs.get(*org)
                        .map(|o| o.is_selectable_for(kind))
                        .unwrap_or(false)
                });
            }
            tx.state_mut()
                .memberships
                .apply(kind, entity, &desired, options.delete, false)
        })
    }

    /// Report what [`HierarchyStore::sync_memberships`] would change without
    /// changing anything.
    pub fn preview_sync<S: AsRef<str>>(
        &self,
        kind: EntityKind,
        entity: EntityId,
        strings: &[S],
        options: SyncOptions,
    ) -> HierarchyResult<MembershipChanges> {
        let mut scratch = self.clone();
        scratch.sync_memberships(kind, entity, strings, options)
    }
}

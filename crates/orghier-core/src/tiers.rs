//! Tier mutation
//!
//! Inserting or deleting a level rewires the level chain and repairs the org
//! tree so that every org's parent still sits on its level's parent level.
//! Each operation runs as one repair transaction: inline checks are
//! suspended while the tree is temporarily inconsistent, and the commit
//! audit sees only the finished result.
//!
//! ```text
//! insert root         insert middle              delete middle
//! Country   Unknown   University   UMD           University   UMD
//!   │          │        │           │              │           │
//! University UMD      Campus    placeholderCMNS  College     CMNS
//!                       │           │
//!                     College     CMNS
//! ```

use tracing::{debug, info};

use crate::directory::UNKNOWN_CODE;
use crate::error::{HierarchyError, HierarchyResult};
use crate::level::{Level, LevelId};
use crate::organization::{Org, OrgId};
use crate::store::HierarchyStore;

/// Prefix for orgs created on a newly spliced middle level.
pub const PLACEHOLDER_PREFIX: &str = "placeholder";

const UNKNOWN_LONGNAME: &str = "Container for Unknown organizations";

impl HierarchyStore {
    /// Insert a level anywhere in the chain.
    ///
    /// With no `parent` the level becomes the new root and must outrank the
    /// old root; existing root orgs are gathered under one non-selectable
    /// "Unknown" placeholder on the new level. With a `parent` the level is
    /// spliced between it and its current child, and must rank strictly
    /// between them; every org on the child level gets its own placeholder
    /// parent named after it.
    ///
    /// # Examples
    ///
    /// ```
    /// use orghier_core::{HierarchyStore, OrgSpec};
    ///
    /// let mut store = HierarchyStore::new();
    /// let univ = store.create_level("University", 40, None, true).unwrap();
    /// let umd = store.insert_node(OrgSpec::new("UMD", univ)).unwrap().id;
    ///
    /// store.insert_level("Country", 50, None, true).unwrap();
    /// assert_eq!(store.orgs().fullcode(umd).as_deref(), Some("Unknown-UMD"));
    /// ```
    pub fn insert_level(
        &mut self,
        name: impl Into<String>,
        rank: i32,
        parent: Option<LevelId>,
        export_flag: bool,
    ) -> HierarchyResult<LevelId> {
        let name = name.into();
        self.repair("insert_level", |tx| {
            tx.levels().check_name_available(&name, None)?;
            tx.levels().check_rank_available(&name, rank, None)?;
            let id = match parent {
                None => tx.insert_root_level(&name, rank, export_flag)?,
                Some(parent) => tx.splice_level(&name, rank, parent, export_flag)?,
            };
            info!(level = %name, rank, "Inserted level");
            Ok(id)
        })
    }

    fn insert_root_level(&mut self, name: &str, rank: i32, export_flag: bool) -> HierarchyResult<LevelId> {
        let Some(old_root) = self.levels().root().cloned() else {
            return self.create_level(name, rank, None, export_flag);
        };
        if rank <= old_root.rank {
            return Err(HierarchyError::InvalidRank {
                level: name.to_string(),
                rank,
                reason: format!(
                    "a new root must outrank the current root '{}' (rank {})",
                    old_root.name, old_root.rank
                ),
            });
        }

        let level = Level::new(name, rank, None, export_flag);
        let id = level.id;
        let state = self.state_mut();
        state.levels.insert_unchecked(level);
        state.levels.set_parent_unchecked(old_root.id, Some(id));

        let old_roots: Vec<OrgId> = self
            .orgs()
            .roots()
            .into_iter()
            .filter(|o| o.level == old_root.id)
            .map(|o| o.id)
            .collect();
        if old_roots.is_empty() {
            return Ok(id);
        }
        let names = self
            .orgs()
            .unique_names(UNKNOWN_CODE, UNKNOWN_CODE, UNKNOWN_LONGNAME, None);
        let placeholder = Org::new(names.code, id, None, names.shortname, names.longname)
            .with_selectable(false, false);
        let placeholder = self.state_mut().orgs.insert(placeholder)?;
        for org in &old_roots {
            self.state_mut().orgs.reparent(*org, Some(placeholder))?;
        }
        info!(
            org = %self.orgs().fullcode(placeholder).unwrap_or_default(),
            moved = old_roots.len(),
            "Created root placeholder org"
        );
        Ok(id)
    }

    fn splice_level(
        &mut self,
        name: &str,
        rank: i32,
        parent: LevelId,
        export_flag: bool,
    ) -> HierarchyResult<LevelId> {
        let parent_level = self.levels().require(parent)?.clone();
        if rank >= parent_level.rank {
            return Err(HierarchyError::InvalidRank {
                level: name.to_string(),
                rank,
                reason: format!(
                    "must rank below parent '{}' (rank {})",
                    parent_level.name, parent_level.rank
                ),
            });
        }
        let Some(child_level) = self.levels().child(parent).cloned() else {
            return self.create_level(name, rank, Some(parent), export_flag);
        };
        if rank <= child_level.rank {
            return Err(HierarchyError::InvalidRank {
                level: name.to_string(),
                rank,
                reason: format!(
                    "must rank above child '{}' (rank {})",
                    child_level.name, child_level.rank
                ),
            });
        }

        let level = Level::new(name, rank, Some(parent), export_flag);
        let id = level.id;
        let state = self.state_mut();
        state.levels.insert_unchecked(level);
        state.levels.set_parent_unchecked(child_level.id, Some(id));

        let orgs: Vec<Org> = self
            .orgs()
            .at_level(child_level.id)
            .into_iter()
            .cloned()
            .collect();
        for org in &orgs {
            let names = self.orgs().unique_names(
                &format!("{}{}", PLACEHOLDER_PREFIX, org.code),
                &format!("{}{}", PLACEHOLDER_PREFIX, org.shortname),
                &format!("{}{}", PLACEHOLDER_PREFIX, org.longname),
                org.parent,
            );
            let placeholder = Org::new(names.code, id, org.parent, names.shortname, names.longname)
                .with_selectable(false, false);
            let placeholder = self.state_mut().orgs.insert(placeholder)?;
            self.state_mut().orgs.reparent(org.id, Some(placeholder))?;
            debug!(org = %org.code, placeholder = %placeholder, "Inserted placeholder parent");
        }
        if !orgs.is_empty() {
            info!(level = %name, placeholders = orgs.len(), "Created placeholder orgs");
        }
        Ok(id)
    }

    /// Delete a level, repairing everything that refers to it.
    ///
    /// Every org on the level is first removed through
    /// [`remove_org_from_hierarchy`](HierarchyStore::remove_org_from_hierarchy);
    /// the child level, if any, is then attached to the deleted level's
    /// parent (or promoted to root).
    pub fn delete_level(&mut self, id: LevelId) -> HierarchyResult<()> {
        self.repair("delete_level", |tx| {
            let level = tx.levels().require(id)?.clone();
            let orgs: Vec<OrgId> = tx.orgs().at_level(id).iter().map(|o| o.id).collect();
            for org in &orgs {
                tx.remove_org_from_hierarchy(*org)?;
            }
            if let Some(child) = tx.levels().child(id).map(|l| l.id) {
                tx.state_mut().levels.set_parent_unchecked(child, level.parent);
            }
            tx.remove_level(id)?;
            info!(level = %level.name, orgs = orgs.len(), "Deleted level");
            Ok(())
        })
    }

    /// Remove an org, handing its children and memberships to its parent.
    ///
    /// Children are reparented to the org's parent. Membership links move to
    /// the parent as well, merging with links the entity already has there;
    /// with no parent they are dropped. Directory entries for the org are
    /// removed.
    ///
    /// Moving children up one level breaks the tier structure, so outside a
    /// tier deletion this fails with `StructuralMismatch` for an org that has
    /// children.
    pub fn remove_org_from_hierarchy(&mut self, id: OrgId) -> HierarchyResult<()> {
        let org = self.orgs().require(id)?.clone();
        if self.checks_enabled() && self.orgs().has_children(id) {
            return Err(HierarchyError::StructuralMismatch {
                org: self.orgs().fullcode(id).unwrap_or(org.code),
                reason: "children would skip a level; delete the level instead".to_string(),
            });
        }
        self.transaction("remove_org_from_hierarchy", |tx| {
            let fullcode = tx.orgs().fullcode(id).unwrap_or_default();
            let children: Vec<OrgId> = tx.orgs().children(Some(id)).iter().map(|o| o.id).collect();
            let state = tx.state_mut();
            let links = state.memberships.relocate_org(id, org.parent);
            state.directory.remove_for_org(id);
            tx.detach_org(id);
            for child in &children {
                tx.state_mut().orgs.reparent(*child, org.parent)?;
            }
            info!(
                org = %fullcode,
                children = children.len(),
                links,
                "Removed org from hierarchy"
            );
            Ok(())
        })
    }
}

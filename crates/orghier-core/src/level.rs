//! Organization levels (tiers)
//!
//! Levels form a singly-rooted linear chain ordered by rank: the root has the
//! highest rank and every other level points at the level directly above it.
//! The registry keeps the chain explicitly, indexed by name and by rank.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::error::{HierarchyError, HierarchyResult};
use crate::validate::{self, HierarchyInvariantError};

/// Level identifier.
pub type LevelId = Uuid;

/// One tier of the hierarchy, e.g. "University" or "Department".
///
/// The higher the rank, the more encompassing the tier.
///
/// # Examples
///
/// ```
/// use orghier_core::Level;
///
/// let university = Level::new("University", 40, None, true);
/// assert!(university.is_root());
///
/// let college = Level::new("College", 30, Some(university.id), true);
/// assert_eq!(college.parent, Some(university.id));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Level {
    /// Unique identifier for the level
    pub id: LevelId,

    /// Globally unique name
    pub name: String,

    /// Position in the hierarchy; parents outrank children
    pub rank: i32,

    /// Level directly above this one (None for the root)
    pub parent: Option<LevelId>,

    /// Whether orgs at this level appear in analytics exports
    pub export_flag: bool,

    /// When the level was created
    pub created_at: DateTime<Utc>,

    /// When the level was last updated
    pub updated_at: DateTime<Utc>,
}

impl Level {
    /// Creates a new level with a fresh UUID v7 id.
    pub fn new(
        name: impl Into<String>,
        rank: i32,
        parent: Option<LevelId>,
        export_flag: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            rank,
            parent,
            export_flag,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if this is the root (parentless) level.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Field edits for an existing level.
///
/// Unset fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LevelUpdate {
    /// New name
    pub name: Option<String>,

    /// New rank (must stay strictly between the neighbours' ranks)
    pub rank: Option<i32>,

    /// New export flag
    pub export_flag: Option<bool>,
}

impl LevelUpdate {
    /// Rename the level.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Change the rank.
    pub fn with_rank(mut self, rank: i32) -> Self {
        self.rank = Some(rank);
        self
    }

    /// Toggle the export flag.
    pub fn with_export_flag(mut self, export_flag: bool) -> Self {
        self.export_flag = Some(export_flag);
        self
    }
}

/// Registry of all levels.
///
/// Indexes are derived data; the validator re-derives every invariant from
/// the level records themselves.
#[derive(Debug, Clone, Default)]
pub struct LevelRegistry {
    levels: HashMap<LevelId, Level>,
    by_name: HashMap<String, LevelId>,
    by_rank: BTreeMap<i32, LevelId>,
}

impl LevelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of levels.
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// Check if the registry has no levels.
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Get a level by id.
    pub fn get(&self, id: LevelId) -> Option<&Level> {
        self.levels.get(&id)
    }

    /// Get a level by id, failing with `NotFound`.
    pub fn require(&self, id: LevelId) -> HierarchyResult<&Level> {
        self.get(id).ok_or_else(|| HierarchyError::level_not_found(id))
    }

    /// Look up a level by name.
    pub fn by_name(&self, name: &str) -> Option<&Level> {
        self.by_name.get(name).and_then(|id| self.levels.get(id))
    }

    /// Look up a level by rank.
    pub fn by_rank(&self, rank: i32) -> Option<&Level> {
        self.by_rank.get(&rank).and_then(|id| self.levels.get(id))
    }

    /// Iterate over all levels in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Level> {
        self.levels.values()
    }

    /// Returns the parentless level, or `None` if the registry is empty.
    ///
    /// If the chain is broken and several levels lack a parent, the highest
    /// ranked of them is returned.
    pub fn root(&self) -> Option<&Level> {
        self.roots().into_iter().next()
    }

    /// All parentless levels, highest rank first.
    pub fn roots(&self) -> Vec<&Level> {
        let mut roots: Vec<&Level> = self.levels.values().filter(|l| l.is_root()).collect();
        roots.sort_by(|a, b| b.rank.cmp(&a.rank));
        roots
    }

    /// All levels whose parent is `id`, highest rank first.
    pub fn children(&self, id: LevelId) -> Vec<&Level> {
        let mut children: Vec<&Level> = self
            .levels
            .values()
            .filter(|l| l.parent == Some(id))
            .collect();
        children.sort_by(|a, b| b.rank.cmp(&a.rank));
        children
    }

    /// The level directly below `id`, if any.
    pub fn child(&self, id: LevelId) -> Option<&Level> {
        self.children(id).into_iter().next()
    }

    /// The lowest level of the chain.
    pub fn leaf(&self) -> Option<&Level> {
        self.chain_unchecked().last()
    }

    /// Produce the ordered sequence root→leaf.
    ///
    /// The returned iterator is lazy and can be cloned to restart. With
    /// `validate` set, the chain is checked first and `BrokenChain` is
    /// returned if there is more than one root, a cycle, or a branch.
    pub fn chain(&self, validate: bool) -> HierarchyResult<LevelChain<'_>> {
        if validate {
            self.check_linear()?;
        }
        Ok(self.chain_unchecked())
    }

    fn chain_unchecked(&self) -> LevelChain<'_> {
        LevelChain {
            registry: self,
            next: self.root().map(|l| l.id),
            remaining: self.levels.len(),
        }
    }

    fn check_linear(&self) -> HierarchyResult<()> {
        let roots = self.roots();
        if roots.len() > 1 {
            let names: Vec<&str> = roots.iter().map(|l| l.name.as_str()).collect();
            return Err(HierarchyError::BrokenChain(format!(
                "multiple root levels: {}",
                names.join(", ")
            )));
        }
        let Some(root) = roots.first() else {
            if self.levels.is_empty() {
                return Ok(());
            }
            return Err(HierarchyError::BrokenChain(
                "no root level (cycle through every level)".to_string(),
            ));
        };

        let mut visited = 0usize;
        let mut current = Some(root.id);
        while let Some(id) = current {
            visited += 1;
            if visited > self.levels.len() {
                return Err(HierarchyError::BrokenChain(
                    "cycle detected in level chain".to_string(),
                ));
            }
            let children = self.children(id);
            if children.len() > 1 {
                let names: Vec<&str> = children.iter().map(|l| l.name.as_str()).collect();
                return Err(HierarchyError::BrokenChain(format!(
                    "level '{}' has multiple children: {}",
                    self.levels[&id].name,
                    names.join(", ")
                )));
            }
            current = children.first().map(|l| l.id);
        }
        if visited != self.levels.len() {
            return Err(HierarchyError::BrokenChain(format!(
                "{} level(s) unreachable from root '{}'",
                self.levels.len() - visited,
                root.name
            )));
        }
        Ok(())
    }

    /// Check every level invariant, reporting all violations found.
    pub fn validate(&self) -> Result<(), HierarchyInvariantError> {
        validate::validate_levels(self)
    }

    /// Append a level with inline validation.
    ///
    /// Only two shapes are accepted: the first root of an empty registry, or a
    /// new leaf below the current leaf. Anything else needs the tier mutator,
    /// which repairs the org tree as it rewires the chain.
    pub fn append(
        &mut self,
        name: impl Into<String>,
        rank: i32,
        parent: Option<LevelId>,
        export_flag: bool,
    ) -> HierarchyResult<LevelId> {
        let name = name.into();
        self.check_name_available(&name, None)?;
        self.check_rank_available(&name, rank, None)?;
        match parent {
            None => {
                if !self.is_empty() {
                    return Err(HierarchyError::BrokenChain(format!(
                        "level '{}' has no parent but {} level(s) already exist",
                        name,
                        self.len()
                    )));
                }
            }
            Some(parent_id) => {
                let parent = self.require(parent_id)?;
                if parent.rank <= rank {
                    return Err(HierarchyError::InvalidRank {
                        level: name,
                        rank,
                        reason: format!(
                            "parent '{}' has rank {} which is not higher",
                            parent.name, parent.rank
                        ),
                    });
                }
                if let Some(child) = self.child(parent_id) {
                    return Err(HierarchyError::BrokenChain(format!(
                        "level '{}' already has child '{}'",
                        parent.name, child.name
                    )));
                }
            }
        }
        let level = Level::new(name, rank, parent, export_flag);
        let id = level.id;
        self.insert_unchecked(level);
        Ok(id)
    }

    /// Apply field edits, preserving strict rank ordering.
    pub fn update(&mut self, id: LevelId, update: LevelUpdate) -> HierarchyResult<()> {
        let current = self.require(id)?.clone();
        if let Some(name) = &update.name {
            self.check_name_available(name, Some(id))?;
        }
        if let Some(rank) = update.rank {
            self.check_rank_available(&current.name, rank, Some(id))?;
            if let Some(parent) = current.parent.and_then(|p| self.get(p)) {
                if parent.rank <= rank {
                    return Err(HierarchyError::InvalidRank {
                        level: current.name.clone(),
                        rank,
                        reason: format!(
                            "must stay below parent '{}' rank {}",
                            parent.name, parent.rank
                        ),
                    });
                }
            }
            if let Some(child) = self.child(id) {
                if child.rank >= rank {
                    return Err(HierarchyError::InvalidRank {
                        level: current.name.clone(),
                        rank,
                        reason: format!(
                            "must stay above child '{}' rank {}",
                            child.name, child.rank
                        ),
                    });
                }
            }
        }

        let mut level = current;
        if let Some(name) = update.name {
            self.by_name.remove(&level.name);
            self.by_name.insert(name.clone(), id);
            level.name = name;
        }
        if let Some(rank) = update.rank {
            self.by_rank.remove(&level.rank);
            self.by_rank.insert(rank, id);
            level.rank = rank;
        }
        if let Some(export_flag) = update.export_flag {
            level.export_flag = export_flag;
        }
        level.touch();
        self.levels.insert(id, level);
        Ok(())
    }

    pub(crate) fn check_name_available(
        &self,
        name: &str,
        except: Option<LevelId>,
    ) -> HierarchyResult<()> {
        match self.by_name.get(name) {
            Some(existing) if Some(*existing) != except => Err(HierarchyError::UniquenessConflict {
                field: "name",
                value: name.to_string(),
                scope: "levels".to_string(),
            }),
            _ => Ok(()),
        }
    }

    pub(crate) fn check_rank_available(
        &self,
        name: &str,
        rank: i32,
        except: Option<LevelId>,
    ) -> HierarchyResult<()> {
        match self.by_rank(rank) {
            Some(existing) if Some(existing.id) != except => Err(HierarchyError::InvalidRank {
                level: name.to_string(),
                rank,
                reason: format!("rank already used by level '{}'", existing.name),
            }),
            _ => Ok(()),
        }
    }

    pub(crate) fn insert_unchecked(&mut self, level: Level) {
        self.by_name.insert(level.name.clone(), level.id);
        self.by_rank.insert(level.rank, level.id);
        self.levels.insert(level.id, level);
    }

    pub(crate) fn set_parent_unchecked(&mut self, id: LevelId, parent: Option<LevelId>) {
        if let Some(level) = self.levels.get_mut(&id) {
            level.parent = parent;
            level.touch();
        }
    }

    pub(crate) fn remove_unchecked(&mut self, id: LevelId) -> Option<Level> {
        let level = self.levels.remove(&id)?;
        if self.by_name.get(&level.name) == Some(&id) {
            self.by_name.remove(&level.name);
        }
        if self.by_rank.get(&level.rank) == Some(&id) {
            self.by_rank.remove(&level.rank);
        }
        Some(level)
    }
}

/// Lazy root→leaf iterator over a [`LevelRegistry`].
///
/// Follows the highest-ranked child at each step and stops after visiting as
/// many levels as the registry holds, so a corrupted cycle cannot loop forever.
#[derive(Debug, Clone)]
pub struct LevelChain<'a> {
    registry: &'a LevelRegistry,
    next: Option<LevelId>,
    remaining: usize,
}

impl<'a> Iterator for LevelChain<'a> {
    type Item = &'a Level;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let level = self.registry.get(self.next?)?;
        self.remaining -= 1;
        self.next = self.registry.child(level.id).map(|l| l.id);
        Some(level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn academic() -> (LevelRegistry, LevelId, LevelId, LevelId) {
        let mut reg = LevelRegistry::new();
        let univ = reg.append("University", 40, None, true).unwrap();
        let coll = reg.append("College", 30, Some(univ), true).unwrap();
        let dept = reg.append("Department", 20, Some(coll), true).unwrap();
        (reg, univ, coll, dept)
    }

    fn names(reg: &LevelRegistry) -> Vec<String> {
        reg.chain(true)
            .unwrap()
            .map(|l| l.name.clone())
            .collect()
    }

    #[test]
    fn test_chain_order() {
        let (reg, univ, _, dept) = academic();
        assert_eq!(names(&reg), vec!["University", "College", "Department"]);
        assert_eq!(reg.root().unwrap().id, univ);
        assert_eq!(reg.leaf().unwrap().id, dept);
        assert!(reg.validate().is_ok());
    }

    #[test]
    fn test_chain_is_restartable() {
        let (reg, _, _, _) = academic();
        let chain = reg.chain(false).unwrap();
        let first: Vec<i32> = chain.clone().map(|l| l.rank).collect();
        let second: Vec<i32> = chain.map(|l| l.rank).collect();
        assert_eq!(first, vec![40, 30, 20]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_registry() {
        let reg = LevelRegistry::new();
        assert!(reg.root().is_none());
        assert_eq!(reg.chain(true).unwrap().count(), 0);
        assert!(reg.validate().is_ok());
    }

    #[test]
    fn test_append_rejects_second_root() {
        let (mut reg, _, _, _) = academic();
        let err = reg.append("Country", 50, None, true).unwrap_err();
        assert!(matches!(err, HierarchyError::BrokenChain(_)));
    }

    #[test]
    fn test_append_rejects_middle_insert() {
        let (mut reg, univ, _, _) = academic();
        let err = reg.append("Campus", 35, Some(univ), true).unwrap_err();
        assert!(matches!(err, HierarchyError::BrokenChain(_)));
    }

    #[test]
    fn test_append_rejects_bad_leaf_rank() {
        let (mut reg, _, _, dept) = academic();
        let err = reg.append("ResearchGroup", 25, Some(dept), true).unwrap_err();
        assert!(matches!(err, HierarchyError::InvalidRank { rank: 25, .. }));
    }

    #[test]
    fn test_append_rejects_duplicates() {
        let (mut reg, _, _, dept) = academic();
        let err = reg.append("College", 10, Some(dept), true).unwrap_err();
        assert!(matches!(err, HierarchyError::UniquenessConflict { field: "name", .. }));

        let err = reg.append("Lab", 30, Some(dept), true).unwrap_err();
        assert!(matches!(err, HierarchyError::InvalidRank { .. }));
    }

    #[test]
    fn test_chain_detects_branch() {
        let (mut reg, univ, _, _) = academic();
        reg.insert_unchecked(Level::new("Campus", 35, Some(univ), true));
        let err = reg.chain(true).unwrap_err();
        assert!(matches!(err, HierarchyError::BrokenChain(ref msg) if msg.contains("multiple children")));
        // Unvalidated chain still terminates
        assert!(reg.chain(false).unwrap().count() <= reg.len());
    }

    #[test]
    fn test_chain_detects_multiple_roots() {
        let (mut reg, _, _, _) = academic();
        reg.insert_unchecked(Level::new("Country", 50, None, true));
        let err = reg.chain(true).unwrap_err();
        assert!(matches!(err, HierarchyError::BrokenChain(ref msg) if msg.contains("multiple root")));
    }

    #[test]
    fn test_update_preserves_ordering() {
        let (mut reg, univ, coll, _) = academic();
        reg.update(coll, LevelUpdate::default().with_rank(35)).unwrap();
        assert_eq!(reg.get(coll).unwrap().rank, 35);
        assert_eq!(reg.by_rank(35).unwrap().id, coll);
        assert!(reg.by_rank(30).is_none());

        let err = reg.update(coll, LevelUpdate::default().with_rank(45)).unwrap_err();
        assert!(matches!(err, HierarchyError::InvalidRank { .. }));
        let err = reg.update(coll, LevelUpdate::default().with_rank(15)).unwrap_err();
        assert!(matches!(err, HierarchyError::InvalidRank { .. }));

        reg.update(univ, LevelUpdate::default().with_name("Campus").with_export_flag(false))
            .unwrap();
        assert!(reg.by_name("University").is_none());
        assert!(!reg.by_name("Campus").unwrap().export_flag);
    }
}

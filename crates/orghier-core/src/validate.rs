//! Hierarchy validation
//!
//! Read-only audit of the level chain, the org tree and the membership
//! ledger. Every check works from the stored records rather than from the
//! indexes the mutators maintain, and every violation is reported, not only
//! the first. Ordinary mutations enforce their invariants inline; this is
//! the consistency audit run on demand or at transaction commit.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use thiserror::Error;

use crate::level::{LevelId, LevelRegistry};
use crate::membership::{EntityId, EntityKind, MembershipLedger};
use crate::organization::{validate_code, NameField, OrgId, OrgTree};

/// A single broken invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// Levels exist but none is parentless
    NoRootLevel,

    /// More than one parentless level
    MultipleRootLevels { names: Vec<String> },

    /// More than one level without a child level
    MultipleLeafLevels { names: Vec<String> },

    /// A level with several child levels
    BranchingLevel { level: String, children: Vec<String> },

    /// A level whose parent does not outrank it
    RankNotDecreasing {
        level: String,
        rank: i32,
        parent: String,
        parent_rank: i32,
    },

    /// Two levels with the same name
    DuplicateLevelName { name: String, count: usize },

    /// Two levels with the same rank
    DuplicateLevelRank { rank: i32, names: Vec<String> },

    /// A level pointing at a parent that does not exist
    DanglingLevelParent { level: String, parent: LevelId },

    /// Levels whose parent links loop
    LevelCycle { levels: Vec<String> },

    /// An org bound to a level that does not exist
    OrgUnknownLevel { org: OrgId, level: LevelId },

    /// An org on the root level that has a parent
    RootOrgHasParent { org: String },

    /// An org below the root level without a parent
    MissingOrgParent { org: String },

    /// An org whose parent is not on its level's parent level
    OrgParentLevelMismatch {
        org: String,
        expected_level: String,
        parent: String,
    },

    /// An org pointing at a parent that does not exist
    DanglingOrgParent { org: String, parent: OrgId },

    /// A code or name used twice within one parent scope
    DuplicateOrgName {
        field: &'static str,
        value: String,
        parent: Option<OrgId>,
    },

    /// An org code that is empty or contains the fullcode separator
    InvalidOrgCode { org: OrgId, code: String },

    /// A non-leaf org selectable although policy restricts selection to leaves
    NonLeafSelectable { org: String, kind: EntityKind },

    /// A membership link pointing at an org that does not exist
    DanglingMembership {
        kind: EntityKind,
        entity: EntityId,
        org: OrgId,
    },

    /// An entity with several primary links
    MultiplePrimary {
        kind: EntityKind,
        entity: EntityId,
        orgs: Vec<OrgId>,
    },

    /// Orgs whose parent links loop
    OrgCycle { orgs: Vec<OrgId> },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::NoRootLevel => write!(f, "no root level"),
            Violation::MultipleRootLevels { names } => {
                write!(f, "multiple root levels: {}", names.join(", "))
            }
            Violation::MultipleLeafLevels { names } => {
                write!(f, "multiple leaf levels: {}", names.join(", "))
            }
            Violation::BranchingLevel { level, children } => write!(
                f,
                "level '{}' has multiple child levels: {}",
                level,
                children.join(", ")
            ),
            Violation::RankNotDecreasing {
                level,
                rank,
                parent,
                parent_rank,
            } => write!(
                f,
                "level '{}' (rank {}) is not outranked by parent '{}' (rank {})",
                level, rank, parent, parent_rank
            ),
            Violation::DuplicateLevelName { name, count } => {
                write!(f, "level name '{}' used {} times", name, count)
            }
            Violation::DuplicateLevelRank { rank, names } => {
                write!(f, "rank {} shared by levels {}", rank, names.join(", "))
            }
            Violation::DanglingLevelParent { level, parent } => {
                write!(f, "level '{}' has missing parent {}", level, parent)
            }
            Violation::LevelCycle { levels } => {
                write!(f, "level parent cycle through {}", levels.join(", "))
            }
            Violation::OrgUnknownLevel { org, level } => {
                write!(f, "org {} is on missing level {}", org, level)
            }
            Violation::RootOrgHasParent { org } => {
                write!(f, "org '{}' is on the root level but has a parent", org)
            }
            Violation::MissingOrgParent { org } => {
                write!(f, "org '{}' is below the root level but has no parent", org)
            }
            Violation::OrgParentLevelMismatch {
                org,
                expected_level,
                parent,
            } => write!(
                f,
                "org '{}' has parent '{}' which is not on level '{}'",
                org, parent, expected_level
            ),
            Violation::DanglingOrgParent { org, parent } => {
                write!(f, "org '{}' has missing parent {}", org, parent)
            }
            Violation::DuplicateOrgName {
                field,
                value,
                parent,
            } => match parent {
                Some(parent) => write!(f, "{} '{}' duplicated under org {}", field, value, parent),
                None => write!(f, "{} '{}' duplicated among root orgs", field, value),
            },
            Violation::InvalidOrgCode { org, code } => {
                write!(f, "org {} has invalid code '{}'", org, code)
            }
            Violation::NonLeafSelectable { org, kind } => {
                write!(f, "non-leaf org '{}' is selectable for {}", org, kind)
            }
            Violation::DanglingMembership { kind, entity, org } => {
                write!(f, "{} {} linked to missing org {}", kind, entity, org)
            }
            Violation::MultiplePrimary { kind, entity, orgs } => write!(
                f,
                "{} {} has {} primary memberships",
                kind,
                entity,
                orgs.len()
            ),
            Violation::OrgCycle { orgs } => write!(f, "org parent cycle through {} orgs", orgs.len()),
        }
    }
}

/// Aggregate validator failure carrying every violation found.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} hierarchy invariant violation(s){}", .violations.len(), summary(.violations))]
pub struct HierarchyInvariantError {
    /// All violations, in discovery order
    pub violations: Vec<Violation>,
}

impl HierarchyInvariantError {
    /// Wrap a list of violations.
    pub fn new(violations: Vec<Violation>) -> Self {
        Self { violations }
    }

    fn check(violations: Vec<Violation>) -> Result<(), Self> {
        if violations.is_empty() {
            Ok(())
        } else {
            Err(Self::new(violations))
        }
    }
}

fn summary(violations: &[Violation]) -> String {
    violations.iter().map(|v| format!("; {}", v)).collect()
}

/// Options for [`validate_orgs`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgValidationOptions {
    /// Only leaf-level orgs may be selectable for users
    pub only_leaves_selectable_for_user: bool,

    /// Only leaf-level orgs may be selectable for projects
    pub only_leaves_selectable_for_project: bool,

    /// Also audit the membership ledger
    pub check_memberships: bool,
}

/// Check the level chain: single root, single leaf, strictly decreasing
/// rank root to leaf, unique names and ranks, no dangling parents or cycles.
pub fn validate_levels(levels: &LevelRegistry) -> Result<(), HierarchyInvariantError> {
    HierarchyInvariantError::check(level_violations(levels))
}

fn level_violations(levels: &LevelRegistry) -> Vec<Violation> {
    let mut violations = Vec::new();
    let mut all: Vec<_> = levels.iter().collect();
    if all.is_empty() {
        return violations;
    }
    all.sort_by(|a, b| b.rank.cmp(&a.rank).then(a.name.cmp(&b.name)));
    let by_id: HashMap<LevelId, _> = all.iter().map(|l| (l.id, *l)).collect();

    let roots: Vec<String> = all
        .iter()
        .filter(|l| l.parent.is_none())
        .map(|l| l.name.clone())
        .collect();
    match roots.len() {
        0 => violations.push(Violation::NoRootLevel),
        1 => {}
        _ => violations.push(Violation::MultipleRootLevels { names: roots }),
    }

    let mut children: BTreeMap<LevelId, Vec<String>> = BTreeMap::new();
    for level in &all {
        let Some(parent_id) = level.parent else {
            continue;
        };
        match by_id.get(&parent_id) {
            Some(parent) => {
                children.entry(parent_id).or_default().push(level.name.clone());
                if parent.rank <= level.rank {
                    violations.push(Violation::RankNotDecreasing {
                        level: level.name.clone(),
                        rank: level.rank,
                        parent: parent.name.clone(),
                        parent_rank: parent.rank,
                    });
                }
            }
            None => violations.push(Violation::DanglingLevelParent {
                level: level.name.clone(),
                parent: parent_id,
            }),
        }
    }

    let leaves: Vec<String> = all
        .iter()
        .filter(|l| !children.contains_key(&l.id))
        .map(|l| l.name.clone())
        .collect();
    if leaves.len() > 1 {
        violations.push(Violation::MultipleLeafLevels { names: leaves });
    }
    for level in &all {
        if let Some(names) = children.get(&level.id) {
            if names.len() > 1 {
                violations.push(Violation::BranchingLevel {
                    level: level.name.clone(),
                    children: names.clone(),
                });
            }
        }
    }

    let mut names: BTreeMap<&str, usize> = BTreeMap::new();
    let mut ranks: BTreeMap<i32, Vec<String>> = BTreeMap::new();
    for level in &all {
        *names.entry(level.name.as_str()).or_default() += 1;
        ranks.entry(level.rank).or_default().push(level.name.clone());
    }
    for (name, count) in names {
        if count > 1 {
            violations.push(Violation::DuplicateLevelName {
                name: name.to_string(),
                count,
            });
        }
    }
    for (rank, names) in ranks.into_iter().rev() {
        if names.len() > 1 {
            violations.push(Violation::DuplicateLevelRank { rank, names });
        }
    }

    let parents: HashMap<LevelId, LevelId> = all
        .iter()
        .filter_map(|l| l.parent.map(|p| (l.id, p)))
        .collect();
    for cycle in find_cycles(&parents) {
        let mut members: Vec<String> = cycle
            .iter()
            .filter_map(|id| by_id.get(id).map(|l| l.name.clone()))
            .collect();
        members.sort();
        violations.push(Violation::LevelCycle { levels: members });
    }

    violations
}

/// Find every cycle in a parent map, each reported once as a sorted id set.
fn find_cycles(parents: &HashMap<uuid::Uuid, uuid::Uuid>) -> BTreeSet<Vec<uuid::Uuid>> {
    let mut cycles = BTreeSet::new();
    let mut settled: HashSet<uuid::Uuid> = HashSet::new();
    let mut starts: Vec<_> = parents.keys().copied().collect();
    starts.sort();
    for start in starts {
        let mut path: Vec<uuid::Uuid> = Vec::new();
        let mut on_path: HashSet<uuid::Uuid> = HashSet::new();
        let mut current = Some(start);
        while let Some(id) = current {
            if settled.contains(&id) {
                break;
            }
            if !on_path.insert(id) {
                let pos = path.iter().position(|p| *p == id).unwrap_or(0);
                let mut cycle = path[pos..].to_vec();
                cycle.sort();
                cycles.insert(cycle);
                break;
            }
            path.push(id);
            current = parents.get(&id).copied();
        }
        settled.extend(path);
    }
    cycles
}

/// Check the org tree against the level chain, and optionally the ledger.
pub fn validate_orgs(
    levels: &LevelRegistry,
    orgs: &OrgTree,
    memberships: &MembershipLedger,
    options: &OrgValidationOptions,
) -> Result<(), HierarchyInvariantError> {
    let mut violations = org_violations(levels, orgs, options);
    if options.check_memberships {
        violations.extend(membership_violations(orgs, memberships));
    }
    HierarchyInvariantError::check(violations)
}

fn org_violations(
    levels: &LevelRegistry,
    orgs: &OrgTree,
    options: &OrgValidationOptions,
) -> Vec<Violation> {
    let mut violations = Vec::new();
    let mut all: Vec<_> = orgs.iter().collect();
    all.sort_by_key(|o| o.id);
    let by_id: HashMap<OrgId, _> = all.iter().map(|o| (o.id, *o)).collect();
    let has_child_level: HashSet<LevelId> = levels.iter().filter_map(|l| l.parent).collect();

    for org in &all {
        if validate_code(&org.code).is_err() {
            violations.push(Violation::InvalidOrgCode {
                org: org.id,
                code: org.code.clone(),
            });
        }
        let Some(level) = levels.get(org.level) else {
            violations.push(Violation::OrgUnknownLevel {
                org: org.id,
                level: org.level,
            });
            continue;
        };

        match (level.parent, org.parent) {
            (None, Some(_)) => violations.push(Violation::RootOrgHasParent {
                org: org.code.clone(),
            }),
            (Some(_), None) => violations.push(Violation::MissingOrgParent {
                org: org.code.clone(),
            }),
            (Some(expected), Some(parent_id)) => match by_id.get(&parent_id) {
                Some(parent) if parent.level != expected => {
                    violations.push(Violation::OrgParentLevelMismatch {
                        org: org.code.clone(),
                        expected_level: levels
                            .get(expected)
                            .map(|l| l.name.clone())
                            .unwrap_or_else(|| expected.to_string()),
                        parent: parent.code.clone(),
                    })
                }
                Some(_) => {}
                None => violations.push(Violation::DanglingOrgParent {
                    org: org.code.clone(),
                    parent: parent_id,
                }),
            },
            (None, None) => {}
        }

        let is_leaf = !has_child_level.contains(&level.id);
        if !is_leaf {
            if options.only_leaves_selectable_for_user && org.selectable_for_user {
                violations.push(Violation::NonLeafSelectable {
                    org: org.code.clone(),
                    kind: EntityKind::User,
                });
            }
            if options.only_leaves_selectable_for_project && org.selectable_for_project {
                violations.push(Violation::NonLeafSelectable {
                    org: org.code.clone(),
                    kind: EntityKind::Project,
                });
            }
        }
    }

    let mut scopes: BTreeMap<(Option<OrgId>, &'static str, &str), usize> = BTreeMap::new();
    for org in &all {
        for field in NameField::ALL {
            *scopes
                .entry((org.parent, field.as_str(), field.value(org)))
                .or_default() += 1;
        }
    }
    for ((parent, field, value), count) in scopes {
        if count > 1 {
            violations.push(Violation::DuplicateOrgName {
                field,
                value: value.to_string(),
                parent,
            });
        }
    }

    let parents: HashMap<OrgId, OrgId> = all
        .iter()
        .filter_map(|o| o.parent.map(|p| (o.id, p)))
        .collect();
    for cycle in find_cycles(&parents) {
        violations.push(Violation::OrgCycle { orgs: cycle });
    }

    violations
}

fn membership_violations(orgs: &OrgTree, memberships: &MembershipLedger) -> Vec<Violation> {
    let mut violations = Vec::new();
    for kind in EntityKind::ALL {
        let mut primaries: BTreeMap<EntityId, Vec<OrgId>> = BTreeMap::new();
        for link in memberships.iter(kind) {
            if orgs.get(link.org).is_none() {
                violations.push(Violation::DanglingMembership {
                    kind,
                    entity: link.entity,
                    org: link.org,
                });
            }
            if link.is_primary {
                primaries.entry(link.entity).or_default().push(link.org);
            }
        }
        for (entity, orgs) in primaries {
            if orgs.len() > 1 {
                violations.push(Violation::MultiplePrimary { kind, entity, orgs });
            }
        }
    }
    violations
}

/// Read-only validator over one consistent view of the hierarchy.
///
/// # Examples
///
/// ```
/// use orghier_core::{HierarchyStore, HierarchyValidator, OrgValidationOptions};
///
/// let mut store = HierarchyStore::new();
/// store.create_level("University", 40, None, true).unwrap();
///
/// let validator = HierarchyValidator::new(store.levels(), store.orgs(), store.memberships());
/// assert!(validator.audit(&OrgValidationOptions::default()).is_ok());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct HierarchyValidator<'a> {
    levels: &'a LevelRegistry,
    orgs: &'a OrgTree,
    memberships: &'a MembershipLedger,
}

impl<'a> HierarchyValidator<'a> {
    /// Create a validator over borrowed hierarchy parts.
    pub fn new(
        levels: &'a LevelRegistry,
        orgs: &'a OrgTree,
        memberships: &'a MembershipLedger,
    ) -> Self {
        Self {
            levels,
            orgs,
            memberships,
        }
    }

    /// Check the level chain.
    pub fn validate_levels(&self) -> Result<(), HierarchyInvariantError> {
        validate_levels(self.levels)
    }

    /// Check the org tree (and the ledger, if requested).
    pub fn validate_orgs(&self, options: &OrgValidationOptions) -> Result<(), HierarchyInvariantError> {
        validate_orgs(self.levels, self.orgs, self.memberships, options)
    }

    /// Run both checks, merging their violations into one error.
    pub fn audit(&self, options: &OrgValidationOptions) -> Result<(), HierarchyInvariantError> {
        let mut violations = level_violations(self.levels);
        violations.extend(org_violations(self.levels, self.orgs, options));
        if options.check_memberships {
            violations.extend(membership_violations(self.orgs, self.memberships));
        }
        HierarchyInvariantError::check(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::Level;
    use crate::membership::MembershipLink;
    use crate::organization::Org;
    use uuid::Uuid;

    struct Fixture {
        levels: LevelRegistry,
        orgs: OrgTree,
        ledger: MembershipLedger,
        univ: LevelId,
        coll: LevelId,
        dept: LevelId,
        umd: OrgId,
        cmns: OrgId,
    }

    fn fixture() -> Fixture {
        let mut levels = LevelRegistry::new();
        let univ = levels.append("University", 40, None, true).unwrap();
        let coll = levels.append("College", 30, Some(univ), true).unwrap();
        let dept = levels.append("Department", 20, Some(coll), true).unwrap();
        let mut orgs = OrgTree::new();
        let umd = orgs.insert(Org::new("UMD", univ, None, "UMCP", "University of Maryland")).unwrap();
        let cmns = orgs
            .insert(Org::new("CMNS", coll, Some(umd), "CMNS", "College of CMNS"))
            .unwrap();
        orgs.insert(Org::new("PHYS", dept, Some(cmns), "Physics", "Physics Department"))
            .unwrap();
        Fixture {
            levels,
            orgs,
            ledger: MembershipLedger::new(),
            univ,
            coll,
            dept,
            umd,
            cmns,
        }
    }

    fn all_checks() -> OrgValidationOptions {
        OrgValidationOptions {
            check_memberships: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_invariant_error_lists_every_violation() {
        let err = HierarchyInvariantError::new(vec![
            Violation::NoRootLevel,
            Violation::MultipleLeafLevels {
                names: vec!["Department".to_string(), "Lab".to_string()],
            },
        ]);
        assert_eq!(
            err.to_string(),
            "2 hierarchy invariant violation(s); no root level; multiple leaf levels: Department, Lab"
        );
        let source: &dyn std::error::Error = &err;
        assert!(source.source().is_none());

        let wrapped = crate::error::HierarchyError::from(err);
        assert!(wrapped.to_string().starts_with("2 hierarchy invariant violation(s)"));
    }

    #[test]
    fn test_clean_hierarchy_passes() {
        let f = fixture();
        let validator = HierarchyValidator::new(&f.levels, &f.orgs, &f.ledger);
        assert!(validator.validate_levels().is_ok());
        assert!(validator.validate_orgs(&all_checks()).is_ok());
        assert!(validator.audit(&all_checks()).is_ok());
    }

    #[test]
    fn test_reports_every_level_violation() {
        let mut f = fixture();
        // Second root, and a rank that does not decrease
        f.levels.insert_unchecked(Level::new("Country", 50, None, true));
        f.levels.insert_unchecked(Level::new("Campus", 45, Some(f.univ), true));

        let err = validate_levels(&f.levels).unwrap_err();
        assert!(err
            .violations
            .iter()
            .any(|v| matches!(v, Violation::MultipleRootLevels { names } if names.len() == 2)));
        assert!(err
            .violations
            .iter()
            .any(|v| matches!(v, Violation::RankNotDecreasing { level, .. } if level == "Campus")));
        assert!(err
            .violations
            .iter()
            .any(|v| matches!(v, Violation::BranchingLevel { level, .. } if level == "University")));
        assert!(err
            .violations
            .iter()
            .any(|v| matches!(v, Violation::MultipleLeafLevels { .. })));
        assert!(err.violations.len() >= 4);
        assert!(err.to_string().contains("multiple root levels"));
    }

    #[test]
    fn test_detects_level_cycle() {
        let mut f = fixture();
        f.levels.set_parent_unchecked(f.univ, Some(f.dept));
        let err = validate_levels(&f.levels).unwrap_err();
        assert!(err.violations.contains(&Violation::NoRootLevel));
        assert!(err
            .violations
            .iter()
            .any(|v| matches!(v, Violation::LevelCycle { levels } if levels.len() == 3)));
    }

    #[test]
    fn test_detects_org_structure_violations() {
        let mut f = fixture();
        // College-level org placed at the root scope
        f.orgs.insert_unchecked(Org::new("ENGR", f.coll, None, "Engineering", "Engineering"));
        // Department-level org under the university
        f.orgs.insert_unchecked(Org::new("MATH", f.dept, Some(f.umd), "Math", "Mathematics"));
        // Duplicate code under CMNS
        f.orgs.insert_unchecked(Org::new("PHYS", f.dept, Some(f.cmns), "Physics2", "Physics 2"));
        // Bad code
        f.orgs.insert_unchecked(Org::new("BAD-CODE", f.dept, Some(f.cmns), "Bad", "Bad"));

        let err = validate_orgs(&f.levels, &f.orgs, &f.ledger, &all_checks()).unwrap_err();
        let v = &err.violations;
        assert!(v.iter().any(|v| matches!(v, Violation::MissingOrgParent { org } if org == "ENGR")));
        assert!(v
            .iter()
            .any(|v| matches!(v, Violation::OrgParentLevelMismatch { org, .. } if org == "MATH")));
        assert!(v.iter().any(
            |v| matches!(v, Violation::DuplicateOrgName { field: "code", value, .. } if value == "PHYS")
        ));
        assert!(v
            .iter()
            .any(|v| matches!(v, Violation::InvalidOrgCode { code, .. } if code == "BAD-CODE")));
    }

    #[test]
    fn test_only_leaves_selectable() {
        let f = fixture();
        let options = OrgValidationOptions {
            only_leaves_selectable_for_user: true,
            ..Default::default()
        };
        let err = validate_orgs(&f.levels, &f.orgs, &f.ledger, &options).unwrap_err();
        // UMD and CMNS are selectable but not on the leaf level
        assert_eq!(err.violations.len(), 2);
        assert!(err
            .violations
            .iter()
            .all(|v| matches!(v, Violation::NonLeafSelectable { kind: EntityKind::User, .. })));
    }

    #[test]
    fn test_membership_audit() {
        let mut f = fixture();
        let user = Uuid::now_v7();
        f.ledger
            .insert_unchecked(MembershipLink::new(EntityKind::User, user, f.umd, true));
        f.ledger
            .insert_unchecked(MembershipLink::new(EntityKind::User, user, f.cmns, true));
        f.ledger
            .insert_unchecked(MembershipLink::new(EntityKind::Project, user, Uuid::now_v7(), false));

        // Ledger is ignored unless requested
        assert!(validate_orgs(&f.levels, &f.orgs, &f.ledger, &Default::default()).is_ok());

        let err = validate_orgs(&f.levels, &f.orgs, &f.ledger, &all_checks()).unwrap_err();
        assert!(err
            .violations
            .iter()
            .any(|v| matches!(v, Violation::MultiplePrimary { orgs, .. } if orgs.len() == 2)));
        assert!(err.violations.iter().any(|v| matches!(
            v,
            Violation::DanglingMembership { kind: EntityKind::Project, .. }
        )));
    }

    #[test]
    fn test_detects_org_cycle() {
        let mut f = fixture();
        let mut a = Org::new("A", f.coll, None, "A", "A");
        let mut b = Org::new("B", f.coll, None, "B", "B");
        a.parent = Some(b.id);
        b.parent = Some(a.id);
        f.orgs.insert_unchecked(a);
        f.orgs.insert_unchecked(b);
        let err = validate_orgs(&f.levels, &f.orgs, &f.ledger, &Default::default()).unwrap_err();
        assert!(err
            .violations
            .iter()
            .any(|v| matches!(v, Violation::OrgCycle { orgs } if orgs.len() == 2)));
    }
}

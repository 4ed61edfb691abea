//! Listing queries for the administrative interface.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::level::LevelId;
use crate::membership::{EntityId, EntityKind, MembershipLink};
use crate::organization::{Org, OrgId};
use crate::store::HierarchyStore;

/// Filter for [`HierarchyStore::list_orgs`]. Unset filters match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgQuery {
    /// Only orgs on this level
    pub level: Option<LevelId>,

    /// Only strict descendants of this org
    pub descendant_of: Option<OrgId>,

    /// Only orgs selectable for this entity kind
    pub selectable_for: Option<EntityKind>,
}

impl OrgQuery {
    /// Match every org.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to one level.
    pub fn at_level(mut self, level: LevelId) -> Self {
        self.level = Some(level);
        self
    }

    /// Restrict to descendants of `org`.
    pub fn descendant_of(mut self, org: OrgId) -> Self {
        self.descendant_of = Some(org);
        self
    }

    /// Restrict to orgs selectable for `kind`.
    pub fn selectable_for(mut self, kind: EntityKind) -> Self {
        self.selectable_for = Some(kind);
        self
    }
}

/// Filter for [`HierarchyStore::list_memberships`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipQuery {
    /// Entity kind to list
    pub kind: EntityKind,

    /// Only links on this org
    pub org: Option<OrgId>,

    /// With `org`, also include links on its descendants
    pub include_descendants: bool,

    /// Only links of this entity
    pub entity: Option<EntityId>,

    /// Only primary (or only non-primary) links
    pub primary: Option<bool>,
}

impl MembershipQuery {
    /// Match every link of `kind`.
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            org: None,
            include_descendants: false,
            entity: None,
            primary: None,
        }
    }

    /// Restrict to links on `org`, optionally including its descendants.
    pub fn in_org(mut self, org: OrgId, include_descendants: bool) -> Self {
        self.org = Some(org);
        self.include_descendants = include_descendants;
        self
    }

    /// Restrict to one entity.
    pub fn for_entity(mut self, entity: EntityId) -> Self {
        self.entity = Some(entity);
        self
    }

    /// Restrict by primary flag.
    pub fn primary(mut self, primary: bool) -> Self {
        self.primary = Some(primary);
        self
    }
}

impl HierarchyStore {
    /// Orgs matching `query`, ordered by fullcode.
    pub fn list_orgs(&self, query: &OrgQuery) -> Vec<&Org> {
        let orgs = self.orgs();
        let candidates: Vec<&Org> = match query.descendant_of {
            Some(ancestor) => orgs.descendants(ancestor),
            None => orgs.iter().collect(),
        };
        let mut listed: Vec<(String, &Org)> = candidates
            .into_iter()
            .filter(|o| query.level.map_or(true, |level| o.level == level))
            .filter(|o| query.selectable_for.map_or(true, |kind| o.is_selectable_for(kind)))
            .map(|o| (orgs.fullcode(o.id).unwrap_or_default(), o))
            .collect();
        listed.sort_by(|a, b| a.0.cmp(&b.0));
        listed.into_iter().map(|(_, o)| o).collect()
    }

    /// Membership links matching `query`, ordered by entity then org.
    pub fn list_memberships(&self, query: &MembershipQuery) -> Vec<&MembershipLink> {
        let scope: Option<HashSet<OrgId>> = query.org.map(|org| {
            let mut scope = HashSet::from([org]);
            if query.include_descendants {
                scope.extend(self.orgs().descendants(org).iter().map(|o| o.id));
            }
            scope
        });
        self.memberships()
            .iter(query.kind)
            .filter(|l| scope.as_ref().map_or(true, |s| s.contains(&l.org)))
            .filter(|l| query.entity.map_or(true, |e| l.entity == e))
            .filter(|l| query.primary.map_or(true, |p| l.is_primary == p))
            .collect()
    }
}

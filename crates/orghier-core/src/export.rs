//! Analytics export projections
//!
//! Read-only flattening of the hierarchy for an external reporting system:
//! a `(code, display_name, parent_code)` row per org on the top exported
//! tiers, optionally with projects as the lowest tier, and a separate
//! `(entity_key, hierarchy_code)` mapping.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::level::LevelId;
use crate::membership::{EntityId, EntityKind};
use crate::organization::{Org, OrgId};
use crate::store::HierarchyStore;

/// What forms the lowest exported tier.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExportLeaf {
    /// Orgs all the way down
    #[default]
    Orgs,

    /// Projects, grouped under their primary org
    Projects,
}

/// Analytics export settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportConfig {
    /// Number of tiers to emit, including a project tier
    pub max_tiers: usize,

    /// Lowest tier kind
    pub leaf: ExportLeaf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            max_tiers: 3,
            leaf: ExportLeaf::Orgs,
        }
    }
}

/// A project as the export sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    /// Key the reporting system knows the project by
    pub key: String,

    /// Display title
    pub title: String,

    /// Project entity id in the membership ledger
    pub entity: EntityId,
}

/// One row of the flattened hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyRow {
    /// Fullcode of the org, or the project key
    pub code: String,

    /// Short name of the org, or the project title
    pub display_name: String,

    /// Code of the row one tier up, if any
    pub parent_code: Option<String>,
}

/// Levels included in an export, root first.
fn exported_levels(store: &HierarchyStore, config: &ExportConfig) -> Vec<LevelId> {
    let org_tiers = match config.leaf {
        ExportLeaf::Orgs => config.max_tiers,
        ExportLeaf::Projects => config.max_tiers.saturating_sub(1),
    };
    match store.levels().chain(false) {
        Ok(chain) => chain
            .filter(|l| l.export_flag)
            .take(org_tiers)
            .map(|l| l.id)
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Nearest org at or above `id` whose level is included.
fn nearest_included<'a>(
    store: &'a HierarchyStore,
    id: OrgId,
    included: &HashSet<LevelId>,
) -> Option<&'a Org> {
    let orgs = store.orgs();
    let org = orgs.get(id)?;
    std::iter::once(org)
        .chain(orgs.ancestors(id).into_iter().rev())
        .find(|o| included.contains(&o.level))
}

/// Flatten the top exported tiers into rows, tier by tier, orgs ordered by
/// code within a tier.
///
/// Parent codes point at the nearest ancestor on an included tier. With
/// [`ExportLeaf::Projects`] the last tier lists `projects` under their
/// primary org's nearest included ancestor; projects without a primary org
/// are left out.
pub fn hierarchy_rows(
    store: &HierarchyStore,
    config: &ExportConfig,
    projects: &[ProjectRecord],
) -> Vec<HierarchyRow> {
    let levels = exported_levels(store, config);
    let included: HashSet<LevelId> = levels.iter().copied().collect();
    let orgs = store.orgs();
    let mut rows = Vec::new();

    for level in &levels {
        for org in orgs.at_level(*level) {
            let parent_code = org
                .parent
                .and_then(|p| nearest_included(store, p, &included))
                .and_then(|p| orgs.fullcode(p.id));
            rows.push(HierarchyRow {
                code: orgs.fullcode(org.id).unwrap_or_else(|| org.code.clone()),
                display_name: org.shortname.clone(),
                parent_code,
            });
        }
    }

    if config.leaf == ExportLeaf::Projects && config.max_tiers > 0 {
        let mut project_rows: Vec<HierarchyRow> = projects
            .iter()
            .filter_map(|project| {
                let primary = store.primary(EntityKind::Project, project.entity)?;
                Some(HierarchyRow {
                    code: project.key.clone(),
                    display_name: project.title.clone(),
                    parent_code: nearest_included(store, primary.org, &included)
                        .and_then(|o| orgs.fullcode(o.id)),
                })
            })
            .collect();
        project_rows.sort_by(|a, b| a.code.cmp(&b.code));
        rows.extend(project_rows);
    }

    rows
}

/// Map entity keys to the fullcode of their primary org's nearest exported
/// ancestor. Entities without one are omitted.
pub fn entity_hierarchy_map(
    store: &HierarchyStore,
    kind: EntityKind,
    entities: &[(String, EntityId)],
) -> Vec<(String, String)> {
    entities
        .iter()
        .filter_map(|(key, entity)| {
            let primary = store.primary(kind, *entity)?;
            let exported = store.orgs().next_exported_ancestor(primary.org, store.levels())?;
            Some((key.clone(), store.orgs().fullcode(exported.id)?))
        })
        .collect()
}

/// Render rows as delimited text, one row per line, empty parent for roots.
pub fn render_delimited(rows: &[HierarchyRow], delimiter: char) -> String {
    rows.iter()
        .map(|row| {
            format!(
                "{}{d}{}{d}{}\n",
                row.code,
                row.display_name,
                row.parent_code.as_deref().unwrap_or(""),
                d = delimiter
            )
        })
        .collect()
}

/// Render rows as a JSON array.
pub fn render_json(rows: &[HierarchyRow]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(rows)
}

//! Bulk import from delimited text
//!
//! Three record formats, one record per line, fields split on a delimiter
//! (usually `|`). Blank lines and lines starting with `#` are skipped.
//!
//! - levels: `name|rank|parent_name[|export_flag]`
//! - orgs: `code|level_name|parent_fullcode|shortname|longname|selectable_user|selectable_project`
//! - directory entries: `fullcode|directory_string`
//!
//! Each input is applied as one transaction; the first bad line aborts the
//! whole import and the error names the line.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{HierarchyError, HierarchyResult};
use crate::level::LevelUpdate;
use crate::store::{HierarchyStore, OrgSpec};

/// Counts reported by an import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    /// New records
    pub created: usize,

    /// Existing records whose fields changed
    pub updated: usize,

    /// Existing records left as they were
    pub skipped: usize,
}

/// Non-comment records with their 1-based line numbers.
fn records(text: &str, delimiter: char) -> impl Iterator<Item = (usize, Vec<&str>)> {
    text.lines().enumerate().filter_map(move |(index, line)| {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        Some((index + 1, line.split(delimiter).map(str::trim).collect()))
    })
}

fn field<'a>(fields: &[&'a str], index: usize) -> Option<&'a str> {
    fields.get(index).copied().filter(|f| !f.is_empty())
}

fn required<'a>(
    fields: &[&'a str],
    index: usize,
    name: &str,
    line: usize,
) -> HierarchyResult<&'a str> {
    field(fields, index).ok_or_else(|| HierarchyError::Import {
        line,
        message: format!("missing {}", name),
    })
}

fn parse_flag(value: Option<&str>, name: &str, line: usize) -> HierarchyResult<Option<bool>> {
    let Some(value) = value else {
        return Ok(None);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "y" | "yes" => Ok(Some(true)),
        "0" | "f" | "false" | "n" | "no" => Ok(Some(false)),
        _ => Err(HierarchyError::Import {
            line,
            message: format!("{} '{}' is not a boolean", name, value),
        }),
    }
}

/// Attach the line number to errors raised while applying a record.
fn at_line<T>(line: usize, result: HierarchyResult<T>) -> HierarchyResult<T> {
    result.map_err(|err| match err {
        HierarchyError::Import { .. } => err,
        other => HierarchyError::Import {
            line,
            message: other.to_string(),
        },
    })
}

impl HierarchyStore {
    /// Import levels from `name|rank|parent_name[|export_flag]` records.
    ///
    /// An empty parent makes the level a root. New levels go through
    /// [`HierarchyStore::insert_level`], so they may be spliced anywhere.
    /// An existing level with the same parent has its rank and export flag
    /// updated; one with a different parent is an error.
    pub fn import_levels(&mut self, text: &str, delimiter: char) -> HierarchyResult<ImportSummary> {
        let summary = self.transaction("import_levels", |tx| {
            let mut summary = ImportSummary::default();
            for (line, fields) in records(text, delimiter) {
                let name = required(&fields, 0, "level name", line)?;
                let rank: i32 = required(&fields, 1, "rank", line)?
                    .parse()
                    .map_err(|_| HierarchyError::Import {
                        line,
                        message: format!("rank '{}' is not an integer", fields[1]),
                    })?;
                let parent = match field(&fields, 2) {
                    Some(parent) => Some(at_line(line, tx.level_by_name(parent))?),
                    None => None,
                };
                let export_flag = parse_flag(field(&fields, 3), "export flag", line)?;

                let existing = tx.levels().by_name(name).cloned();
                match existing {
                    Some(level) if level.parent != parent => {
                        return Err(HierarchyError::Import {
                            line,
                            message: format!("level '{}' already exists with another parent", name),
                        })
                    }
                    Some(level) => {
                        let mut update = LevelUpdate::default();
                        if level.rank != rank {
                            update = update.with_rank(rank);
                        }
                        if let Some(flag) = export_flag.filter(|f| *f != level.export_flag) {
                            update = update.with_export_flag(flag);
                        }
                        if update.rank.is_none() && update.export_flag.is_none() {
                            summary.skipped += 1;
                        } else {
                            at_line(line, tx.update_level(level.id, update))?;
                            summary.updated += 1;
                        }
                    }
                    None => {
                        at_line(
                            line,
                            tx.insert_level(name, rank, parent, export_flag.unwrap_or(true)),
                        )?;
                        summary.created += 1;
                    }
                }
            }
            Ok(summary)
        })?;
        info!(
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            "Imported levels"
        );
        Ok(summary)
    }

    /// Import orgs from
    /// `code|level_name|parent_fullcode|shortname|longname|selectable_user|selectable_project`
    /// records.
    ///
    /// Only `code` and `level_name` are required. Records are applied in
    /// order, so parents must precede their children.
    pub fn import_orgs(&mut self, text: &str, delimiter: char) -> HierarchyResult<ImportSummary> {
        let summary = self.transaction("import_orgs", |tx| {
            let mut summary = ImportSummary::default();
            for (line, fields) in records(text, delimiter) {
                let code = required(&fields, 0, "code", line)?;
                let level = at_line(line, tx.level_by_name(required(&fields, 1, "level", line)?))?;
                let mut spec = OrgSpec::new(code, level);
                if let Some(parent) = field(&fields, 2) {
                    spec = spec.with_parent(at_line(line, tx.org_by_fullcode(parent))?.id);
                }
                spec.shortname = field(&fields, 3).map(str::to_string);
                spec.longname = field(&fields, 4).map(str::to_string);
                spec.selectable_for_user = parse_flag(field(&fields, 5), "selectable_user", line)?;
                spec.selectable_for_project =
                    parse_flag(field(&fields, 6), "selectable_project", line)?;

                let outcome = at_line(line, tx.insert_node(spec))?;
                if outcome.created {
                    summary.created += 1;
                } else if outcome.updated {
                    summary.updated += 1;
                } else {
                    summary.skipped += 1;
                }
            }
            Ok(summary)
        })?;
        info!(
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            "Imported orgs"
        );
        Ok(summary)
    }

    /// Import directory entries from `fullcode|directory_string` records.
    ///
    /// The directory string is everything after the first delimiter, so it
    /// may itself contain the delimiter.
    pub fn import_directory_entries(
        &mut self,
        text: &str,
        delimiter: char,
    ) -> HierarchyResult<ImportSummary> {
        let summary = self.transaction("import_directory_entries", |tx| {
            let mut summary = ImportSummary::default();
            for (line, fields) in records(text, delimiter) {
                let fullcode = required(&fields, 0, "fullcode", line)?;
                let directory_string = fields[1..].join(&delimiter.to_string());
                if directory_string.is_empty() {
                    return Err(HierarchyError::Import {
                        line,
                        message: "missing directory string".to_string(),
                    });
                }
                let org = at_line(line, tx.org_by_fullcode(fullcode))?.id;
                match tx.directory().get(&directory_string).map(|e| e.org) {
                    Some(existing) if existing == org => summary.skipped += 1,
                    Some(_) => {
                        at_line(line, tx.add_directory_entry(&directory_string, org))?;
                        summary.updated += 1;
                    }
                    None => {
                        at_line(line, tx.add_directory_entry(&directory_string, org))?;
                        summary.created += 1;
                    }
                }
            }
            Ok(summary)
        })?;
        info!(
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            "Imported directory entries"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEVELS: &str = "\
# name|rank|parent|export
University|40||true
College|30|University|true

Department|20|College
";

    const ORGS: &str = "\
UMD|University||UMCP|University of Maryland|false|false
CMNS|College|UMD|CMNS|College of Computer, Mathematical, and Natural Sciences
PHYS|Department|UMD-CMNS|Physics|Physics Department|yes|yes
ASTR|Department|UMD-CMNS|Astronomy
";

    fn imported() -> HierarchyStore {
        let mut store = HierarchyStore::new();
        store.import_levels(LEVELS, '|').unwrap();
        store.import_orgs(ORGS, '|').unwrap();
        store
    }

    #[test]
    fn test_import_levels() {
        let mut store = HierarchyStore::new();
        let summary = store.import_levels(LEVELS, '|').unwrap();
        assert_eq!(summary.created, 3);
        let names: Vec<&str> = store
            .levels()
            .chain(true)
            .unwrap()
            .map(|l| l.name.as_str())
            .collect();
        assert_eq!(names, vec!["University", "College", "Department"]);

        let summary = store.import_levels(LEVELS, '|').unwrap();
        assert_eq!(summary.skipped, 3);

        // A middle tier spliced in by a later file
        let summary = store.import_levels("Campus|35|University|false\n", '|').unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(store.levels().len(), 4);
    }

    #[test]
    fn test_import_orgs() {
        let store = imported();
        let umd = store.org_by_fullcode("UMD").unwrap();
        assert!(!umd.selectable_for_user);
        assert_eq!(umd.longname, "University of Maryland");
        let astr = store.org_by_fullcode("UMD-CMNS-ASTR").unwrap();
        assert_eq!(astr.shortname, "Astronomy");
        assert_eq!(astr.longname, "Astronomy");
        assert!(astr.selectable_for_project);
        assert!(store.audit().is_ok());
    }

    #[test]
    fn test_reimport_orgs_reports_updates() {
        let mut store = imported();
        let summary = store
            .import_orgs("UMD|University||UMCP|UMD College Park\nCMNS|College|UMD\n", '|')
            .unwrap();
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.created, 0);
    }

    #[test]
    fn test_import_errors_name_the_line_and_roll_back() {
        let mut store = imported();
        let before = store.orgs().len();
        let err = store
            .import_orgs("ENGR|College|UMD\n# comment\nENAE|Department|UMD-NOPE\n", '|')
            .unwrap_err();
        assert!(matches!(err, HierarchyError::Import { line: 3, .. }));
        assert_eq!(store.orgs().len(), before);

        let err = store.import_levels("Lab|ten|Department\n", '|').unwrap_err();
        assert!(matches!(err, HierarchyError::Import { line: 1, .. }));

        let err = store.import_orgs("BAD-CODE|Department|UMD-CMNS\n", '|').unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_import_directory_entries() {
        let mut store = imported();
        let text = "UMD-CMNS-PHYS|Physics Dept\nUMD-CMNS-ASTR|Astro|nomy\n";
        let summary = store.import_directory_entries(text, '|').unwrap();
        assert_eq!(summary.created, 2);
        let astr = store.org_by_fullcode("UMD-CMNS-ASTR").unwrap().id;
        assert_eq!(store.directory().get("Astro|nomy").unwrap().org, astr);

        let summary = store
            .import_directory_entries("UMD-CMNS-ASTR|Physics Dept\n", '|')
            .unwrap();
        assert_eq!(summary.updated, 1);
        assert_eq!(store.directory().get("Physics Dept").unwrap().org, astr);
    }
}

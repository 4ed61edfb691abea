//! Hierarchy configuration.
//!
//! Configuration is loaded from environment variables with defaults that
//! keep every audit enabled. Deployments mainly tune which directory
//! attributes carry affiliations and how many tiers the analytics export
//! covers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::directory::SyncOptions;
use crate::export::{ExportConfig, ExportLeaf};
use crate::validate::OrgValidationOptions;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Error message.
        message: String,
    },
}

/// Complete hierarchy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HierarchyConfig {
    /// Audit policy
    pub validation: ValidationPolicy,

    /// Directory synchronization settings
    pub directory: DirectorySyncConfig,

    /// Analytics export settings
    pub export: ExportConfig,
}

/// When and how strictly the hierarchy is audited.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationPolicy {
    /// Only leaf-level orgs may be selectable for users
    pub only_leaves_selectable_for_user: bool,

    /// Only leaf-level orgs may be selectable for projects
    pub only_leaves_selectable_for_project: bool,

    /// Include the membership ledger in audits
    pub check_memberships: bool,

    /// Audit at every outermost transaction commit, rolling back on failure
    pub audit_on_commit: bool,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            only_leaves_selectable_for_user: false,
            only_leaves_selectable_for_project: false,
            check_memberships: true,
            audit_on_commit: true,
        }
    }
}

impl ValidationPolicy {
    /// Options for the org validator.
    pub fn org_options(&self) -> OrgValidationOptions {
        OrgValidationOptions {
            only_leaves_selectable_for_user: self.only_leaves_selectable_for_user,
            only_leaves_selectable_for_project: self.only_leaves_selectable_for_project,
            check_memberships: self.check_memberships,
        }
    }
}

/// Per-deployment directory synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectorySyncConfig {
    /// Directory attribute carrying the primary affiliation
    pub primary_attribute_name: String,

    /// Directory attribute carrying the other affiliations
    pub secondary_attribute_name: String,

    /// Remove memberships the directory no longer reports
    pub delete_missing: bool,

    /// Materialize unmatched strings as placeholder orgs
    pub create_placeholders: bool,

    /// Keep orgs that are not selectable for the entity kind
    pub include_nonselectable: bool,
}

impl Default for DirectorySyncConfig {
    fn default() -> Self {
        Self {
            primary_attribute_name: "primaryOrganization".to_string(),
            secondary_attribute_name: "organization".to_string(),
            delete_missing: false,
            create_placeholders: true,
            include_nonselectable: false,
        }
    }
}

impl DirectorySyncConfig {
    /// Build `sync_memberships` options from these settings.
    pub fn sync_options(&self, first_is_primary: bool) -> SyncOptions {
        SyncOptions {
            delete: self.delete_missing,
            create_unknown: self.create_placeholders,
            include_nonselectable: self.include_nonselectable,
            first_is_primary,
        }
    }
}

impl HierarchyConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `ORGHIER_ONLY_LEAVES_SELECTABLE_FOR_USER` (default: false)
    /// - `ORGHIER_ONLY_LEAVES_SELECTABLE_FOR_PROJECT` (default: false)
    /// - `ORGHIER_CHECK_MEMBERSHIPS` (default: true)
    /// - `ORGHIER_AUDIT_ON_COMMIT` (default: true)
    /// - `ORGHIER_PRIMARY_ATTRIBUTE` (default: primaryOrganization)
    /// - `ORGHIER_SECONDARY_ATTRIBUTE` (default: organization)
    /// - `ORGHIER_DELETE_MISSING` (default: false)
    /// - `ORGHIER_CREATE_PLACEHOLDERS` (default: true)
    /// - `ORGHIER_INCLUDE_NONSELECTABLE` (default: false)
    /// - `ORGHIER_EXPORT_MAX_TIERS` (default: 3)
    /// - `ORGHIER_EXPORT_LEAF`: `orgs` or `projects` (default: orgs)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default = Self::default();
        let flag = |key: &str, fallback: bool| -> Result<bool, ConfigError> {
            lookup(key).map_or(Ok(fallback), |value| parse_bool(key, &value))
        };

        let validation = ValidationPolicy {
            only_leaves_selectable_for_user: flag(
                "ORGHIER_ONLY_LEAVES_SELECTABLE_FOR_USER",
                default.validation.only_leaves_selectable_for_user,
            )?,
            only_leaves_selectable_for_project: flag(
                "ORGHIER_ONLY_LEAVES_SELECTABLE_FOR_PROJECT",
                default.validation.only_leaves_selectable_for_project,
            )?,
            check_memberships: flag(
                "ORGHIER_CHECK_MEMBERSHIPS",
                default.validation.check_memberships,
            )?,
            audit_on_commit: flag("ORGHIER_AUDIT_ON_COMMIT", default.validation.audit_on_commit)?,
        };

        let directory = DirectorySyncConfig {
            primary_attribute_name: lookup("ORGHIER_PRIMARY_ATTRIBUTE")
                .unwrap_or(default.directory.primary_attribute_name),
            secondary_attribute_name: lookup("ORGHIER_SECONDARY_ATTRIBUTE")
                .unwrap_or(default.directory.secondary_attribute_name),
            delete_missing: flag("ORGHIER_DELETE_MISSING", default.directory.delete_missing)?,
            create_placeholders: flag(
                "ORGHIER_CREATE_PLACEHOLDERS",
                default.directory.create_placeholders,
            )?,
            include_nonselectable: flag(
                "ORGHIER_INCLUDE_NONSELECTABLE",
                default.directory.include_nonselectable,
            )?,
        };

        let max_tiers = match lookup("ORGHIER_EXPORT_MAX_TIERS") {
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
                key: "ORGHIER_EXPORT_MAX_TIERS".to_string(),
                message: format!("'{}' is not a non-negative integer", value),
            })?,
            None => default.export.max_tiers,
        };
        let leaf = match lookup("ORGHIER_EXPORT_LEAF") {
            Some(value) => value.parse().map_err(|message| ConfigError::InvalidValue {
                key: "ORGHIER_EXPORT_LEAF".to_string(),
                message,
            })?,
            None => default.export.leaf,
        };

        Ok(Self {
            validation,
            directory,
            export: ExportConfig { max_tiers, leaf },
        })
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{}' is not a boolean", value),
        }),
    }
}

impl std::str::FromStr for ExportLeaf {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "orgs" | "organizations" => Ok(ExportLeaf::Orgs),
            "projects" => Ok(ExportLeaf::Projects),
            other => Err(format!("unknown export leaf '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = HierarchyConfig::default();
        assert!(config.validation.audit_on_commit);
        assert!(config.validation.check_memberships);
        assert!(!config.directory.delete_missing);
        assert_eq!(config.directory.primary_attribute_name, "primaryOrganization");
        assert_eq!(config.export.max_tiers, 3);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = HierarchyConfig::from_lookup(lookup(&[
            ("ORGHIER_PRIMARY_ATTRIBUTE", "exPrimaryDepartment"),
            ("ORGHIER_SECONDARY_ATTRIBUTE", "exDepartment"),
            ("ORGHIER_DELETE_MISSING", "yes"),
            ("ORGHIER_AUDIT_ON_COMMIT", "0"),
            ("ORGHIER_EXPORT_MAX_TIERS", "2"),
            ("ORGHIER_EXPORT_LEAF", "projects"),
        ]))
        .unwrap();
        assert_eq!(config.directory.primary_attribute_name, "exPrimaryDepartment");
        assert_eq!(config.directory.secondary_attribute_name, "exDepartment");
        assert!(config.directory.delete_missing);
        assert!(!config.validation.audit_on_commit);
        assert_eq!(config.export.max_tiers, 2);
        assert_eq!(config.export.leaf, ExportLeaf::Projects);
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        let err = HierarchyConfig::from_lookup(lookup(&[("ORGHIER_DELETE_MISSING", "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains("ORGHIER_DELETE_MISSING"));

        let err = HierarchyConfig::from_lookup(lookup(&[("ORGHIER_EXPORT_MAX_TIERS", "-1")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "ORGHIER_EXPORT_MAX_TIERS"));
    }

    #[test]
    fn test_sync_options() {
        let config = DirectorySyncConfig::default();
        let options = config.sync_options(true);
        assert!(options.first_is_primary);
        assert!(options.create_unknown);
        assert!(!options.delete);
    }
}

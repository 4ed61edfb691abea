//! Error types for hierarchy operations
//!
//! This module defines every error a structural mutation, membership update,
//! directory lookup or bulk import can surface to the administrative layer.
//! Each variant carries enough context (ids, names, offending values) to
//! render a human message.

use thiserror::Error;
use uuid::Uuid;

use crate::validate::HierarchyInvariantError;

/// Hierarchy error types.
#[derive(Debug, Error)]
pub enum HierarchyError {
    /// Tier insertion or edit would break strict rank ordering
    #[error("Invalid rank {rank} for level '{level}': {reason}")]
    InvalidRank {
        /// Name of the level being inserted or edited
        level: String,
        /// Offending rank
        rank: i32,
        /// What ordering constraint was violated
        reason: String,
    },

    /// An org's parent does not sit on its level's parent tier
    #[error("Structural mismatch for org '{org}': {reason}")]
    StructuralMismatch {
        /// Code (or fullcode) of the org
        org: String,
        /// Description of the mismatch
        reason: String,
    },

    /// The level registry is not a single linear chain
    #[error("Broken level chain: {0}")]
    BrokenChain(String),

    /// Deletion blocked by a live reference
    #[error("Cannot delete {entity} {id}: {reason}")]
    ReferentialIntegrity {
        /// Kind of record being deleted ("level", "org")
        entity: &'static str,
        /// Id of the record
        id: Uuid,
        /// What still references it
        reason: String,
    },

    /// Name collision inside a uniqueness scope
    #[error("{field} '{value}' is already used within {scope}")]
    UniquenessConflict {
        /// Field that collided (code, shortname, longname, name, ...)
        field: &'static str,
        /// Colliding value
        value: String,
        /// Human description of the scope
        scope: String,
    },

    /// A second primary membership was requested without demoting the first
    #[error("Entity {entity} already has a primary membership in org {existing}; cannot make {requested} primary")]
    PrimaryConflict {
        /// Entity id
        entity: Uuid,
        /// Org holding the current primary link
        existing: Uuid,
        /// Org that was requested as primary
        requested: Uuid,
    },

    /// Aggregate validator failure
    #[error(transparent)]
    HierarchyInvariant(#[from] HierarchyInvariantError),

    /// Unknown level, org or directory reference
    #[error("{entity} not found: {key}")]
    NotFound {
        /// Kind of record looked up
        entity: &'static str,
        /// Key used for the lookup
        key: String,
    },

    /// Org code is empty or contains the fullcode separator
    #[error("Invalid org code '{code}': {reason}")]
    InvalidCode {
        /// Offending code
        code: String,
        /// Why it was rejected
        reason: String,
    },

    /// Malformed delimited input
    #[error("Import error at line {line}: {message}")]
    Import {
        /// 1-based line number in the input
        line: usize,
        /// Description of the problem
        message: String,
    },
}

/// Result type for hierarchy operations.
pub type HierarchyResult<T> = Result<T, HierarchyError>;

impl HierarchyError {
    pub(crate) fn level_not_found(key: impl ToString) -> Self {
        HierarchyError::NotFound {
            entity: "level",
            key: key.to_string(),
        }
    }

    pub(crate) fn org_not_found(key: impl ToString) -> Self {
        HierarchyError::NotFound {
            entity: "org",
            key: key.to_string(),
        }
    }

    /// Check if this error indicates corrupted state rather than a bad request.
    ///
    /// Invariant and chain failures mean the store itself is inconsistent;
    /// everything else is a caller mistake the store rejected cleanly.
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            HierarchyError::HierarchyInvariant(_) | HierarchyError::BrokenChain(_)
        )
    }

    /// Get error code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            HierarchyError::InvalidRank { .. } => "INVALID_RANK",
            HierarchyError::StructuralMismatch { .. } => "STRUCTURAL_MISMATCH",
            HierarchyError::BrokenChain(_) => "BROKEN_CHAIN",
            HierarchyError::ReferentialIntegrity { .. } => "REFERENTIAL_INTEGRITY",
            HierarchyError::UniquenessConflict { .. } => "UNIQUENESS_CONFLICT",
            HierarchyError::PrimaryConflict { .. } => "PRIMARY_CONFLICT",
            HierarchyError::HierarchyInvariant(_) => "HIERARCHY_INVARIANT",
            HierarchyError::NotFound { .. } => "NOT_FOUND",
            HierarchyError::InvalidCode { .. } => "INVALID_CODE",
            HierarchyError::Import { .. } => "IMPORT_ERROR",
        }
    }
}

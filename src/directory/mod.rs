//! # Directory Layer
//!
//! Entities and the error taxonomy shared by the directory gateway and the
//! cache on top of it. The persistent store itself lives behind the traits
//! in [`gateway`]; this module only fixes the shapes the two sides agree on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Directory error kinds
///
/// The coherence layer branches on the first three; anything else a backend
/// produces is folded into [`DirectoryError::Storage`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    /// The requested record does not exist.
    #[error("record not found")]
    NotFound,

    /// A unique-key constraint rejected the write.
    #[error("unique key violation: {0}")]
    UniqueKey(String),

    /// A foreign-key constraint rejected the write.
    #[error("foreign key violation: {0}")]
    ForeignKey(String),

    /// Any other storage failure.
    #[error("storage fault: {0}")]
    Storage(String),
}

impl DirectoryError {
    /// Whether this error reports plain absence rather than a fault.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DirectoryError::NotFound)
    }
}

/// Result type for directory operations
pub type Result<T> = std::result::Result<T, DirectoryError>;

/// Id value meaning "unknown or absent".
///
/// Directory backends must assign positive ids only; `0` never names a real
/// user or group.
pub const UNKNOWN_ID: i64 = 0;

/// A user row: unique positive id, unique non-empty name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Positive directory-assigned id.
    pub id: i64,
    /// Unique name within the user namespace.
    pub name: String,
}

/// A group row. Same shape as [`User`], disjoint namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Positive directory-assigned id.
    pub id: i64,
    /// Unique name within the group namespace.
    pub name: String,
}

// Module declarations
pub mod gateway;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

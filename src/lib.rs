//! # dircache - Coherent users-and-groups directory cache
//!
//! An in-memory, bounded, time-expiring cache that mirrors and accelerates
//! a persistent users-and-groups directory.
//!
//! ## Architecture
//!
//! - `directory`: entities, error taxonomy and the gateway traits the cache
//!   is injected with; a mock in-memory directory for tests and development
//! - `cache`: the six mutually-coherent index caches, the read-through
//!   loaders, the eviction propagation rules and the public operation set
//!
//! The directory itself is an external collaborator reached through the
//! `directory::gateway` traits; the cache is never a source of truth. A miss
//! the directory cannot satisfy is a not-found, not an error.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Cache layer - six index caches plus orchestrated operations
pub mod cache;

// Directory entities, errors and gateway traits
pub mod directory;

// Re-export commonly used types
pub use cache::{CacheConfig, CacheStats, DirectoryCache};
pub use directory::gateway::{GroupAccess, MembershipAccess, UserAccess};
pub use directory::{DirectoryError, Group, User, UNKNOWN_ID};

/// Re-export version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

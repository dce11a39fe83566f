//! # Directory Gateway
//!
//! Narrow capability traits over the persistent users-and-groups store.
//! The cache is injected with `Arc<dyn …>` handles to these three traits
//! and never sees the backend's connection, SQL or transaction machinery.
//!
//! Each call runs as one unit of work against the store. Lookups report
//! absence as `Ok(None)`; mutations report absence as
//! [`DirectoryError::NotFound`](crate::directory::DirectoryError::NotFound)
//! and classify constraint failures as `UniqueKey` / `ForeignKey` so the
//! coherence layer can branch on them.

use async_trait::async_trait;

use super::{Group, Result, User};

/// Access to the users table.
#[async_trait]
pub trait UserAccess: Send + Sync {
    /// Look up a user by name. `Ok(None)` when no such user exists.
    async fn get_user_by_name(&self, name: &str) -> Result<Option<User>>;

    /// Look up a user by id. `Ok(None)` when no such user exists.
    async fn get_user_by_id(&self, id: i64) -> Result<Option<User>>;

    /// Create a user and return the stored row with its new id.
    ///
    /// Fails with `UniqueKey` when the name is already taken.
    async fn add_user(&self, name: &str) -> Result<User>;

    /// Delete a user row (and its membership rows) by id.
    ///
    /// Fails with `NotFound` when the id names no user.
    async fn remove_user(&self, id: i64) -> Result<()>;
}

/// Access to the groups table.
#[async_trait]
pub trait GroupAccess: Send + Sync {
    /// Look up a group by name. `Ok(None)` when no such group exists.
    async fn get_group_by_name(&self, name: &str) -> Result<Option<Group>>;

    /// Look up a group by id. `Ok(None)` when no such group exists.
    async fn get_group_by_id(&self, id: i64) -> Result<Option<Group>>;

    /// Create a group and return the stored row with its new id.
    ///
    /// Fails with `UniqueKey` when the name is already taken.
    async fn add_group(&self, name: &str) -> Result<Group>;

    /// Delete a group row (and its membership rows) by id.
    ///
    /// Fails with `NotFound` when the id names no group.
    async fn remove_group(&self, id: i64) -> Result<()>;
}

/// Access to the membership relation.
#[async_trait]
pub trait MembershipAccess: Send + Sync {
    /// Insert the membership rows `(user_id, g)` for every `g` in
    /// `group_ids`, as a single unit of work.
    ///
    /// Fails with `ForeignKey` when the user or one of the groups no longer
    /// exists, and with `UniqueKey` when one of the rows was already
    /// present.
    async fn add_user_to_groups(&self, user_id: i64, group_ids: &[i64]) -> Result<()>;

    /// Delete a single membership row.
    ///
    /// Fails with `NotFound` when the row does not exist.
    async fn remove_user_from_group(&self, user_id: i64, group_id: i64) -> Result<()>;

    /// Return the groups the user belongs to, in storage order.
    ///
    /// Implementations must begin a transaction when none is active on the
    /// calling context and commit it on success; an already-active
    /// transaction is joined and left open for its owner.
    async fn get_groups_for_user(&self, user_id: i64) -> Result<Vec<Group>>;
}

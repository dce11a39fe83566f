//! # Cache Layer
//!
//! Six inter-dependent index caches over a users-and-groups directory,
//! kept mutually consistent as entries are evicted by size or time, as
//! directory mutations happen and as concurrent readers load missing
//! entries.
//!
//! [`DirectoryCache`] is the public surface. Reads go through per-key
//! single-flight loaders that back-fill sibling indexes; writes follow the
//! order "directory write, then cache update" within each operation. The
//! eviction propagation rules live in [`indexes`].
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use dircache::directory::mock::MemoryDirectory;
//! use dircache::{CacheConfig, DirectoryCache};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> dircache::directory::Result<()> {
//! let store = Arc::new(MemoryDirectory::new());
//! let cache = DirectoryCache::new(
//!     CacheConfig::default(),
//!     Some(store.clone()),
//!     Some(store.clone()),
//!     Some(store),
//! );
//!
//! let id = cache.add_user("alice").await?;
//! assert_eq!(cache.get_user_id("alice").await?, id);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::directory::gateway::{GroupAccess, MembershipAccess, UserAccess};
use crate::directory::{DirectoryError, Result, UNKNOWN_ID};

mod indexes;

use indexes::Indexes;

/// Tuning knobs shared by all six index caches.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Write-expiry applied to every entry. Must be positive.
    pub eviction_ttl: Duration,

    /// Per-index entry bound. Must be positive.
    pub lru_max: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            eviction_ttl: Duration::from_secs(300),
            lru_max: 10_000,
        }
    }
}

/// Per-index entry counts, snapshot via [`DirectoryCache::stats`].
///
/// Counts are eventually consistent; call
/// [`DirectoryCache::run_pending_tasks`] first for exact numbers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries in the user name → id index.
    pub user_ids: u64,
    /// Entries in the user id → name index.
    pub user_names: u64,
    /// Entries in the group name → id index.
    pub group_ids: u64,
    /// Entries in the group id → name index.
    pub group_names: u64,
    /// Entries in the user name → group names index.
    pub user_groups: u64,
    /// Entries in the group name → user names index.
    pub group_users: u64,
}

struct Gateway {
    users: Arc<dyn UserAccess>,
    groups: Arc<dyn GroupAccess>,
    memberships: Arc<dyn MembershipAccess>,
}

struct Inner {
    gateway: Gateway,
    indexes: Indexes,
}

/// The coherent users-and-groups cache.
///
/// Construct with the three directory adapters; if any is absent the cache
/// runs in not-configured mode, where every operation returns its sentinel
/// (`0`, `None` or `()`) without touching caches or directory.
pub struct DirectoryCache {
    config: CacheConfig,
    inner: Option<Inner>,
}

impl DirectoryCache {
    /// Build the cache over the given directory adapters.
    pub fn new(
        config: CacheConfig,
        users: Option<Arc<dyn UserAccess>>,
        groups: Option<Arc<dyn GroupAccess>>,
        memberships: Option<Arc<dyn MembershipAccess>>,
    ) -> Self {
        let inner = match (users, groups, memberships) {
            (Some(users), Some(groups), Some(memberships)) => Some(Inner {
                gateway: Gateway {
                    users,
                    groups,
                    memberships,
                },
                indexes: Indexes::build(&config),
            }),
            _ => {
                warn!("directory access not configured; all operations degrade to sentinels");
                None
            }
        };
        Self { config, inner }
    }

    /// Whether all three directory adapters were supplied.
    pub fn is_configured(&self) -> bool {
        self.inner.is_some()
    }

    /// The configuration this cache was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Create a user in the directory and prime caches (1) and (2).
    /// Returns the new id, or [`UNKNOWN_ID`] when not configured.
    pub async fn add_user(&self, name: &str) -> Result<i64> {
        let Some(inner) = self.inner.as_ref() else {
            return Ok(UNKNOWN_ID);
        };
        let user = inner.gateway.users.add_user(name).await?;
        inner.indexes.insert_user(&user).await;
        Ok(user.id)
    }

    /// Create a group in the directory and prime caches (3) and (4).
    pub async fn add_group(&self, name: &str) -> Result<i64> {
        let Some(inner) = self.inner.as_ref() else {
            return Ok(UNKNOWN_ID);
        };
        let group = inner.gateway.groups.add_group(name).await?;
        inner.indexes.insert_group(&group).await;
        Ok(group.id)
    }

    /// Delete a user from the directory and drop every cache entry derived
    /// from it. Unknown names are a no-op.
    pub async fn remove_user(&self, name: &str) -> Result<()> {
        let Some(inner) = self.inner.as_ref() else {
            return Ok(());
        };
        let id = match inner.user_id(name).await {
            Ok(id) => id,
            Err(DirectoryError::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        };
        match inner.gateway.users.remove_user(id).await {
            Ok(()) | Err(DirectoryError::NotFound) => {}
            Err(err) => return Err(err),
        }
        inner.indexes.purge_user(name).await;
        Ok(())
    }

    /// Delete a group from the directory and drop every cache entry derived
    /// from it. Unknown names are a no-op.
    pub async fn remove_group(&self, name: &str) -> Result<()> {
        let Some(inner) = self.inner.as_ref() else {
            return Ok(());
        };
        let id = match inner.group_id(name).await {
            Ok(id) => id,
            Err(DirectoryError::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        };
        match inner.gateway.groups.remove_group(id).await {
            Ok(()) | Err(DirectoryError::NotFound) => {}
            Err(err) => return Err(err),
        }
        inner.indexes.purge_group(name).await;
        Ok(())
    }

    /// Cache-only variant of [`remove_user`](Self::remove_user): same
    /// invalidations, no directory call. Repair path for upstream
    /// notifications ("user X was removed elsewhere").
    pub async fn remove_user_from_cache(&self, name: &str) {
        if let Some(inner) = self.inner.as_ref() {
            inner.indexes.purge_user(name).await;
        }
    }

    /// Cache-only variant of [`remove_group`](Self::remove_group).
    pub async fn remove_group_from_cache(&self, name: &str) {
        if let Some(inner) = self.inner.as_ref() {
            inner.indexes.purge_group(name).await;
        }
    }

    /// Read-through lookup of a user's id. Returns [`UNKNOWN_ID`] when the
    /// directory has no such user.
    pub async fn get_user_id(&self, name: &str) -> Result<i64> {
        let Some(inner) = self.inner.as_ref() else {
            return Ok(UNKNOWN_ID);
        };
        sentinel_id(inner.user_id(name).await)
    }

    /// Read-through lookup of a group's id.
    pub async fn get_group_id(&self, name: &str) -> Result<i64> {
        let Some(inner) = self.inner.as_ref() else {
            return Ok(UNKNOWN_ID);
        };
        sentinel_id(inner.group_id(name).await)
    }

    /// Read-through lookup of a user's name. `None` when the directory has
    /// no such id.
    pub async fn get_user_name(&self, id: i64) -> Result<Option<String>> {
        let Some(inner) = self.inner.as_ref() else {
            return Ok(None);
        };
        sentinel_name(inner.user_name(id).await)
    }

    /// Read-through lookup of a group's name.
    pub async fn get_group_name(&self, id: i64) -> Result<Option<String>> {
        let Some(inner) = self.inner.as_ref() else {
            return Ok(None);
        };
        sentinel_name(inner.group_name(id).await)
    }

    /// Read-through lookup of the groups a user belongs to, in directory
    /// order. `None` when the user is unknown or belongs to no group.
    pub async fn get_groups(&self, user: &str) -> Result<Option<Vec<String>>> {
        let Some(inner) = self.inner.as_ref() else {
            return Ok(None);
        };
        match inner.user_groups(user).await {
            Ok(groups) => Ok(Some(groups)),
            Err(DirectoryError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Grant `user` membership of every group in `groups`, creating user
    /// and groups on demand.
    ///
    /// Empty names in `groups` are skipped. If cache (5) already lists the
    /// user with a superset of `groups` the operation returns without a
    /// directory write, even when that cached list is stale-short; callers
    /// treat the group set as growing.
    ///
    /// A unique-key violation from the membership write is swallowed (the
    /// desired state already holds). A foreign-key violation invalidates
    /// the user and every named group, then retries the whole operation
    /// once; a second failure surfaces as a storage fault.
    pub async fn add_user_groups(&self, user: &str, groups: &[&str]) -> Result<()> {
        let Some(inner) = self.inner.as_ref() else {
            return Ok(());
        };
        let wanted: Vec<String> = groups
            .iter()
            .filter(|group| !group.is_empty())
            .map(|group| (*group).to_string())
            .collect();

        if let Some(cached) = inner.indexes.user_groups.get(user).await {
            if wanted.iter().all(|group| cached.contains(group)) {
                debug!(user, "membership already cached; skipping directory write");
                return Ok(());
            }
        }

        match inner.add_user_groups(user, &wanted).await {
            Err(DirectoryError::ForeignKey(detail)) => Err(DirectoryError::Storage(format!(
                "membership write kept failing after cache invalidation: {detail}"
            ))),
            other => other,
        }
    }

    /// Revoke one membership. Unknown user, group or row are no-ops.
    pub async fn remove_user_from_group(&self, user: &str, group: &str) -> Result<()> {
        let Some(inner) = self.inner.as_ref() else {
            return Ok(());
        };
        let user_id = match inner.user_id(user).await {
            Ok(id) => id,
            Err(DirectoryError::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        };
        let group_id = match inner.group_id(group).await {
            Ok(id) => id,
            Err(DirectoryError::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        };
        match inner
            .gateway
            .memberships
            .remove_user_from_group(user_id, group_id)
            .await
        {
            Ok(()) | Err(DirectoryError::NotFound) => {}
            Err(err) => return Err(err),
        }
        inner.indexes.remove_membership(user, group).await;
        Ok(())
    }

    /// [`add_user_groups`](Self::add_user_groups) with a `cache_only`
    /// switch. When `cache_only` is set no directory call occurs and only
    /// the cache merge runs, letting an outside notification path repair
    /// local caches without re-issuing the write.
    pub async fn add_user_group_tx(
        &self,
        user: &str,
        groups: &[&str],
        cache_only: bool,
    ) -> Result<()> {
        if !cache_only {
            return self.add_user_groups(user, groups).await;
        }
        if let Some(inner) = self.inner.as_ref() {
            let wanted: Vec<String> = groups
                .iter()
                .filter(|group| !group.is_empty())
                .map(|group| (*group).to_string())
                .collect();
            inner.indexes.apply_membership(user, &wanted).await;
        }
        Ok(())
    }

    /// [`remove_user_from_group`](Self::remove_user_from_group) with a
    /// `cache_only` switch.
    pub async fn remove_user_group_tx(
        &self,
        user: &str,
        group: &str,
        cache_only: bool,
    ) -> Result<()> {
        if !cache_only {
            return self.remove_user_from_group(user, group).await;
        }
        if let Some(inner) = self.inner.as_ref() {
            inner.indexes.remove_membership(user, group).await;
        }
        Ok(())
    }

    /// Invalidate all six caches entry by entry, so every removal hook
    /// fires. The listener cascade converges because listeners only
    /// invalidate, never insert.
    pub async fn clear(&self) {
        if let Some(inner) = self.inner.as_ref() {
            inner.indexes.clear().await;
        }
    }

    /// Cached user id, without consulting the directory. [`UNKNOWN_ID`]
    /// when absent.
    pub async fn get_user_id_from_cache(&self, name: &str) -> i64 {
        match self.inner.as_ref() {
            Some(inner) => inner
                .indexes
                .user_ids
                .get(name)
                .await
                .unwrap_or(UNKNOWN_ID),
            None => UNKNOWN_ID,
        }
    }

    /// Cached group id, without consulting the directory.
    pub async fn get_group_id_from_cache(&self, name: &str) -> i64 {
        match self.inner.as_ref() {
            Some(inner) => inner
                .indexes
                .group_ids
                .get(name)
                .await
                .unwrap_or(UNKNOWN_ID),
            None => UNKNOWN_ID,
        }
    }

    /// Cached user name, without consulting the directory.
    pub async fn get_user_name_from_cache(&self, id: i64) -> Option<String> {
        match self.inner.as_ref() {
            Some(inner) => inner.indexes.user_names.get(&id).await,
            None => None,
        }
    }

    /// Cached group name, without consulting the directory.
    pub async fn get_group_name_from_cache(&self, id: i64) -> Option<String> {
        match self.inner.as_ref() {
            Some(inner) => inner.indexes.group_names.get(&id).await,
            None => None,
        }
    }

    /// Cached membership list, without consulting the directory.
    pub async fn get_groups_from_cache(&self, user: &str) -> Option<Vec<String>> {
        match self.inner.as_ref() {
            Some(inner) => inner.indexes.user_groups.get(user).await,
            None => None,
        }
    }

    /// Cached reverse-index list. `None` means "not materialized", never
    /// "not found in the directory".
    pub async fn get_group_users_from_cache(&self, group: &str) -> Option<Vec<String>> {
        match self.inner.as_ref() {
            Some(inner) => inner.indexes.group_users.get(group).await,
            None => None,
        }
    }

    /// Per-index entry counts.
    pub fn stats(&self) -> CacheStats {
        match self.inner.as_ref() {
            Some(inner) => CacheStats {
                user_ids: inner.indexes.user_ids.entry_count(),
                user_names: inner.indexes.user_names.entry_count(),
                group_ids: inner.indexes.group_ids.entry_count(),
                group_names: inner.indexes.group_names.entry_count(),
                user_groups: inner.indexes.user_groups.entry_count(),
                group_users: inner.indexes.group_users.entry_count(),
            },
            None => CacheStats::default(),
        }
    }

    /// Flush pending cache maintenance: expired entries are dropped and
    /// queued eviction notifications delivered before this returns.
    pub async fn run_pending_tasks(&self) {
        if let Some(inner) = self.inner.as_ref() {
            inner.indexes.run_pending_tasks().await;
        }
    }
}

fn sentinel_id(result: Result<i64>) -> Result<i64> {
    match result {
        Ok(id) => Ok(id),
        Err(DirectoryError::NotFound) => Ok(UNKNOWN_ID),
        Err(err) => Err(err),
    }
}

fn sentinel_name(result: Result<String>) -> Result<Option<String>> {
    match result {
        Ok(name) => Ok(Some(name)),
        Err(DirectoryError::NotFound) => Ok(None),
        Err(err) => Err(err),
    }
}

fn unshare(err: Arc<DirectoryError>) -> DirectoryError {
    (*err).clone()
}

impl Inner {
    /// Single-flight read-through on cache (1); back-fills (2).
    async fn user_id(&self, name: &str) -> Result<i64> {
        self.indexes
            .user_ids
            .try_get_with_by_ref(name, self.load_user_id(name))
            .await
            .map_err(unshare)
    }

    async fn load_user_id(&self, name: &str) -> Result<i64> {
        debug!(user = name, "loading user by name");
        let user = self
            .gateway
            .users
            .get_user_by_name(name)
            .await?
            .ok_or(DirectoryError::NotFound)?;
        self.indexes.backfill_user_name(user.id, &user.name).await;
        Ok(user.id)
    }

    /// Single-flight read-through on cache (2); back-fills (1).
    async fn user_name(&self, id: i64) -> Result<String> {
        self.indexes
            .user_names
            .try_get_with(id, self.load_user_name(id))
            .await
            .map_err(unshare)
    }

    async fn load_user_name(&self, id: i64) -> Result<String> {
        debug!(id, "loading user by id");
        let user = self
            .gateway
            .users
            .get_user_by_id(id)
            .await?
            .ok_or(DirectoryError::NotFound)?;
        self.indexes.backfill_user_id(&user.name, user.id).await;
        Ok(user.name)
    }

    /// Single-flight read-through on cache (3); back-fills (4).
    async fn group_id(&self, name: &str) -> Result<i64> {
        self.indexes
            .group_ids
            .try_get_with_by_ref(name, self.load_group_id(name))
            .await
            .map_err(unshare)
    }

    async fn load_group_id(&self, name: &str) -> Result<i64> {
        debug!(group = name, "loading group by name");
        let group = self
            .gateway
            .groups
            .get_group_by_name(name)
            .await?
            .ok_or(DirectoryError::NotFound)?;
        self.indexes.backfill_group_name(group.id, &group.name).await;
        Ok(group.id)
    }

    /// Single-flight read-through on cache (4); back-fills (3).
    async fn group_name(&self, id: i64) -> Result<String> {
        self.indexes
            .group_names
            .try_get_with(id, self.load_group_name(id))
            .await
            .map_err(unshare)
    }

    async fn load_group_name(&self, id: i64) -> Result<String> {
        debug!(id, "loading group by id");
        let group = self
            .gateway
            .groups
            .get_group_by_id(id)
            .await?
            .ok_or(DirectoryError::NotFound)?;
        self.indexes.backfill_group_id(&group.name, group.id).await;
        Ok(group.name)
    }

    /// Single-flight read-through on cache (5).
    ///
    /// One membership query feeds four caches: the group pairs back-fill
    /// (3) and (4), and the loading user is appended to each group's
    /// reverse-index list in (6).
    async fn user_groups(&self, user: &str) -> Result<Vec<String>> {
        self.indexes
            .user_groups
            .try_get_with_by_ref(user, self.load_user_groups(user))
            .await
            .map_err(unshare)
    }

    async fn load_user_groups(&self, user: &str) -> Result<Vec<String>> {
        let user_id = self.user_id(user).await?;
        let groups = self
            .gateway
            .memberships
            .get_groups_for_user(user_id)
            .await?;
        // a user with no membership rows is a not-found, not an empty list
        if groups.is_empty() {
            return Err(DirectoryError::NotFound);
        }
        let mut names = Vec::with_capacity(groups.len());
        for group in &groups {
            self.indexes.backfill_group(group).await;
            self.indexes.append_group_user(&group.name, user).await;
            names.push(group.name.clone());
        }
        debug!(user, groups = names.len(), "loaded membership list");
        Ok(names)
    }

    /// Resolve the user id from cache (1) or create the user; recovers
    /// from a lost creation race by fetching the winner's row.
    async fn ensure_user(&self, name: &str) -> Result<i64> {
        if let Some(id) = self.indexes.user_ids.get(name).await {
            return Ok(id);
        }
        match self.gateway.users.add_user(name).await {
            Ok(user) => {
                self.indexes.insert_user(&user).await;
                Ok(user.id)
            }
            Err(DirectoryError::UniqueKey(_)) => {
                let user = self
                    .gateway
                    .users
                    .get_user_by_name(name)
                    .await?
                    .ok_or_else(|| {
                        DirectoryError::Storage(format!(
                            "user {name} vanished after unique-key violation"
                        ))
                    })?;
                self.indexes.insert_user(&user).await;
                Ok(user.id)
            }
            Err(err) => Err(err),
        }
    }

    /// Mirror of [`ensure_user`](Self::ensure_user) for groups.
    async fn ensure_group(&self, name: &str) -> Result<i64> {
        if let Some(id) = self.indexes.group_ids.get(name).await {
            return Ok(id);
        }
        match self.gateway.groups.add_group(name).await {
            Ok(group) => {
                self.indexes.insert_group(&group).await;
                Ok(group.id)
            }
            Err(DirectoryError::UniqueKey(_)) => {
                let group = self
                    .gateway
                    .groups
                    .get_group_by_name(name)
                    .await?
                    .ok_or_else(|| {
                        DirectoryError::Storage(format!(
                            "group {name} vanished after unique-key violation"
                        ))
                    })?;
                self.indexes.insert_group(&group).await;
                Ok(group.id)
            }
            Err(err) => Err(err),
        }
    }

    async fn add_user_groups(&self, user: &str, groups: &[String]) -> Result<()> {
        let mut retried = false;
        loop {
            let user_id = self.ensure_user(user).await?;
            let mut group_ids = Vec::with_capacity(groups.len());
            for group in groups {
                group_ids.push(self.ensure_group(group).await?);
            }
            match self
                .gateway
                .memberships
                .add_user_to_groups(user_id, &group_ids)
                .await
            {
                Ok(()) => {}
                Err(DirectoryError::UniqueKey(detail)) => {
                    warn!(user, %detail, "membership already present; treating as success");
                }
                Err(DirectoryError::ForeignKey(detail)) if !retried => {
                    warn!(user, %detail, "directory rejected cached ids; invalidating and retrying");
                    retried = true;
                    self.indexes.purge_user(user).await;
                    for group in groups {
                        self.indexes.purge_group(group).await;
                    }
                    continue;
                }
                Err(err) => return Err(err),
            }
            self.indexes.apply_membership(user, groups).await;
            return Ok(());
        }
    }
}

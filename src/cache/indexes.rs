//! # Index Caches
//!
//! The six size- and TTL-bounded caches and the eviction propagation rules
//! that keep them mutually consistent. Whatever removes an entry (explicit
//! invalidation, TTL expiry or the size bound), the eviction listener tears
//! down every sibling entry that could otherwise be observed stale.
//!
//! Listeners only invalidate or shrink entries in *other* caches and never
//! insert, so cascades converge; they never re-enter their own cache.

use std::future::ready;
use std::hash::Hash;
use std::sync::Arc;

use futures::FutureExt;
use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::ops::compute::Op;
use once_cell::sync::OnceCell;
use tracing::debug;

use crate::directory::{Group, User};

use super::CacheConfig;

/// The six index caches.
///
/// | # | field | key → value |
/// |---|---|---|
/// | 1 | `user_ids` | user name → user id |
/// | 2 | `user_names` | user id → user name |
/// | 3 | `group_ids` | group name → group id |
/// | 4 | `group_names` | group id → group name |
/// | 5 | `user_groups` | user name → group names |
/// | 6 | `group_users` | group name → user names |
///
/// `group_users` has no loader by design: it is a derived projection
/// maintained by writes and by `user_groups`' loader, and a miss means
/// "not materialized", never "not found in the directory".
#[derive(Clone)]
pub(crate) struct Indexes {
    pub(crate) user_ids: Cache<String, i64>,
    pub(crate) user_names: Cache<i64, String>,
    pub(crate) group_ids: Cache<String, i64>,
    pub(crate) group_names: Cache<i64, String>,
    pub(crate) user_groups: Cache<String, Vec<String>>,
    pub(crate) group_users: Cache<String, Vec<String>>,
}

impl Indexes {
    /// Build the six caches and wire their eviction listeners together.
    ///
    /// Each listener needs a handle to sibling caches that do not exist yet
    /// while its own cache is being built, so all listeners capture one
    /// shared cell that is filled once the full set is assembled.
    pub(crate) fn build(config: &CacheConfig) -> Self {
        let shared: Arc<OnceCell<Indexes>> = Arc::new(OnceCell::new());

        let user_ids: Cache<String, i64> = {
            let shared = Arc::clone(&shared);
            Cache::builder()
                .max_capacity(config.lru_max)
                .time_to_live(config.eviction_ttl)
                .async_eviction_listener(move |_name: Arc<String>, id: i64, _cause| {
                    let shared = Arc::clone(&shared);
                    async move {
                        if let Some(indexes) = shared.get() {
                            indexes.user_names.invalidate(&id).await;
                        }
                    }
                    .boxed()
                })
                .build()
        };

        let user_names: Cache<i64, String> = {
            let shared = Arc::clone(&shared);
            Cache::builder()
                .max_capacity(config.lru_max)
                .time_to_live(config.eviction_ttl)
                .async_eviction_listener(move |_id: Arc<i64>, name: String, _cause| {
                    let shared = Arc::clone(&shared);
                    async move {
                        if let Some(indexes) = shared.get() {
                            indexes.user_ids.invalidate(&name).await;
                        }
                    }
                    .boxed()
                })
                .build()
        };

        let group_ids: Cache<String, i64> = {
            let shared = Arc::clone(&shared);
            Cache::builder()
                .max_capacity(config.lru_max)
                .time_to_live(config.eviction_ttl)
                .async_eviction_listener(move |_name: Arc<String>, id: i64, _cause| {
                    let shared = Arc::clone(&shared);
                    async move {
                        if let Some(indexes) = shared.get() {
                            indexes.group_names.invalidate(&id).await;
                        }
                    }
                    .boxed()
                })
                .build()
        };

        let group_names: Cache<i64, String> = {
            let shared = Arc::clone(&shared);
            Cache::builder()
                .max_capacity(config.lru_max)
                .time_to_live(config.eviction_ttl)
                .async_eviction_listener(move |_id: Arc<i64>, name: String, _cause| {
                    let shared = Arc::clone(&shared);
                    async move {
                        if let Some(indexes) = shared.get() {
                            indexes.group_ids.invalidate(&name).await;
                        }
                    }
                    .boxed()
                })
                .build()
        };

        let user_groups: Cache<String, Vec<String>> = {
            let shared = Arc::clone(&shared);
            Cache::builder()
                .max_capacity(config.lru_max)
                .time_to_live(config.eviction_ttl)
                .async_eviction_listener(
                    move |user: Arc<String>, groups: Vec<String>, cause| {
                        let shared = Arc::clone(&shared);
                        async move {
                            // merges replace the value in place; only real
                            // evictions tear down the reverse index
                            if cause == RemovalCause::Replaced {
                                return;
                            }
                            debug!(user = %user, ?cause, "membership list evicted");
                            if let Some(indexes) = shared.get() {
                                for group in &groups {
                                    indexes.remove_user_from_group_list(group, &user).await;
                                }
                            }
                        }
                        .boxed()
                    },
                )
                .build()
        };

        let group_users: Cache<String, Vec<String>> = {
            let shared = Arc::clone(&shared);
            Cache::builder()
                .max_capacity(config.lru_max)
                .time_to_live(config.eviction_ttl)
                .async_eviction_listener(
                    move |group: Arc<String>, users: Vec<String>, cause| {
                        let shared = Arc::clone(&shared);
                        async move {
                            if cause == RemovalCause::Replaced {
                                return;
                            }
                            debug!(group = %group, ?cause, "reverse index entry evicted");
                            if let Some(indexes) = shared.get() {
                                for user in &users {
                                    indexes.remove_group_from_user_list(user, &group).await;
                                }
                            }
                        }
                        .boxed()
                    },
                )
                .build()
        };

        let indexes = Indexes {
            user_ids,
            user_names,
            group_ids,
            group_names,
            user_groups,
            group_users,
        };
        let _ = shared.set(indexes.clone());
        indexes
    }

    /// Insert a freshly created user into caches (1) and (2).
    pub(crate) async fn insert_user(&self, user: &User) {
        self.user_ids.insert(user.name.clone(), user.id).await;
        self.user_names.insert(user.id, user.name.clone()).await;
    }

    /// Insert a freshly created group into caches (3) and (4).
    pub(crate) async fn insert_group(&self, group: &Group) {
        self.group_ids.insert(group.name.clone(), group.id).await;
        self.group_names.insert(group.id, group.name.clone()).await;
    }

    /// Back-fill (2) from a load of (1).
    ///
    /// Insert-if-different: replacing an identical pair would fire a
    /// `Replaced` notification whose listener tears down the entry the
    /// loader just produced.
    pub(crate) async fn backfill_user_name(&self, id: i64, name: &str) {
        if self.user_names.get(&id).await.as_deref() != Some(name) {
            self.user_names.insert(id, name.to_string()).await;
        }
    }

    /// Back-fill (1) from a load of (2).
    pub(crate) async fn backfill_user_id(&self, name: &str, id: i64) {
        if self.user_ids.get(name).await != Some(id) {
            self.user_ids.insert(name.to_string(), id).await;
        }
    }

    /// Back-fill (3) and (4) from a membership load.
    pub(crate) async fn backfill_group(&self, group: &Group) {
        if self.group_ids.get(&group.name).await != Some(group.id) {
            self.group_ids.insert(group.name.clone(), group.id).await;
        }
        if self.group_names.get(&group.id).await.as_deref() != Some(group.name.as_str()) {
            self.group_names.insert(group.id, group.name.clone()).await;
        }
    }

    /// Back-fill (4) from a load of (3).
    pub(crate) async fn backfill_group_name(&self, id: i64, name: &str) {
        if self.group_names.get(&id).await.as_deref() != Some(name) {
            self.group_names.insert(id, name.to_string()).await;
        }
    }

    /// Back-fill (3) from a load of (4).
    pub(crate) async fn backfill_group_id(&self, name: &str, id: i64) {
        if self.group_ids.get(name).await != Some(id) {
            self.group_ids.insert(name.to_string(), id).await;
        }
    }

    /// Drop every entry derived from `name`: (1), (2) via the cached id,
    /// and the membership list (5), whose listener cleans (6).
    ///
    /// Drives the listener cascade to completion before returning, so a
    /// queued teardown can never strip entries a later operation re-adds.
    /// Must not be called from inside a listener; listeners use the
    /// narrower helpers instead.
    pub(crate) async fn purge_user(&self, name: &str) {
        if let Some(id) = self.user_ids.get(name).await {
            self.user_names.invalidate(&id).await;
        }
        self.user_ids.invalidate(name).await;
        self.user_groups.invalidate(name).await;
        self.run_pending_tasks().await;
    }

    /// Mirror of [`purge_user`](Self::purge_user) over (3), (4) and (6).
    pub(crate) async fn purge_group(&self, name: &str) {
        if let Some(id) = self.group_ids.get(name).await {
            self.group_names.invalidate(&id).await;
        }
        self.group_ids.invalidate(name).await;
        self.group_users.invalidate(name).await;
        self.run_pending_tasks().await;
    }

    /// Merge `groups` into (5)'s list for `user` and append `user` to (6)
    /// for every group that was not already listed.
    ///
    /// A user with no cached list and an empty merge stays uncached; empty
    /// lists never occupy capacity.
    pub(crate) async fn apply_membership(&self, user: &str, groups: &[String]) {
        let mut added: Vec<String> = Vec::new();
        let _ = self
            .user_groups
            .entry_by_ref(user)
            .and_compute_with(|entry| {
                let op = match entry {
                    Some(entry) => {
                        let mut list = entry.into_value();
                        for group in groups {
                            if !list.contains(group) {
                                list.push(group.clone());
                                added.push(group.clone());
                            }
                        }
                        if added.is_empty() {
                            Op::Nop
                        } else {
                            Op::Put(list)
                        }
                    }
                    None if groups.is_empty() => Op::Nop,
                    None => {
                        added.extend(groups.iter().cloned());
                        Op::Put(groups.to_vec())
                    }
                };
                ready(op)
            })
            .await;
        for group in &added {
            self.append_group_user(group, user).await;
        }
    }

    /// Append `user` to (6)'s list for `group`, creating the entry if
    /// absent. Idempotent.
    pub(crate) async fn append_group_user(&self, group: &str, user: &str) {
        let _ = self
            .group_users
            .entry_by_ref(group)
            .and_upsert_with(|entry| {
                let mut list = entry.map(|e| e.into_value()).unwrap_or_default();
                if !list.iter().any(|existing| existing == user) {
                    list.push(user.to_string());
                }
                ready(list)
            })
            .await;
    }

    /// Remove one membership pair from both list caches, evicting either
    /// key whose list empties. Flushes the resulting cascade; must not be
    /// called from inside a listener.
    pub(crate) async fn remove_membership(&self, user: &str, group: &str) {
        self.remove_group_from_user_list(user, group).await;
        self.remove_user_from_group_list(group, user).await;
        self.run_pending_tasks().await;
    }

    /// Remove `user` from (6)'s list for `group`; drop the key when the
    /// list empties. A missing entry is "not materialized" and left alone.
    pub(crate) async fn remove_user_from_group_list(&self, group: &str, user: &str) {
        let _ = self
            .group_users
            .entry_by_ref(group)
            .and_compute_with(|entry| {
                let op = match entry {
                    None => Op::Nop,
                    Some(entry) => {
                        let mut list = entry.into_value();
                        let before = list.len();
                        list.retain(|existing| existing != user);
                        if list.len() == before {
                            Op::Nop
                        } else if list.is_empty() {
                            Op::Remove
                        } else {
                            Op::Put(list)
                        }
                    }
                };
                ready(op)
            })
            .await;
    }

    /// Remove `group` from (5)'s list for `user`; drop the key when the
    /// list empties.
    pub(crate) async fn remove_group_from_user_list(&self, user: &str, group: &str) {
        let _ = self
            .user_groups
            .entry_by_ref(user)
            .and_compute_with(|entry| {
                let op = match entry {
                    None => Op::Nop,
                    Some(entry) => {
                        let mut list = entry.into_value();
                        let before = list.len();
                        list.retain(|existing| existing != group);
                        if list.len() == before {
                            Op::Nop
                        } else if list.is_empty() {
                            Op::Remove
                        } else {
                            Op::Put(list)
                        }
                    }
                };
                ready(op)
            })
            .await;
    }

    /// Invalidate every entry of all six caches, one by one, so each
    /// removal hook observes its entry. The cascade converges because
    /// listeners never insert.
    pub(crate) async fn clear(&self) {
        drain(&self.user_groups).await;
        drain(&self.group_users).await;
        drain(&self.user_ids).await;
        drain(&self.user_names).await;
        drain(&self.group_ids).await;
        drain(&self.group_names).await;
        self.run_pending_tasks().await;
    }

    /// Flush moka's pending maintenance on all six caches, delivering
    /// queued eviction notifications and expired entries.
    pub(crate) async fn run_pending_tasks(&self) {
        // twice: work a listener schedules during the first pass is
        // delivered by the second
        for _ in 0..2 {
            self.user_ids.run_pending_tasks().await;
            self.user_names.run_pending_tasks().await;
            self.group_ids.run_pending_tasks().await;
            self.group_names.run_pending_tasks().await;
            self.user_groups.run_pending_tasks().await;
            self.group_users.run_pending_tasks().await;
        }
    }
}

async fn drain<K, V>(cache: &Cache<K, V>)
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let keys: Vec<K> = cache.iter().map(|(key, _)| (*key).clone()).collect();
    for key in keys {
        cache.invalidate(&key).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn small() -> Indexes {
        Indexes::build(&CacheConfig {
            eviction_ttl: Duration::from_secs(60),
            lru_max: 64,
        })
    }

    #[tokio::test]
    async fn evicting_a_name_tears_down_the_id() {
        let ix = small();
        ix.insert_user(&User {
            id: 7,
            name: "alice".into(),
        })
        .await;

        ix.user_ids.invalidate("alice").await;
        ix.run_pending_tasks().await;

        assert_eq!(ix.user_names.get(&7).await, None);
    }

    #[tokio::test]
    async fn evicting_an_id_tears_down_the_name() {
        let ix = small();
        ix.insert_group(&Group {
            id: 9,
            name: "devs".into(),
        })
        .await;

        ix.group_names.invalidate(&9).await;
        ix.run_pending_tasks().await;

        assert_eq!(ix.group_ids.get("devs").await, None);
    }

    #[tokio::test]
    async fn backfill_skips_identical_pairs() {
        let ix = small();
        ix.insert_user(&User {
            id: 7,
            name: "alice".into(),
        })
        .await;

        // a same-value back-fill must not fire a Replaced teardown
        ix.backfill_user_name(7, "alice").await;
        ix.run_pending_tasks().await;

        assert_eq!(ix.user_ids.get("alice").await, Some(7));
        assert_eq!(ix.user_names.get(&7).await.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn merge_reports_only_new_groups_to_the_reverse_index() {
        let ix = small();
        ix.apply_membership("bob", &["devs".into(), "ops".into()])
            .await;
        ix.apply_membership("bob", &["devs".into(), "sre".into()])
            .await;

        assert_eq!(
            ix.user_groups.get("bob").await,
            Some(vec!["devs".into(), "ops".into(), "sre".into()])
        );
        assert_eq!(ix.group_users.get("devs").await, Some(vec!["bob".into()]));
        assert_eq!(ix.group_users.get("sre").await, Some(vec!["bob".into()]));
    }

    #[tokio::test]
    async fn empty_merge_does_not_materialize_a_list() {
        let ix = small();
        ix.apply_membership("bob", &[]).await;
        assert_eq!(ix.user_groups.get("bob").await, None);
    }

    #[tokio::test]
    async fn membership_list_eviction_cleans_the_reverse_index() {
        let ix = small();
        ix.apply_membership("bob", &["devs".into(), "ops".into()])
            .await;
        ix.apply_membership("eve", &["devs".into()]).await;

        ix.user_groups.invalidate("bob").await;
        ix.run_pending_tasks().await;

        // bob left both lists; ops emptied and was dropped outright
        assert_eq!(ix.group_users.get("devs").await, Some(vec!["eve".into()]));
        assert_eq!(ix.group_users.get("ops").await, None);
    }

    #[tokio::test]
    async fn reverse_index_eviction_cleans_membership_lists() {
        let ix = small();
        ix.apply_membership("bob", &["devs".into(), "ops".into()])
            .await;
        ix.apply_membership("eve", &["devs".into()]).await;

        ix.group_users.invalidate("devs").await;
        ix.run_pending_tasks().await;

        assert_eq!(ix.user_groups.get("bob").await, Some(vec!["ops".into()]));
        // eve only had devs; her list emptied and was dropped
        assert_eq!(ix.user_groups.get("eve").await, None);
    }

    #[tokio::test]
    async fn remove_membership_drops_emptied_keys() {
        let ix = small();
        ix.apply_membership("bob", &["devs".into()]).await;

        ix.remove_membership("bob", "devs").await;
        ix.run_pending_tasks().await;

        assert_eq!(ix.user_groups.get("bob").await, None);
        assert_eq!(ix.group_users.get("devs").await, None);
    }

    #[tokio::test]
    async fn clear_fires_every_removal_hook() {
        let ix = small();
        ix.insert_user(&User {
            id: 1,
            name: "alice".into(),
        })
        .await;
        ix.apply_membership("alice", &["devs".into()]).await;

        ix.clear().await;

        assert_eq!(ix.user_ids.get("alice").await, None);
        assert_eq!(ix.user_names.get(&1).await, None);
        assert_eq!(ix.user_groups.get("alice").await, None);
        assert_eq!(ix.group_users.get("devs").await, None);
    }

    #[tokio::test]
    async fn size_bound_eviction_propagates() {
        let ix = Indexes::build(&CacheConfig {
            eviction_ttl: Duration::from_secs(60),
            lru_max: 2,
        });
        for (id, name) in [(1, "a"), (2, "b"), (3, "c"), (4, "d")] {
            ix.insert_user(&User {
                id,
                name: name.into(),
            })
            .await;
        }
        ix.run_pending_tasks().await;

        // whatever was evicted from (1) must be gone from (2) as well
        for (id, name) in [(1i64, "a"), (2, "b"), (3, "c"), (4, "d")] {
            if ix.user_ids.get(name).await.is_none() {
                assert_eq!(ix.user_names.get(&id).await, None);
            }
        }
    }
}

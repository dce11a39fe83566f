//! Mockable directory backend.
//!
//! When testing code that sits on top of the cache you don't want a real
//! directory server around; it's much better to have a custom set of users
//! and groups that are guaranteed to be there. [`MemoryDirectory`]
//! implements all three gateway traits over plain in-memory tables, with a
//! few extras the integration tests lean on: configurable id bases,
//! per-table call counters, a transaction counter and one-shot fault
//! injection.
//!
//! ```
//! use std::sync::Arc;
//! use dircache::directory::mock::MemoryDirectory;
//! use dircache::{CacheConfig, DirectoryCache};
//!
//! let store = Arc::new(MemoryDirectory::new());
//! let cache = DirectoryCache::new(
//!     CacheConfig::default(),
//!     Some(store.clone()),
//!     Some(store.clone()),
//!     Some(store),
//! );
//! assert!(cache.is_configured());
//! ```

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::gateway::{GroupAccess, MembershipAccess, UserAccess};
use super::{DirectoryError, Group, Result, User};

/// Per-table call counters, snapshot via [`MemoryDirectory::counters`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounters {
    /// User-table lookups (`get_user_by_name` / `get_user_by_id`).
    pub user_reads: u64,
    /// Group-table lookups.
    pub group_reads: u64,
    /// Membership queries (`get_groups_for_user`).
    pub membership_reads: u64,
    /// User-table mutations.
    pub user_writes: u64,
    /// Group-table mutations.
    pub group_writes: u64,
    /// Membership mutations.
    pub membership_writes: u64,
    /// Transactions opened by `get_groups_for_user` itself.
    pub transactions_started: u64,
}

impl CallCounters {
    /// Total calls that reached the store.
    pub fn total(&self) -> u64 {
        self.user_reads
            + self.group_reads
            + self.membership_reads
            + self.user_writes
            + self.group_writes
            + self.membership_writes
    }
}

#[derive(Debug, Default)]
struct State {
    users_by_id: BTreeMap<i64, String>,
    users_by_name: HashMap<String, i64>,
    groups_by_id: BTreeMap<i64, String>,
    groups_by_name: HashMap<String, i64>,
    // insertion order doubles as storage order for get_groups_for_user
    memberships: Vec<(i64, i64)>,
    next_user_id: i64,
    next_group_id: i64,
    tx_depth: u32,
    fault: Option<DirectoryError>,
    counters: CallCounters,
}

/// In-memory directory implementing all three gateway traits.
#[derive(Debug)]
pub struct MemoryDirectory {
    state: Mutex<State>,
}

impl MemoryDirectory {
    /// Empty directory assigning ids from 1 in both namespaces.
    pub fn new() -> Self {
        Self::with_id_bases(1, 1)
    }

    /// Empty directory whose first user and group ids are the given bases.
    pub fn with_id_bases(user_base: i64, group_base: i64) -> Self {
        Self {
            state: Mutex::new(State {
                next_user_id: user_base,
                next_group_id: group_base,
                ..State::default()
            }),
        }
    }

    /// Snapshot of the call counters.
    pub fn counters(&self) -> CallCounters {
        self.state.lock().counters.clone()
    }

    /// Zero the call counters, typically after seeding.
    pub fn reset_counters(&self) {
        self.state.lock().counters = CallCounters::default();
    }

    /// Make the next store call fail with `err` (one-shot).
    pub fn inject_fault(&self, err: DirectoryError) {
        self.state.lock().fault = Some(err);
    }

    /// Whether the membership row exists right now.
    pub fn has_membership(&self, user_id: i64, group_id: i64) -> bool {
        self.state
            .lock()
            .memberships
            .contains(&(user_id, group_id))
    }

    /// Number of membership rows currently stored.
    pub fn membership_rows(&self) -> usize {
        self.state.lock().memberships.len()
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    fn take_fault(&mut self) -> Result<()> {
        match self.fault.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl UserAccess for MemoryDirectory {
    async fn get_user_by_name(&self, name: &str) -> Result<Option<User>> {
        let mut st = self.state.lock();
        st.counters.user_reads += 1;
        st.take_fault()?;
        Ok(st.users_by_name.get(name).map(|id| User {
            id: *id,
            name: name.to_string(),
        }))
    }

    async fn get_user_by_id(&self, id: i64) -> Result<Option<User>> {
        let mut st = self.state.lock();
        st.counters.user_reads += 1;
        st.take_fault()?;
        Ok(st.users_by_id.get(&id).map(|name| User {
            id,
            name: name.clone(),
        }))
    }

    async fn add_user(&self, name: &str) -> Result<User> {
        let mut st = self.state.lock();
        st.counters.user_writes += 1;
        st.take_fault()?;
        if st.users_by_name.contains_key(name) {
            return Err(DirectoryError::UniqueKey(format!("user name {name}")));
        }
        let id = st.next_user_id;
        st.next_user_id += 1;
        st.users_by_id.insert(id, name.to_string());
        st.users_by_name.insert(name.to_string(), id);
        Ok(User {
            id,
            name: name.to_string(),
        })
    }

    async fn remove_user(&self, id: i64) -> Result<()> {
        let mut st = self.state.lock();
        st.counters.user_writes += 1;
        st.take_fault()?;
        let name = st.users_by_id.remove(&id).ok_or(DirectoryError::NotFound)?;
        st.users_by_name.remove(&name);
        st.memberships.retain(|(user_id, _)| *user_id != id);
        Ok(())
    }
}

#[async_trait]
impl GroupAccess for MemoryDirectory {
    async fn get_group_by_name(&self, name: &str) -> Result<Option<Group>> {
        let mut st = self.state.lock();
        st.counters.group_reads += 1;
        st.take_fault()?;
        Ok(st.groups_by_name.get(name).map(|id| Group {
            id: *id,
            name: name.to_string(),
        }))
    }

    async fn get_group_by_id(&self, id: i64) -> Result<Option<Group>> {
        let mut st = self.state.lock();
        st.counters.group_reads += 1;
        st.take_fault()?;
        Ok(st.groups_by_id.get(&id).map(|name| Group {
            id,
            name: name.clone(),
        }))
    }

    async fn add_group(&self, name: &str) -> Result<Group> {
        let mut st = self.state.lock();
        st.counters.group_writes += 1;
        st.take_fault()?;
        if st.groups_by_name.contains_key(name) {
            return Err(DirectoryError::UniqueKey(format!("group name {name}")));
        }
        let id = st.next_group_id;
        st.next_group_id += 1;
        st.groups_by_id.insert(id, name.to_string());
        st.groups_by_name.insert(name.to_string(), id);
        Ok(Group {
            id,
            name: name.to_string(),
        })
    }

    async fn remove_group(&self, id: i64) -> Result<()> {
        let mut st = self.state.lock();
        st.counters.group_writes += 1;
        st.take_fault()?;
        let name = st.groups_by_id.remove(&id).ok_or(DirectoryError::NotFound)?;
        st.groups_by_name.remove(&name);
        st.memberships.retain(|(_, group_id)| *group_id != id);
        Ok(())
    }
}

#[async_trait]
impl MembershipAccess for MemoryDirectory {
    /// Inserts the rows that are missing; when any row already existed the
    /// call still reports `UniqueKey` after applying the rest, so a caller
    /// treating the violation as success observes the desired end state.
    async fn add_user_to_groups(&self, user_id: i64, group_ids: &[i64]) -> Result<()> {
        let mut st = self.state.lock();
        st.counters.membership_writes += 1;
        st.take_fault()?;
        if !st.users_by_id.contains_key(&user_id) {
            return Err(DirectoryError::ForeignKey(format!("user id {user_id}")));
        }
        for group_id in group_ids {
            if !st.groups_by_id.contains_key(group_id) {
                return Err(DirectoryError::ForeignKey(format!("group id {group_id}")));
            }
        }
        let mut duplicate = None;
        for group_id in group_ids {
            if st.memberships.contains(&(user_id, *group_id)) {
                duplicate = Some(*group_id);
            } else {
                st.memberships.push((user_id, *group_id));
            }
        }
        match duplicate {
            Some(group_id) => Err(DirectoryError::UniqueKey(format!(
                "membership ({user_id}, {group_id})"
            ))),
            None => Ok(()),
        }
    }

    async fn remove_user_from_group(&self, user_id: i64, group_id: i64) -> Result<()> {
        let mut st = self.state.lock();
        st.counters.membership_writes += 1;
        st.take_fault()?;
        let before = st.memberships.len();
        st.memberships.retain(|row| *row != (user_id, group_id));
        if st.memberships.len() == before {
            return Err(DirectoryError::NotFound);
        }
        Ok(())
    }

    async fn get_groups_for_user(&self, user_id: i64) -> Result<Vec<Group>> {
        let mut st = self.state.lock();
        st.counters.membership_reads += 1;
        st.take_fault()?;
        // participating transaction semantics: only the outermost call
        // opens and commits
        let started = st.tx_depth == 0;
        if started {
            st.tx_depth += 1;
            st.counters.transactions_started += 1;
        }
        let mut groups = Vec::new();
        for (member, group_id) in &st.memberships {
            if *member != user_id {
                continue;
            }
            if let Some(name) = st.groups_by_id.get(group_id) {
                groups.push(Group {
                    id: *group_id,
                    name: name.clone(),
                });
            }
        }
        if started {
            st.tx_depth -= 1;
        }
        Ok(groups)
    }
}

// Property tests: random public-operation sequences must leave the six
// indexes mutually consistent, agreeing with the directory, and
// idempotent under repeated membership grants.

use std::sync::Arc;

use proptest::collection::vec;
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use tokio::runtime::Runtime;

use dircache::directory::mock::MemoryDirectory;
use dircache::{
    CacheConfig, DirectoryCache, GroupAccess, MembershipAccess, UserAccess, UNKNOWN_ID,
};

fn cache_over(store: &Arc<MemoryDirectory>) -> DirectoryCache {
    DirectoryCache::new(
        CacheConfig::default(),
        Some(store.clone() as Arc<dyn UserAccess>),
        Some(store.clone() as Arc<dyn GroupAccess>),
        Some(store.clone() as Arc<dyn MembershipAccess>),
    )
}

// a handful of names per namespace keeps collisions frequent
fn user_name(n: u8) -> String {
    format!("user-{}", n % 6)
}

fn group_name(n: u8) -> String {
    format!("group-{}", n % 6)
}

#[derive(Debug, Clone)]
enum DirOp {
    AddUser(u8),
    AddGroup(u8),
    AddUserGroups(u8, Vec<u8>),
    RemoveUser(u8),
    RemoveGroup(u8),
    RemoveMembership(u8, u8),
    GetUserId(u8),
    GetUserName(u8),
    GetGroups(u8),
    Clear,
}

fn op_strategy() -> impl Strategy<Value = DirOp> {
    prop_oneof![
        any::<u8>().prop_map(DirOp::AddUser),
        any::<u8>().prop_map(DirOp::AddGroup),
        (any::<u8>(), vec(any::<u8>(), 0..4)).prop_map(|(u, gs)| DirOp::AddUserGroups(u, gs)),
        any::<u8>().prop_map(DirOp::RemoveUser),
        any::<u8>().prop_map(DirOp::RemoveGroup),
        (any::<u8>(), any::<u8>()).prop_map(|(u, g)| DirOp::RemoveMembership(u, g)),
        any::<u8>().prop_map(DirOp::GetUserId),
        any::<u8>().prop_map(DirOp::GetUserName),
        any::<u8>().prop_map(DirOp::GetGroups),
        Just(DirOp::Clear),
    ]
}

async fn apply(cache: &DirectoryCache, op: DirOp) {
    match op {
        // creating a name that already exists is a caller error; the
        // sequences here provoke it on purpose
        DirOp::AddUser(n) => {
            let _ = cache.add_user(&user_name(n)).await;
        }
        DirOp::AddGroup(n) => {
            let _ = cache.add_group(&group_name(n)).await;
        }
        DirOp::AddUserGroups(u, gs) => {
            let groups: Vec<String> = gs.iter().map(|g| group_name(*g)).collect();
            let refs: Vec<&str> = groups.iter().map(String::as_str).collect();
            cache.add_user_groups(&user_name(u), &refs).await.unwrap();
        }
        DirOp::RemoveUser(n) => cache.remove_user(&user_name(n)).await.unwrap(),
        DirOp::RemoveGroup(n) => cache.remove_group(&group_name(n)).await.unwrap(),
        DirOp::RemoveMembership(u, g) => cache
            .remove_user_from_group(&user_name(u), &group_name(g))
            .await
            .unwrap(),
        DirOp::GetUserId(n) => {
            cache.get_user_id(&user_name(n)).await.unwrap();
        }
        DirOp::GetUserName(n) => {
            cache.get_user_name(i64::from(n % 40)).await.unwrap();
        }
        DirOp::GetGroups(n) => {
            cache.get_groups(&user_name(n)).await.unwrap();
        }
        DirOp::Clear => cache.clear().await,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn indexes_stay_coherent(ops in vec(op_strategy(), 1..40)) {
        let rt = Runtime::new().unwrap();
        let outcome: Result<(), TestCaseError> = rt.block_on(async move {
            let store = Arc::new(MemoryDirectory::new());
            let cache = cache_over(&store);
            for op in ops {
                apply(&cache, op).await;
            }
            cache.run_pending_tasks().await;

            // name/id bijection per namespace, wherever both sides are
            // present
            for n in 0..6u8 {
                let name = user_name(n);
                let id = cache.get_user_id_from_cache(&name).await;
                if id != UNKNOWN_ID {
                    if let Some(back) = cache.get_user_name_from_cache(id).await {
                        prop_assert_eq!(&back, &name);
                    }
                }
                let name = group_name(n);
                let id = cache.get_group_id_from_cache(&name).await;
                if id != UNKNOWN_ID {
                    if let Some(back) = cache.get_group_name_from_cache(id).await {
                        prop_assert_eq!(&back, &name);
                    }
                }
            }
            for id in 1..=64i64 {
                if let Some(name) = cache.get_user_name_from_cache(id).await {
                    let forward = cache.get_user_id_from_cache(&name).await;
                    if forward != UNKNOWN_ID {
                        prop_assert_eq!(forward, id);
                    }
                }
                if let Some(name) = cache.get_group_name_from_cache(id).await {
                    let forward = cache.get_group_id_from_cache(&name).await;
                    if forward != UNKNOWN_ID {
                        prop_assert_eq!(forward, id);
                    }
                }
            }

            // membership symmetry at steady state, both directions
            for n in 0..6u8 {
                let user = user_name(n);
                if let Some(groups) = cache.get_groups_from_cache(&user).await {
                    for group in &groups {
                        if let Some(users) = cache.get_group_users_from_cache(group).await {
                            prop_assert!(users.contains(&user));
                        }
                    }
                }
                let group = group_name(n);
                if let Some(users) = cache.get_group_users_from_cache(&group).await {
                    for user in &users {
                        if let Some(groups) = cache.get_groups_from_cache(user).await {
                            prop_assert!(groups.contains(&group));
                        }
                    }
                }
            }

            // the cache never disagrees with the directory about ids
            for n in 0..6u8 {
                let name = user_name(n);
                let cached = cache.get_user_id(&name).await.unwrap();
                let direct = store
                    .get_user_by_name(&name)
                    .await
                    .unwrap()
                    .map(|u| u.id)
                    .unwrap_or(UNKNOWN_ID);
                prop_assert_eq!(cached, direct);
            }
            Ok(())
        });
        outcome?;
    }

    #[test]
    fn add_user_groups_is_idempotent(u in any::<u8>(), gs in vec(any::<u8>(), 1..4)) {
        let rt = Runtime::new().unwrap();
        let outcome: Result<(), TestCaseError> = rt.block_on(async move {
            let store = Arc::new(MemoryDirectory::new());
            let cache = cache_over(&store);
            let user = user_name(u);
            let groups: Vec<String> = gs.iter().map(|g| group_name(*g)).collect();
            let refs: Vec<&str> = groups.iter().map(String::as_str).collect();

            cache.add_user_groups(&user, &refs).await.unwrap();
            cache.run_pending_tasks().await;
            let rows = store.membership_rows();
            let cached = cache.get_groups_from_cache(&user).await;

            cache.add_user_groups(&user, &refs).await.unwrap();
            cache.run_pending_tasks().await;
            prop_assert_eq!(store.membership_rows(), rows);
            prop_assert_eq!(cache.get_groups_from_cache(&user).await, cached);
            Ok(())
        });
        outcome?;
    }
}

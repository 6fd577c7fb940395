//! Policy cache consistency under concurrent reads and reloads

use authzd::store::{ConnectionOptions, PolicyMap, SecretMap};
use authzd::{
    ConnectionManager, Effect, KvClient, KvPolicyStore, MemoryKv, MemoryKvFactory, Policy,
    PolicyCache, PolicyStore, Result, Secret,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Alternates between two complete generations on every listing
#[derive(Default)]
struct FlippingStore {
    flips: AtomicU64,
}

impl FlippingStore {
    fn tag(&self) -> String {
        format!("gen-{}", self.flips.load(Ordering::SeqCst) % 2)
    }
}

impl PolicyStore for FlippingStore {
    fn list_policies(&self) -> Result<PolicyMap> {
        self.flips.fetch_add(1, Ordering::SeqCst);
        let tag = self.tag();
        let mut map = PolicyMap::new();
        for user in ["alice", "bob"] {
            map.insert(
                user.to_string(),
                vec![Policy::new(tag.clone(), format!("users:{user}"), "read", "doc:1", Effect::Allow)],
            );
        }
        Ok(map)
    }

    fn list_secrets(&self) -> Result<SecretMap> {
        let tag = self.tag();
        let mut map = SecretMap::new();
        map.insert(
            "key".to_string(),
            Secret {
                username: "alice".to_string(),
                secret_id: tag.clone(),
                secret_key: tag,
                expires: 0,
            },
        );
        Ok(map)
    }
}

#[test]
fn test_readers_never_see_missing_keys_during_reload() {
    let cache = Arc::new(PolicyCache::new(Arc::new(FlippingStore::default())));
    cache.reload().unwrap();

    let running = Arc::new(AtomicBool::new(true));
    let readers: Vec<_> = (0..8)
        .map(|_| {
            let cache = cache.clone();
            let running = running.clone();
            thread::spawn(move || {
                let mut reads = 0u64;
                while running.load(Ordering::Relaxed) {
                    assert!(cache.get_policies("alice").is_some());
                    assert!(cache.get_policies("bob").is_some());
                    assert!(cache.get_secret("key").is_some());
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    for _ in 0..200 {
        cache.reload().unwrap();
    }
    running.store(false, Ordering::Relaxed);

    for r in readers {
        assert!(r.join().unwrap() > 0);
    }
    assert_eq!(cache.generation(), 201);
}

#[test]
fn test_snapshot_never_mixes_generations() {
    let cache = Arc::new(PolicyCache::new(Arc::new(FlippingStore::default())));
    cache.reload().unwrap();

    let running = Arc::new(AtomicBool::new(true));
    let reader = {
        let cache = cache.clone();
        let running = running.clone();
        thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                let (policies, secrets) = cache.contents();
                let policy_tag = &policies["alice"][0].id;
                assert_eq!(policy_tag, &policies["bob"][0].id);
                assert_eq!(policy_tag, &secrets["key"].secret_id);
            }
        })
    };

    let reloaders: Vec<_> = (0..4)
        .map(|_| {
            let cache = cache.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    cache.reload().unwrap();
                }
            })
        })
        .collect();
    for r in reloaders {
        r.join().unwrap();
    }

    running.store(false, Ordering::Relaxed);
    reader.join().unwrap();
    assert_eq!(cache.generation(), 201);
}

fn policy_map() -> impl Strategy<Value = PolicyMap> {
    let policy = ("[a-z]{1,6}", any::<bool>()).prop_map(|(id, deny)| {
        let effect = if deny { Effect::Deny } else { Effect::Allow };
        Policy::new(id, "users:<.*>", "read", "doc:<.*>", effect)
    });
    prop::collection::hash_map("[a-z]{1,8}", prop::collection::vec(policy, 0..4), 0..6)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_reload_is_idempotent(policies in policy_map()) {
        let kv = MemoryKv::new();
        kv.set("policies", &serde_json::to_vec(&policies).unwrap(), Duration::ZERO).unwrap();

        let connections = ConnectionManager::new(
            Arc::new(MemoryKvFactory::new(kv)),
            ConnectionOptions::default(),
        );
        prop_assert!(connections.check());

        let cache = PolicyCache::new(Arc::new(KvPolicyStore::new(connections, "policies", "secrets")));
        cache.reload().unwrap();
        let first = cache.contents();
        cache.reload().unwrap();

        prop_assert_eq!(&cache.contents(), &first);
        prop_assert_eq!(&first.0, &policies);
    }
}

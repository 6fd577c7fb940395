//! In-memory policy and secret cache
//!
//! Holds exactly one snapshot of every subject's policies and every secret.
//! A reload fetches the full listings from the [`PolicyStore`] before taking
//! the write lock, then swaps both maps under that one lock, so readers are
//! stalled only for the swap and never observe a mix of generations.
//! Overlapping reloads are serialized.

use super::policy::{Policy, Secret};
use crate::error::Result;
use crate::store::{PolicyMap, PolicyStore, SecretMap};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Default)]
struct Snapshot {
    policies: HashMap<String, Arc<Vec<Policy>>>,
    secrets: HashMap<String, Arc<Secret>>,
}

/// Cache of policies by subject key and secrets by id
pub struct PolicyCache {
    store: Arc<dyn PolicyStore>,
    snapshot: RwLock<Snapshot>,
    reload_lock: Mutex<()>,
    generation: AtomicU64,
}

impl PolicyCache {
    /// Create an empty cache; call [`PolicyCache::reload`] before serving
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        PolicyCache {
            store,
            snapshot: RwLock::new(Snapshot::default()),
            reload_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Policies registered for `key`, `None` if the key is unknown
    pub fn get_policies(&self, key: &str) -> Option<Arc<Vec<Policy>>> {
        self.snapshot.read().policies.get(key).cloned()
    }

    /// Secret with the given id
    pub fn get_secret(&self, id: &str) -> Option<Arc<Secret>> {
        self.snapshot.read().secrets.get(id).cloned()
    }

    /// Replace the snapshot with the store's current contents
    ///
    /// On failure the previous snapshot stays authoritative.
    pub fn reload(&self) -> Result<()> {
        let _serialized = self.reload_lock.lock();

        let policies = self.store.list_policies().map_err(|e| {
            error!(error = %e, "Failed to list policies, keeping previous snapshot");
            e
        })?;
        let secrets = self.store.list_secrets().map_err(|e| {
            error!(error = %e, "Failed to list secrets, keeping previous snapshot");
            e
        })?;

        let policies: HashMap<_, _> = policies
            .into_iter()
            .map(|(key, list)| (key, Arc::new(list)))
            .collect();
        let secrets: HashMap<_, _> = secrets
            .into_iter()
            .map(|(id, secret)| (id, Arc::new(secret)))
            .collect();
        let (policy_keys, secret_count) = (policies.len(), secrets.len());

        {
            let mut snapshot = self.snapshot.write();
            snapshot.policies = policies;
            snapshot.secrets = secrets;
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        info!(
            generation,
            subjects = policy_keys,
            secrets = secret_count,
            "Policy cache reloaded"
        );
        Ok(())
    }

    /// Number of successful reloads so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Number of subject keys with policies
    pub fn policy_keys(&self) -> usize {
        self.snapshot.read().policies.len()
    }

    /// Number of cached secrets
    pub fn secret_count(&self) -> usize {
        self.snapshot.read().secrets.len()
    }

    /// Copy of the current snapshot
    pub fn contents(&self) -> (PolicyMap, SecretMap) {
        let snapshot = self.snapshot.read();
        let policies = snapshot
            .policies
            .iter()
            .map(|(key, list)| (key.clone(), list.as_ref().clone()))
            .collect();
        let secrets = snapshot
            .secrets
            .iter()
            .map(|(id, secret)| (id.clone(), secret.as_ref().clone()))
            .collect();
        (policies, secrets)
    }
}

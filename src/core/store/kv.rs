//! Policy store and audit sink over the managed key/value connection

use super::{AuditSink, ConnectionManager, PolicyMap, PolicyStore, PoolKind, SecretMap};
use crate::error::{AuthzError, Result};
use std::sync::Arc;
use tracing::debug;

/// Reads policy and secret snapshots stored as JSON documents
pub struct KvPolicyStore {
    connections: Arc<ConnectionManager>,
    policies_key: String,
    secrets_key: String,
}

impl KvPolicyStore {
    pub fn new(
        connections: Arc<ConnectionManager>,
        policies_key: impl Into<String>,
        secrets_key: impl Into<String>,
    ) -> Self {
        KvPolicyStore {
            connections,
            policies_key: policies_key.into(),
            secrets_key: secrets_key.into(),
        }
    }

    fn load<T: serde::de::DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        let client = self.connections.client(PoolKind::Primary)?;
        match client.get(key)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => {
                debug!(key, "Snapshot key absent, treating as empty");
                Ok(T::default())
            }
        }
    }
}

impl PolicyStore for KvPolicyStore {
    fn list_policies(&self) -> Result<PolicyMap> {
        self.load(&self.policies_key)
    }

    fn list_secrets(&self) -> Result<SecretMap> {
        self.load(&self.secrets_key)
    }
}

/// Appends audit batches to a list in the primary pool
pub struct KvAuditSink {
    connections: Arc<ConnectionManager>,
}

impl KvAuditSink {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        KvAuditSink { connections }
    }
}

impl AuditSink for KvAuditSink {
    fn append_batch(&self, key: &str, records: &[Vec<u8>]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let client = self.connections.client(PoolKind::Primary)?;
        client
            .append(key, records)
            .map_err(|e| AuthzError::Store(format!("append to {key} failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iam::{Effect, Policy};
    use crate::store::{ConnectionOptions, KvClient, MemoryKv, MemoryKvFactory};
    use std::collections::HashMap;
    use std::time::Duration;

    fn connected(kv: &Arc<MemoryKv>) -> Arc<ConnectionManager> {
        let manager = ConnectionManager::new(
            Arc::new(MemoryKvFactory::new(kv.clone())),
            ConnectionOptions::default(),
        );
        assert!(manager.check());
        manager
    }

    #[test]
    fn test_policy_store_reads_snapshots() {
        let kv = MemoryKv::new();
        let mut policies = HashMap::new();
        policies.insert(
            "alice".to_string(),
            vec![Policy::new("p1", "users:alice", "read", "doc:1", Effect::Allow)],
        );
        kv.set("policies", &serde_json::to_vec(&policies).unwrap(), Duration::ZERO)
            .unwrap();

        let store = KvPolicyStore::new(connected(&kv), "policies", "secrets");
        let loaded = store.list_policies().unwrap();
        assert_eq!(loaded["alice"][0].id, "p1");
        assert!(store.list_secrets().unwrap().is_empty());
    }

    #[test]
    fn test_policy_store_rejects_garbage() {
        let kv = MemoryKv::new();
        kv.set("policies", b"not json", Duration::ZERO).unwrap();
        let store = KvPolicyStore::new(connected(&kv), "policies", "secrets");
        assert!(matches!(
            store.list_policies(),
            Err(AuthzError::Serialization(_))
        ));
    }

    #[test]
    fn test_store_down_fails_fast() {
        let kv = MemoryKv::new();
        let manager = ConnectionManager::new(
            Arc::new(MemoryKvFactory::new(kv)),
            ConnectionOptions::default(),
        );
        let store = KvPolicyStore::new(manager.clone(), "policies", "secrets");
        assert!(matches!(store.list_policies(), Err(AuthzError::StoreDown)));

        let sink = KvAuditSink::new(manager);
        assert!(matches!(
            sink.append_batch("audit", &[b"r".to_vec()]),
            Err(AuthzError::StoreDown)
        ));
    }

    #[test]
    fn test_audit_sink_appends() {
        let kv = MemoryKv::new();
        let sink = KvAuditSink::new(connected(&kv));
        sink.append_batch("audit", &[b"a".to_vec(), b"b".to_vec()]).unwrap();
        sink.append_batch("audit", &[]).unwrap();
        assert_eq!(kv.list("audit"), vec![b"a".to_vec(), b"b".to_vec()]);
    }
}

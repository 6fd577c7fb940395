//! Backing store collaborators
//!
//! The decision core never talks to storage directly. It consumes:
//! - [`PolicyStore`]: full listings of policies and secrets for cache reloads
//! - [`AuditSink`]: batch appends of serialized audit records
//!
//! Both are implemented over a key/value store ([`KvClient`]) whose client
//! handles are owned and health-checked by the [`ConnectionManager`].

mod connection;
mod kv;
mod memory;

pub use connection::{ConnectionManager, ConnectionOptions, ResilienceHandle};
pub use kv::{KvAuditSink, KvPolicyStore};
pub use memory::{MemoryKv, MemoryKvFactory};

use crate::error::Result;
use crossbeam::channel::Receiver;
use crate::iam::{Policy, Secret};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Policies grouped by subject key (normally the username)
pub type PolicyMap = HashMap<String, Vec<Policy>>;

/// Secrets by secret id
pub type SecretMap = HashMap<String, Secret>;

/// Durable source of policies and secrets
pub trait PolicyStore: Send + Sync {
    fn list_policies(&self) -> Result<PolicyMap>;
    fn list_secrets(&self) -> Result<SecretMap>;
}

/// Durable destination for audit batches
pub trait AuditSink: Send + Sync {
    fn append_batch(&self, key: &str, records: &[Vec<u8>]) -> Result<()>;
}

/// Logical connection pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// Durable reads and audit appends
    Primary,
    /// Cache-side traffic (notifications, probes)
    Cache,
}

impl PoolKind {
    pub const ALL: [PoolKind; 2] = [PoolKind::Primary, PoolKind::Cache];

    pub fn as_str(&self) -> &'static str {
        match self {
            PoolKind::Primary => "primary",
            PoolKind::Cache => "cache",
        }
    }

    fn index(&self) -> usize {
        match self {
            PoolKind::Primary => 0,
            PoolKind::Cache => 1,
        }
    }
}

/// Minimal key/value client surface used by the core
pub trait KvClient: Send + Sync {
    /// Set `key` to `value`, expiring after `ttl` (zero keeps it forever)
    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Append values to the list stored at `key`
    fn append(&self, key: &str, values: &[Vec<u8>]) -> Result<()>;

    /// Publish a message on a notification channel
    fn publish(&self, channel: &str, message: &str) -> Result<()>;

    /// Receive every message later published on `channel`
    fn subscribe(&self, channel: &str) -> Result<Receiver<String>>;
}

/// Creates client handles for a pool
pub trait ClientFactory: Send + Sync {
    fn connect(&self, pool: PoolKind) -> Result<Arc<dyn KvClient>>;
}

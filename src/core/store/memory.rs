//! In-process key/value store
//!
//! Backs tests and the standalone binary. Supports TTLs, list appends,
//! publish/subscribe over crossbeam channels and fault injection so that
//! outages can be simulated.

use super::{ClientFactory, KvClient, PoolKind};
use crate::error::{AuthzError, Result};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

/// Shared in-memory store
#[derive(Default)]
pub struct MemoryKv {
    values: RwLock<HashMap<String, Entry>>,
    lists: RwLock<HashMap<String, Vec<Vec<u8>>>>,
    subscribers: Mutex<HashMap<String, Vec<Sender<String>>>>,
    down: AtomicBool,
    fail_next: AtomicUsize,
}

impl MemoryKv {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulate an outage (`true`) or recovery (`false`)
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Make the next `count` operations fail
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Contents of the list at `key`
    pub fn list(&self, key: &str) -> Vec<Vec<u8>> {
        self.lists.read().get(key).cloned().unwrap_or_default()
    }

    /// Receive every message published on `channel` from now on
    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(AuthzError::Store("connection refused".to_string()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(AuthzError::Store("injected failure".to_string()));
        }
        Ok(())
    }
}

impl KvClient for MemoryKv {
    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.check()?;
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        self.values.write().insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        let values = self.values.read();
        Ok(values.get(key).and_then(|entry| match entry.expires_at {
            Some(at) if at <= Instant::now() => None,
            _ => Some(entry.value.clone()),
        }))
    }

    fn append(&self, key: &str, values: &[Vec<u8>]) -> Result<()> {
        self.check()?;
        self.lists
            .write()
            .entry(key.to_string())
            .or_default()
            .extend_from_slice(values);
        Ok(())
    }

    fn publish(&self, channel: &str, message: &str) -> Result<()> {
        self.check()?;
        if let Some(senders) = self.subscribers.lock().get_mut(channel) {
            senders.retain(|tx| tx.send(message.to_string()).is_ok());
        }
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> Result<Receiver<String>> {
        self.check()?;
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

/// Hands out the same [`MemoryKv`] for every pool
pub struct MemoryKvFactory {
    kv: Arc<MemoryKv>,
    connects: AtomicUsize,
}

impl MemoryKvFactory {
    pub fn new(kv: Arc<MemoryKv>) -> Self {
        MemoryKvFactory {
            kv,
            connects: AtomicUsize::new(0),
        }
    }

    /// Number of client handles created so far
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl ClientFactory for MemoryKvFactory {
    fn connect(&self, _pool: PoolKind) -> Result<Arc<dyn KvClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.kv.clone() as Arc<dyn KvClient>)
    }
}

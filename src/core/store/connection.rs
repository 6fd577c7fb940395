//! Connection resilience for the backing key/value store
//!
//! Owns one lazily-created client handle per [`PoolKind`] and a background
//! loop that probes each pool on a fixed tick:
//! - a probe is a write followed by a read of a sentinel key, bounded by a timeout
//! - a failed probe recreates that pool's handle and marks the store unreachable
//! - at most one probe per pool is in flight; a pool whose previous probe has
//!   not returned yet counts as failed
//! - a pass where every probe succeeds marks the store reachable
//!
//! The reachable flag is written only by the health check and read lock-free
//! by everyone else through [`ConnectionManager::connected`].

use super::{ClientFactory, KvClient, PoolKind};
use crate::error::{AuthzError, Result};
use crossbeam::channel::{bounded, select, tick, Receiver, Sender, TryRecvError};
use crossbeam::utils::CachePadded;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

const PROBE_KEY: &str = "authzd-probe-key";
const PROBE_VALUE: &[u8] = b"authzd-probe-val";

/// Health check timing
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    /// Interval between health checks
    pub health_check_interval: Duration,
    /// Upper bound for a single probe
    pub probe_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            health_check_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Keeps the backing store reachable across transient outages
pub struct ConnectionManager {
    factory: Arc<dyn ClientFactory>,
    clients: [RwLock<Option<Arc<dyn KvClient>>>; 2],
    /// Result channel of a probe that outlived its timeout
    pending: [Mutex<Option<Receiver<bool>>>; 2],
    up: CachePadded<AtomicBool>,
    options: ConnectionOptions,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn ClientFactory>, options: ConnectionOptions) -> Arc<Self> {
        Arc::new(ConnectionManager {
            factory,
            clients: [RwLock::new(None), RwLock::new(None)],
            pending: [Mutex::new(None), Mutex::new(None)],
            up: CachePadded::new(AtomicBool::new(false)),
            options,
        })
    }

    /// Whether the last health check found every pool usable
    pub fn connected(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Client handle for `pool`, failing fast while the store is down
    pub fn client(&self, pool: PoolKind) -> Result<Arc<dyn KvClient>> {
        if !self.connected() {
            return Err(AuthzError::StoreDown);
        }
        self.clients[pool.index()]
            .read()
            .clone()
            .ok_or(AuthzError::StoreDown)
    }

    /// Run one health check pass over every pool and publish the result
    pub fn check(&self) -> bool {
        let reachable = PoolKind::ALL.iter().all(|&pool| self.check_pool(pool));

        let was = self.up.swap(reachable, Ordering::AcqRel);
        match (was, reachable) {
            (true, false) => warn!("Backing store became unreachable"),
            (false, true) => info!("Backing store is reachable"),
            _ => debug!(reachable, "Store health check complete"),
        }
        reachable
    }

    /// Connect synchronously (best effort), then keep checking in the background
    ///
    /// A failed initial connection does not fail startup; the loop retries on
    /// every tick until cancelled through the returned handle.
    pub fn start(self: &Arc<Self>) -> Result<ResilienceHandle> {
        if !self.check() {
            warn!("Initial connection to backing store failed, retrying in background");
        }

        let (cancel_tx, cancel_rx) = bounded::<()>(0);
        let manager = Arc::clone(self);
        let interval = self.options.health_check_interval;

        let thread = thread::Builder::new()
            .name("store-health".to_string())
            .spawn(move || {
                let ticker = tick(interval);
                loop {
                    select! {
                        recv(cancel_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            manager.check();
                        }
                    }
                }
                debug!("Store health loop stopped");
            })?;

        Ok(ResilienceHandle {
            cancel: Mutex::new(Some(cancel_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    fn check_pool(&self, pool: PoolKind) -> bool {
        let client = match self.ensure_client(pool) {
            Ok(client) => client,
            Err(e) => {
                warn!(pool = pool.as_str(), error = %e, "Failed to create store client");
                return false;
            }
        };

        if self.probe(pool, client) {
            return true;
        }

        warn!(pool = pool.as_str(), "Store probe failed, recreating client");
        *self.clients[pool.index()].write() = self.factory.connect(pool).ok();
        false
    }

    fn ensure_client(&self, pool: PoolKind) -> Result<Arc<dyn KvClient>> {
        let slot = &self.clients[pool.index()];
        if let Some(client) = slot.read().as_ref() {
            return Ok(Arc::clone(client));
        }

        let client = self.factory.connect(pool)?;
        *slot.write() = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Write then read the sentinel key, giving up after the probe timeout
    fn probe(&self, pool: PoolKind, client: Arc<dyn KvClient>) -> bool {
        let mut pending = self.pending[pool.index()].lock();
        if let Some(rx) = pending.as_ref() {
            match rx.try_recv() {
                Err(TryRecvError::Empty) => {
                    debug!(pool = pool.as_str(), "Previous store probe still running");
                    return false;
                }
                Ok(_) | Err(TryRecvError::Disconnected) => *pending = None,
            }
        }

        let (tx, rx) = bounded(1);
        let spawned = thread::Builder::new()
            .name("store-probe".to_string())
            .spawn(move || {
                let ok = client.set(PROBE_KEY, PROBE_VALUE, Duration::from_secs(1)).is_ok()
                    && matches!(client.get(PROBE_KEY), Ok(Some(_)));
                let _ = tx.send(ok);
            });

        if spawned.is_err() {
            return false;
        }

        match rx.recv_timeout(self.options.probe_timeout) {
            Ok(ok) => ok,
            Err(_) => {
                // Parked until the hung client returns
                *pending = Some(rx);
                false
            }
        }
    }
}

/// Cancels the background health loop
pub struct ResilienceHandle {
    cancel: Mutex<Option<Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ResilienceHandle {
    /// Stop the loop and wait for it to exit. Idempotent.
    pub fn cancel(&self) {
        drop(self.cancel.lock().take());
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ResilienceHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

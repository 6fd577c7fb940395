//! Cache invalidation listener
//!
//! Consumes invalidation notices (e.g. a store subscription) and reloads the
//! [`PolicyCache`]. Notices that pile up while a reload runs are coalesced
//! into the next reload. A failed reload keeps the previous snapshot and is
//! retried on the next notice.

use crate::error::Result;
use crate::iam::PolicyCache;
use crossbeam::channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

pub struct InvalidationListener {
    cancel: Mutex<Option<Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    reloads: Arc<AtomicU64>,
}

impl InvalidationListener {
    /// Spawn a listener reloading `cache` on every notice from `notices`
    pub fn spawn(cache: Arc<PolicyCache>, notices: Receiver<String>) -> Result<Self> {
        let (cancel_tx, cancel_rx) = bounded::<()>(0);
        let reloads = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&reloads);

        let thread = thread::Builder::new()
            .name("cache-invalidation".to_string())
            .spawn(move || {
                loop {
                    select! {
                        recv(cancel_rx) -> _ => break,
                        recv(notices) -> notice => {
                            let Ok(notice) = notice else { break };
                            let coalesced = notices.try_iter().count();
                            debug!(notice = %notice, coalesced, "Cache invalidation received");

                            if let Err(e) = cache.reload() {
                                warn!(error = %e, "Reload after invalidation failed");
                            }
                            counter.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                debug!("Cache invalidation listener stopped");
            })?;

        Ok(InvalidationListener {
            cancel: Mutex::new(Some(cancel_tx)),
            thread: Mutex::new(Some(thread)),
            reloads,
        })
    }

    /// Reload attempts made so far
    pub fn reloads(&self) -> u64 {
        self.reloads.load(Ordering::Relaxed)
    }

    /// Stop listening and join the thread. Idempotent.
    pub fn stop(&self) {
        drop(self.cancel.lock().take());
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for InvalidationListener {
    fn drop(&mut self) {
        self.stop();
    }
}

//! Shutdown manager driven by an in-process trigger

use super::{GracefulShutdown, ShutdownManager};
use crate::error::{AuthzError, Result};
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Fires a [`ChannelShutdownManager`]; cloneable and usable from any thread
#[derive(Clone)]
pub struct ShutdownTrigger {
    tx: Sender<String>,
}

impl ShutdownTrigger {
    /// Request shutdown, recording why. Later calls are ignored.
    pub fn fire(&self, reason: impl Into<String>) {
        let _ = self.tx.try_send(reason.into());
    }
}

/// Shuts down when its [`ShutdownTrigger`] fires
///
/// Signal handlers, EOF on an input stream or an admin command all funnel
/// into the trigger. Once every trigger is dropped without firing, the
/// listener thread exits.
pub struct ChannelShutdownManager {
    name: String,
    triggers: Mutex<Option<Receiver<String>>>,
    finished_tx: Sender<()>,
    finished_rx: Receiver<()>,
}

impl ChannelShutdownManager {
    pub fn new(name: impl Into<String>) -> (Arc<Self>, ShutdownTrigger) {
        let (tx, rx) = bounded(1);
        let (finished_tx, finished_rx) = unbounded();
        let manager = Arc::new(ChannelShutdownManager {
            name: name.into(),
            triggers: Mutex::new(Some(rx)),
            finished_tx,
            finished_rx,
        });
        (manager, ShutdownTrigger { tx })
    }

    /// Block until the shutdown sequence has finished
    pub fn wait(&self) {
        let _ = self.finished_rx.recv();
    }

    /// Like [`ChannelShutdownManager::wait`], giving up after `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.finished_rx.recv_timeout(timeout).is_ok()
    }
}

impl ShutdownManager for ChannelShutdownManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(self: Arc<Self>, shutdown: Arc<GracefulShutdown>) -> Result<()> {
        let triggers = self.triggers.lock().take().ok_or_else(|| AuthzError::Shutdown {
            manager: self.name.clone(),
            reason: "already started".to_string(),
        })?;

        thread::Builder::new()
            .name(format!("shutdown-{}", self.name))
            .spawn(move || match triggers.recv() {
                Ok(reason) => {
                    info!(manager = %self.name, reason = %reason, "Shutdown triggered");
                    shutdown.start_shutdown(&*self);
                }
                Err(_) => debug!(manager = %self.name, "Shutdown triggers dropped"),
            })?;
        Ok(())
    }

    fn shutdown_start(&self) -> Result<()> {
        debug!(manager = %self.name, "Running shutdown callbacks");
        Ok(())
    }

    fn shutdown_finish(&self) -> Result<()> {
        self.finished_tx
            .send(())
            .map_err(|e| AuthzError::Shutdown {
                manager: self.name.clone(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_trigger_runs_sequence() {
        let shutdown = GracefulShutdown::new();
        let (manager, trigger) = ChannelShutdownManager::new("stdin");
        shutdown.add_manager(manager.clone());

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        shutdown.add_callback(move |name: &str| -> Result<()> {
            assert_eq!(name, "stdin");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        shutdown.start().unwrap();
        assert!(!manager.wait_timeout(Duration::from_millis(20)));

        trigger.fire("eof");
        trigger.fire("again");
        assert!(manager.wait_timeout(Duration::from_secs(2)));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_start_twice_fails() {
        let shutdown = GracefulShutdown::new();
        let (manager, _trigger) = ChannelShutdownManager::new("admin");
        shutdown.add_manager(manager.clone());

        shutdown.start().unwrap();
        assert!(manager.clone().start(shutdown.clone()).is_err());
    }
}

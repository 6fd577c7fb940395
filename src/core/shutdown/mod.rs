//! Graceful shutdown coordination
//!
//! A [`GracefulShutdown`] holds independent shutdown callbacks and the
//! managers that can trigger shutdown. When a manager fires:
//! 1. the manager's [`ShutdownManager::shutdown_start`] hook runs
//! 2. every callback runs concurrently; failures are collected, not raised
//! 3. the manager's [`ShutdownManager::shutdown_finish`] hook runs
//!
//! Callbacks run in no particular order. Dependent steps (stop the audit
//! pipeline, then cancel the store health loop) belong in one callback.

mod channel;

pub use channel::{ChannelShutdownManager, ShutdownTrigger};

use crate::error::{AuthzError, Result};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

/// Work performed on shutdown; receives the triggering manager's name
pub trait ShutdownCallback: Send + Sync {
    fn on_shutdown(&self, manager: &str) -> Result<()>;
}

impl<F> ShutdownCallback for F
where
    F: Fn(&str) -> Result<()> + Send + Sync,
{
    fn on_shutdown(&self, manager: &str) -> Result<()> {
        self(manager)
    }
}

/// A source of shutdown triggers (signal listener, admin channel, ...)
pub trait ShutdownManager: Send + Sync {
    fn name(&self) -> &str;

    /// Begin listening; call [`GracefulShutdown::start_shutdown`] when triggered
    fn start(self: Arc<Self>, shutdown: Arc<GracefulShutdown>) -> Result<()>;

    fn shutdown_start(&self) -> Result<()>;

    /// Last step of a shutdown
    fn shutdown_finish(&self) -> Result<()>;
}

/// Receives every error raised during shutdown
pub trait ErrorHandler: Send + Sync {
    fn on_error(&self, error: &AuthzError);
}

impl<F> ErrorHandler for F
where
    F: Fn(&AuthzError) + Send + Sync,
{
    fn on_error(&self, error: &AuthzError) {
        self(error)
    }
}

/// Coordinates shutdown callbacks across trigger sources
#[derive(Default)]
pub struct GracefulShutdown {
    callbacks: RwLock<Vec<Arc<dyn ShutdownCallback>>>,
    managers: RwLock<Vec<Arc<dyn ShutdownManager>>>,
    error_handler: RwLock<Option<Arc<dyn ErrorHandler>>>,
    in_progress: AtomicBool,
}

impl GracefulShutdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_callback(&self, callback: impl ShutdownCallback + 'static) {
        self.callbacks.write().push(Arc::new(callback));
    }

    pub fn add_manager(&self, manager: Arc<dyn ShutdownManager>) {
        self.managers.write().push(manager);
    }

    /// Replace the default handler, which logs
    pub fn set_error_handler(&self, handler: impl ErrorHandler + 'static) {
        *self.error_handler.write() = Some(Arc::new(handler));
    }

    /// Start every registered manager
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let managers = self.managers.read().clone();
        for manager in managers {
            let name = manager.name().to_string();
            manager.start(Arc::clone(self)).map_err(|e| AuthzError::Shutdown {
                manager: name,
                reason: format!("failed to start: {e}"),
            })?;
        }
        Ok(())
    }

    /// Whether a shutdown has been triggered
    pub fn is_shutting_down(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Run the shutdown sequence for `manager`
    ///
    /// Only the first trigger runs the sequence; later calls return
    /// immediately with no errors. Returns every error that was raised.
    pub fn start_shutdown(&self, manager: &dyn ShutdownManager) -> Vec<AuthzError> {
        if self.in_progress.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }

        let name = manager.name();
        info!(manager = name, "Shutdown started");

        let mut errors = Vec::new();
        if let Err(e) = manager.shutdown_start() {
            errors.push(e);
        }

        let callbacks = self.callbacks.read().clone();
        thread::scope(|scope| {
            let handles: Vec<_> = callbacks
                .iter()
                .map(|callback| scope.spawn(move || callback.on_shutdown(name)))
                .collect();

            for handle in handles {
                let outcome = match handle.join() {
                    Ok(outcome) => outcome,
                    Err(_) => Err(AuthzError::Pipeline("shutdown callback panicked".into())),
                };
                if let Err(e) = outcome {
                    errors.push(AuthzError::Shutdown {
                        manager: name.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        });

        if let Err(e) = manager.shutdown_finish() {
            errors.push(e);
        }

        for e in &errors {
            self.report(e);
        }
        info!(
            manager = name,
            callbacks = callbacks.len(),
            failures = errors.len(),
            "Shutdown finished"
        );
        errors
    }

    fn report(&self, e: &AuthzError) {
        match self.error_handler.read().as_ref() {
            Some(handler) => handler.on_error(e),
            None => error!(error = %e, "Shutdown error"),
        }
    }
}

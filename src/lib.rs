//! # authzd - Authorization Decision Core
//!
//! `authzd` decides whether a subject may perform an action on a resource and
//! records every decision for audit. It combines:
//!
//! - **Policy cache** holding one consistent snapshot of policies and secrets,
//!   reloaded wholesale from a durable store
//! - **Decision engine** with deny-overrides resolution, regex patterns and
//!   pluggable conditions
//! - **Audit pipeline** batching records through a bounded queue and a
//!   worker pool, never blocking a decision on storage
//! - **Connection resilience** keeping the backing key/value store reachable
//! - **Graceful shutdown** draining audit buffers before the store goes away
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use authzd::{Authorizer, DecisionRequest, MemoryKv, MemoryKvFactory, Result};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<()> {
//! let kv = MemoryKv::new();
//! let authorizer = Authorizer::builder()
//!     .client_factory(Arc::new(MemoryKvFactory::new(kv)))
//!     .build()?;
//! authorizer.start()?;
//!
//! let request = DecisionRequest::new("users:alice", "read", "doc:1")
//!     .with_context("username", "alice");
//! let response = authorizer.authorize(&request);
//! assert!(response.denied);
//!
//! authorizer.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules so crate:: paths in core resolve
pub use crate::core::{audit, config, error, iam, reload, shutdown, store};

// Re-export core types that users need
pub use crate::core::{
    audit::{AuditPipeline, AuditRecord, AuditStats, Conclusion},
    config::Config,
    error::{AuthzError, Result},
    iam::{
        ConditionRegistry, DecisionEngine, DecisionRequest, DecisionResponse, Effect,
        PatternMatcher, Policy, PolicyCache, Secret,
    },
    reload::InvalidationListener,
    shutdown::{ChannelShutdownManager, GracefulShutdown, ShutdownTrigger},
    store::{
        AuditSink, ClientFactory, ConnectionManager, KvAuditSink, KvClient, KvPolicyStore,
        MemoryKv, MemoryKvFactory, PolicyStore,
    },
};

use crate::store::PoolKind;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Message published to request a cache reload
pub const INVALIDATION_NOTICE: &str = "invalidate";

/// A fully wired authorization service
///
/// Owns the connection manager, the policy cache, the decision engine and
/// the audit pipeline, and stops them in dependency order.
///
/// # Examples
///
/// ```rust,no_run
/// use authzd::{Authorizer, MemoryKv, MemoryKvFactory};
/// use std::sync::Arc;
///
/// let authorizer = Authorizer::builder()
///     .client_factory(Arc::new(MemoryKvFactory::new(MemoryKv::new())))
///     .build()?;
/// authorizer.start()?;
/// println!("store reachable: {}", authorizer.connected());
/// # Ok::<(), authzd::AuthzError>(())
/// ```
pub struct Authorizer {
    config: Config,
    connections: Arc<ConnectionManager>,
    resilience: Mutex<Option<store::ResilienceHandle>>,
    cache: Arc<PolicyCache>,
    engine: DecisionEngine,
    audit: Arc<AuditPipeline>,
    listener: Mutex<Option<InvalidationListener>>,
}

impl Authorizer {
    pub fn builder() -> AuthorizerBuilder {
        AuthorizerBuilder::new()
    }

    /// Connect to the store, load the cache and start the audit workers
    ///
    /// An unreachable store does not fail startup: the health loop keeps
    /// retrying and the cache stays empty (every request is denied) until a
    /// later reload succeeds.
    pub fn start(&self) -> Result<()> {
        let handle = self.connections.start()?;
        *self.resilience.lock() = Some(handle);

        if let Err(e) = self.cache.reload() {
            warn!(error = %e, "Initial policy load failed, serving from an empty cache");
        }

        self.audit.start(self.config.audit.pool_size)?;
        info!(
            connected = self.connected(),
            subjects = self.cache.policy_keys(),
            "Authorizer started"
        );
        Ok(())
    }

    /// Decide a request; see [`DecisionEngine::authorize`]
    pub fn authorize(&self, request: &DecisionRequest) -> DecisionResponse {
        self.engine.authorize(request)
    }

    /// Reload the policy cache from the store
    pub fn reload(&self) -> Result<()> {
        self.cache.reload()
    }

    /// Whether the backing store is currently reachable
    pub fn connected(&self) -> bool {
        self.connections.connected()
    }

    /// Subscribe to the notification channel through the cache pool and
    /// reload the cache whenever a notice arrives
    pub fn listen_for_invalidations(&self) -> Result<()> {
        let notices = self
            .connections
            .client(PoolKind::Cache)?
            .subscribe(&self.config.store.notification_channel)?;
        let listener = InvalidationListener::spawn(Arc::clone(&self.cache), notices)?;
        if let Some(previous) = self.listener.lock().replace(listener) {
            previous.stop();
        }
        Ok(())
    }

    /// Ask every instance listening on the notification channel to reload
    pub fn publish_invalidation(&self) -> Result<()> {
        self.connections
            .client(PoolKind::Cache)?
            .publish(&self.config.store.notification_channel, INVALIDATION_NOTICE)
    }

    /// Stop the audit pipeline (draining it), then the background loops. Idempotent.
    pub fn shutdown(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.stop();
        }

        // Audit flushes go through the store, so it must drain first
        self.audit.stop();

        if let Some(handle) = self.resilience.lock().take() {
            handle.cancel();
        }
        debug!("Authorizer shut down");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<PolicyCache> {
        &self.cache
    }

    pub fn audit(&self) -> &Arc<AuditPipeline> {
        &self.audit
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }
}

impl Drop for Authorizer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Builder for [`Authorizer`]
///
/// Only the client factory is required. The policy store and audit sink
/// default to the key/value implementations over the managed connection.
pub struct AuthorizerBuilder {
    config: Config,
    factory: Option<Arc<dyn ClientFactory>>,
    policy_store: Option<Arc<dyn PolicyStore>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    conditions: Option<ConditionRegistry>,
}

impl AuthorizerBuilder {
    pub fn new() -> Self {
        AuthorizerBuilder {
            config: Config::default(),
            factory: None,
            policy_store: None,
            audit_sink: None,
            conditions: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn client_factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Read policies from `store` instead of the key/value snapshots
    pub fn policy_store(mut self, store: Arc<dyn PolicyStore>) -> Self {
        self.policy_store = Some(store);
        self
    }

    /// Write audit batches to `sink` instead of the key/value list
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    /// Use a custom set of condition types
    pub fn conditions(mut self, conditions: ConditionRegistry) -> Self {
        self.conditions = Some(conditions);
        self
    }

    pub fn build(self) -> Result<Authorizer> {
        self.config.validate_all()?;
        let factory = self
            .factory
            .ok_or_else(|| AuthzError::Config("a client factory must be set".to_string()))?;

        let store_options = &self.config.store;
        let connections = ConnectionManager::new(factory, store_options.connection_options());

        let policy_store: Arc<dyn PolicyStore> = match self.policy_store {
            Some(store) => store,
            None => Arc::new(KvPolicyStore::new(
                Arc::clone(&connections),
                store_options.policies_key.clone(),
                store_options.secrets_key.clone(),
            )),
        };
        let audit_sink: Arc<dyn AuditSink> = match self.audit_sink {
            Some(sink) => sink,
            None => Arc::new(KvAuditSink::new(Arc::clone(&connections))),
        };

        let cache = Arc::new(PolicyCache::new(policy_store));
        let audit = Arc::new(AuditPipeline::new(self.config.audit.clone(), audit_sink));

        let mut engine = DecisionEngine::new(cache.clone(), Arc::clone(&audit))
            .with_matcher(PatternMatcher::new(self.config.authorization.pattern_cache_size))
            .with_subject_context_key(self.config.authorization.subject_context_key.clone());
        if let Some(conditions) = self.conditions {
            engine = engine.with_conditions(conditions);
        }

        debug!("Authorizer built");
        Ok(Authorizer {
            config: self.config,
            connections,
            resilience: Mutex::new(None),
            cache,
            engine,
            audit,
            listener: Mutex::new(None),
        })
    }
}

impl Default for AuthorizerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

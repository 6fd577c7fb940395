//! Condition evaluation for policies
//!
//! Conditions refine a policy match using the request context. Each condition
//! type is registered by name in a [`ConditionRegistry`]; a policy's
//! [`ConditionSpec`] is turned into a [`Condition`] by looking its type up.
//!
//! Built-in types:
//! - `cidr` (`CIDRCondition`): context value is an IP inside `options.range`
//! - `string_equal` (`StringEqualCondition`): context value equals `options.equals`
//! - `boolean` (`BooleanCondition`): context value is the bool `options.value`
//! - `equals_subject` (`EqualsSubjectCondition`): context value equals the request subject
//!
//! Built conditions are kept in an LRU cache keyed by type and options, so a
//! CIDR range is parsed once rather than on every decision.

use super::policy::{ConditionSpec, ContextValue, DecisionRequest};
use crate::error::{AuthzError, Result};
use ipnetwork::IpNetwork;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Built conditions kept by a registry
pub const DEFAULT_CONDITION_CACHE_SIZE: usize = 1024;

/// A condition checked against one context value of a request
pub trait Condition: Send + Sync {
    /// `value` is the context entry named by the condition's key, if present
    fn evaluate(&self, value: Option<&ContextValue>, request: &DecisionRequest) -> bool;
}

/// Constructor registered for a condition type
pub type ConditionFactory = fn(&Map<String, Value>) -> Result<Box<dyn Condition>>;

/// Network range check
#[derive(Debug, Clone)]
pub struct CidrCondition {
    network: IpNetwork,
}

impl CidrCondition {
    pub fn new(range: &str) -> Result<Self> {
        let network = range
            .parse::<IpNetwork>()
            .map_err(|e| AuthzError::InvalidCondition {
                kind: "cidr".to_string(),
                reason: format!("invalid range {range:?}: {e}"),
            })?;
        Ok(CidrCondition { network })
    }

    fn from_options(options: &Map<String, Value>) -> Result<Box<dyn Condition>> {
        // "cidr" is the option name used by older policy documents
        let range = string_option(options, "range")
            .or_else(|_| string_option(options, "cidr"))
            .map_err(|_| missing_option("cidr", "range"))?;
        Ok(Box::new(Self::new(range)?))
    }
}

impl Condition for CidrCondition {
    fn evaluate(&self, value: Option<&ContextValue>, _request: &DecisionRequest) -> bool {
        value
            .and_then(ContextValue::as_str)
            .and_then(|ip| ip.parse::<IpAddr>().ok())
            .map(|ip| self.network.contains(ip))
            .unwrap_or(false)
    }
}

/// Exact string equality
#[derive(Debug, Clone)]
pub struct StringEqualCondition {
    equals: String,
}

impl StringEqualCondition {
    fn from_options(options: &Map<String, Value>) -> Result<Box<dyn Condition>> {
        let equals = string_option(options, "equals")
            .map_err(|_| missing_option("string_equal", "equals"))?;
        Ok(Box::new(StringEqualCondition {
            equals: equals.to_string(),
        }))
    }
}

impl Condition for StringEqualCondition {
    fn evaluate(&self, value: Option<&ContextValue>, _request: &DecisionRequest) -> bool {
        value.and_then(ContextValue::as_str) == Some(self.equals.as_str())
    }
}

/// Boolean flag check
#[derive(Debug, Clone)]
pub struct BooleanCondition {
    value: bool,
}

impl BooleanCondition {
    fn from_options(options: &Map<String, Value>) -> Result<Box<dyn Condition>> {
        let value = options
            .get("value")
            .and_then(Value::as_bool)
            .ok_or_else(|| missing_option("boolean", "value"))?;
        Ok(Box::new(BooleanCondition { value }))
    }
}

impl Condition for BooleanCondition {
    fn evaluate(&self, value: Option<&ContextValue>, _request: &DecisionRequest) -> bool {
        value.and_then(ContextValue::as_bool) == Some(self.value)
    }
}

/// Context value must equal the request subject
#[derive(Debug, Clone, Default)]
pub struct EqualsSubjectCondition;

impl EqualsSubjectCondition {
    fn from_options(_options: &Map<String, Value>) -> Result<Box<dyn Condition>> {
        Ok(Box::new(EqualsSubjectCondition))
    }
}

impl Condition for EqualsSubjectCondition {
    fn evaluate(&self, value: Option<&ContextValue>, request: &DecisionRequest) -> bool {
        value.and_then(ContextValue::as_str) == Some(request.subject.as_str())
    }
}

/// Condition types by name
pub struct ConditionRegistry {
    factories: HashMap<String, ConditionFactory>,
    built: Mutex<LruCache<String, Arc<dyn Condition>>>,
}

impl ConditionRegistry {
    /// Registry with no condition types
    pub fn empty() -> Self {
        Self::with_capacity(DEFAULT_CONDITION_CACHE_SIZE)
    }

    /// Registry with no condition types, caching up to `capacity` built conditions
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        ConditionRegistry {
            factories: HashMap::new(),
            built: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Register (or replace) a condition type
    pub fn register(&mut self, kind: impl Into<String>, factory: ConditionFactory) {
        self.factories.insert(kind.into(), factory);
        self.built.get_mut().clear();
    }

    /// Number of built conditions currently cached
    pub fn cached(&self) -> usize {
        self.built.lock().len()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Build the condition described by `spec`
    pub fn build(&self, spec: &ConditionSpec) -> Result<Box<dyn Condition>> {
        let factory = self
            .factories
            .get(&spec.kind)
            .ok_or_else(|| AuthzError::UnknownCondition(spec.kind.clone()))?;
        factory(&spec.options)
    }

    /// Evaluate one condition spec against a request
    ///
    /// Specs that fail to build are not cached and fail again on every call.
    pub fn evaluate(&self, spec: &ConditionSpec, request: &DecisionRequest) -> Result<bool> {
        let condition = self.cached_build(spec)?;
        Ok(condition.evaluate(request.context.get(&spec.key), request))
    }

    fn cached_build(&self, spec: &ConditionSpec) -> Result<Arc<dyn Condition>> {
        // Options are a sorted map, so equal specs serialize identically
        let key = format!("{}\0{}", spec.kind, Value::Object(spec.options.clone()));
        if let Some(condition) = self.built.lock().get(&key) {
            return Ok(Arc::clone(condition));
        }

        let condition: Arc<dyn Condition> = Arc::from(self.build(spec)?);
        self.built.lock().put(key, Arc::clone(&condition));
        Ok(condition)
    }
}

impl Default for ConditionRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("cidr", CidrCondition::from_options);
        registry.register("CIDRCondition", CidrCondition::from_options);
        registry.register("string_equal", StringEqualCondition::from_options);
        registry.register("StringEqualCondition", StringEqualCondition::from_options);
        registry.register("boolean", BooleanCondition::from_options);
        registry.register("BooleanCondition", BooleanCondition::from_options);
        registry.register("equals_subject", EqualsSubjectCondition::from_options);
        registry.register("EqualsSubjectCondition", EqualsSubjectCondition::from_options);
        registry
    }
}

fn string_option<'a>(options: &'a Map<String, Value>, name: &str) -> Result<&'a str> {
    options
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| AuthzError::Config(format!("missing option {name}")))
}

fn missing_option(kind: &str, option: &str) -> AuthzError {
    AuthzError::InvalidCondition {
        kind: kind.to_string(),
        reason: format!("missing string option {option:?}"),
    }
}

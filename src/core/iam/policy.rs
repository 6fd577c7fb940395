//! Policy, secret, and decision request/response types
//!
//! Policies bind subject/action/resource patterns and optional conditions to
//! an allow or deny effect. They are loaded wholesale into the policy cache
//! and never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Effect of a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    /// Allow the action
    Allow,
    /// Deny the action (takes precedence over Allow)
    Deny,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::Allow => "allow",
            Effect::Deny => "deny",
        }
    }
}

/// A condition attached to a policy.
///
/// `key` names the request context entry the condition inspects, `kind` is the
/// registered condition type, `options` configure it.
///
/// ```json
/// {"key": "remoteIP", "type": "cidr", "options": {"range": "10.0.0.0/8"}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionSpec {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

/// A single access-control policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,

    #[serde(default)]
    pub description: String,

    /// Subject pattern (e.g. `users:<alice|bob>`)
    pub subject: String,

    /// Action pattern (e.g. `<read|list>`)
    pub action: String,

    /// Resource pattern (e.g. `resources:articles:<.*>`)
    pub resource: String,

    pub effect: Effect,

    /// Conditions, evaluated in order; all must hold
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ConditionSpec>,
}

impl Policy {
    /// Create a new unconditioned policy
    pub fn new(
        id: impl Into<String>,
        subject: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
        effect: Effect,
    ) -> Self {
        Policy {
            id: id.into(),
            description: String::new(),
            subject: subject.into(),
            action: action.into(),
            resource: resource.into(),
            effect,
            conditions: Vec::new(),
        }
    }

    /// Attach a condition
    pub fn with_condition(
        mut self,
        key: impl Into<String>,
        kind: impl Into<String>,
        options: serde_json::Value,
    ) -> Self {
        let options = match options {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        self.conditions.push(ConditionSpec {
            key: key.into(),
            kind: kind.into(),
            options,
        });
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Parse a policy from a JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize policy to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Signing secret used by the token verification layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub username: String,
    pub secret_id: String,
    pub secret_key: String,
    /// Expiry as Unix epoch seconds; 0 never expires
    #[serde(default)]
    pub expires: i64,
}

impl Secret {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires != 0 && self.expires <= now
    }
}

/// Value in a decision request context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    String(String),
    Number(f64),
    Bool(bool),
    Array(Vec<ContextValue>),
    Object(BTreeMap<String, ContextValue>),
    Null,
}

impl ContextValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ContextValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ContextValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[ContextValue]> {
        match self {
            ContextValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ContextValue::Null)
    }
}

impl From<&str> for ContextValue {
    fn from(s: &str) -> Self {
        ContextValue::String(s.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(s: String) -> Self {
        ContextValue::String(s)
    }
}

impl From<bool> for ContextValue {
    fn from(b: bool) -> Self {
        ContextValue::Bool(b)
    }
}

/// An access request to decide
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub subject: String,
    pub action: String,
    pub resource: String,
    #[serde(default)]
    pub context: HashMap<String, ContextValue>,
}

impl DecisionRequest {
    pub fn new(
        subject: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        DecisionRequest {
            subject: subject.into(),
            action: action.into(),
            resource: resource.into(),
            context: HashMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Outcome of a decision.
///
/// Exactly one of `allowed`/`denied` is true. Internal failures are denials
/// with `error` populated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionResponse {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub denied: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl DecisionResponse {
    pub fn allow() -> Self {
        DecisionResponse {
            allowed: true,
            ..Default::default()
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        DecisionResponse {
            denied: true,
            reason: reason.into(),
            ..Default::default()
        }
    }

    pub fn error(reason: impl Into<String>, error: impl Into<String>) -> Self {
        DecisionResponse {
            denied: true,
            reason: reason.into(),
            error: error.into(),
            ..Default::default()
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

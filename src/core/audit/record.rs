//! Audit record emitted for every decision

use crate::config::AuditOptions;
use crate::iam::{DecisionRequest, DecisionResponse, Policy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome recorded for a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Conclusion {
    Allowed,
    Denied,
    /// Denied because the decision itself failed
    Error,
}

impl Conclusion {
    pub fn of(response: &DecisionResponse) -> Self {
        if !response.error.is_empty() {
            Conclusion::Error
        } else if response.allowed {
            Conclusion::Allowed
        } else {
            Conclusion::Denied
        }
    }
}

/// One authorization decision as written to the audit sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Unix seconds
    pub create_time: i64,
    pub username: String,
    /// Effect of the deciding policy, empty when no policy decided
    pub effect: String,
    pub conclusion: Conclusion,
    pub reason: String,
    /// JSON of the request, empty unless detailed recording is on
    #[serde(default)]
    pub request: String,
    /// JSON of the candidate policies, empty unless detailed recording is on
    #[serde(default)]
    pub policies: String,
    /// JSON of the policies that matched, empty unless detailed recording is on
    #[serde(default)]
    pub deciders: String,
    pub expire_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        username: &str,
        request: &DecisionRequest,
        response: &DecisionResponse,
        pool: &[Policy],
        deciders: &[&Policy],
        options: &AuditOptions,
    ) -> Self {
        let now = Utc::now();
        let effect = deciders
            .iter()
            .find(|p| p.id == response.reason)
            .or_else(|| deciders.first())
            .map(|p| p.effect.as_str().to_string())
            .unwrap_or_default();

        let (request, policies, deciders_json) = if options.detailed_recording {
            (
                serde_json::to_string(request).unwrap_or_default(),
                serde_json::to_string(pool).unwrap_or_default(),
                serde_json::to_string(deciders).unwrap_or_default(),
            )
        } else {
            (String::new(), String::new(), String::new())
        };

        AuditRecord {
            create_time: now.timestamp(),
            username: username.to_string(),
            effect,
            conclusion: Conclusion::of(response),
            reason: response.reason.clone(),
            request,
            policies,
            deciders: deciders_json,
            expire_at: now + options.storage_expiration(),
        }
    }
}

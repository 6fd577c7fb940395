//! Deny-overrides decision engine
//!
//! For a request, the candidate policies are those cached under the
//! authenticated subject (taken from the request context). A policy matches
//! when its subject, action and resource patterns match and every one of its
//! conditions holds. Any matching deny wins; otherwise any matching allow
//! grants; otherwise the request is denied.
//!
//! Every decision, including failures, is handed to the audit pipeline.

use super::cache::PolicyCache;
use super::condition::ConditionRegistry;
use super::pattern::PatternMatcher;
use super::policy::{DecisionRequest, DecisionResponse, Effect, Policy};
use crate::audit::{AuditPipeline, AuditRecord};
use crate::config::DEFAULT_SUBJECT_CONTEXT_KEY;
use crate::error::Result;
use std::sync::Arc;
use tracing::{debug, warn};

pub const REASON_MISSING_SUBJECT: &str = "missing subject";
pub const REASON_NO_POLICIES: &str = "no policies";
pub const REASON_NO_MATCH: &str = "no matching policy";
pub const REASON_LOOKUP_FAILED: &str = "policy lookup failed";

/// Source of candidate policies for a subject key
pub trait PolicyLookup: Send + Sync {
    fn policies_for(&self, key: &str) -> Result<Option<Arc<Vec<Policy>>>>;
}

impl PolicyLookup for PolicyCache {
    fn policies_for(&self, key: &str) -> Result<Option<Arc<Vec<Policy>>>> {
        Ok(self.get_policies(key))
    }
}

/// Decides requests against cached policies
pub struct DecisionEngine {
    lookup: Arc<dyn PolicyLookup>,
    matcher: PatternMatcher,
    conditions: ConditionRegistry,
    audit: Arc<AuditPipeline>,
    subject_context_key: String,
}

impl DecisionEngine {
    pub fn new(lookup: Arc<dyn PolicyLookup>, audit: Arc<AuditPipeline>) -> Self {
        DecisionEngine {
            lookup,
            matcher: PatternMatcher::default(),
            conditions: ConditionRegistry::default(),
            audit,
            subject_context_key: DEFAULT_SUBJECT_CONTEXT_KEY.to_string(),
        }
    }

    pub fn with_matcher(mut self, matcher: PatternMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_conditions(mut self, conditions: ConditionRegistry) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_subject_context_key(mut self, key: impl Into<String>) -> Self {
        self.subject_context_key = key.into();
        self
    }

    /// Decide `request`. Never fails; errors become denials.
    pub fn authorize(&self, request: &DecisionRequest) -> DecisionResponse {
        let username = match request
            .context
            .get(&self.subject_context_key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
        {
            Some(username) => username,
            None => {
                let response = DecisionResponse::deny(REASON_MISSING_SUBJECT);
                self.record("", request, &response, &[], &[]);
                return response;
            }
        };

        let candidates = match self.lookup.policies_for(username) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(username, error = %e, "Policy lookup failed");
                let response = DecisionResponse::error(REASON_LOOKUP_FAILED, e.to_string());
                self.record(username, request, &response, &[], &[]);
                return response;
            }
        };

        let pool: &[Policy] = candidates.as_deref().map(Vec::as_slice).unwrap_or(&[]);
        if pool.is_empty() {
            let response = DecisionResponse::deny(REASON_NO_POLICIES);
            self.record(username, request, &response, pool, &[]);
            return response;
        }

        let deciders: Vec<&Policy> = pool.iter().filter(|p| self.matches(p, request)).collect();

        let response = if let Some(deny) = deciders.iter().find(|p| p.effect == Effect::Deny) {
            DecisionResponse::deny(deny.id.clone())
        } else if deciders.iter().any(|p| p.effect == Effect::Allow) {
            DecisionResponse::allow()
        } else {
            DecisionResponse::deny(REASON_NO_MATCH)
        };

        debug!(
            username,
            action = %request.action,
            resource = %request.resource,
            allowed = response.allowed,
            candidates = pool.len(),
            matched = deciders.len(),
            "Authorization decided"
        );

        self.record(username, request, &response, pool, &deciders);
        response
    }

    /// Whether `policy` applies to `request`
    ///
    /// Malformed patterns and conditions make the policy a non-match.
    pub fn matches(&self, policy: &Policy, request: &DecisionRequest) -> bool {
        let fields = [
            (&policy.subject, &request.subject),
            (&policy.action, &request.action),
            (&policy.resource, &request.resource),
        ];
        for (pattern, value) in fields {
            match self.matcher.matches(pattern, value) {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    warn!(policy = %policy.id, error = %e, "Skipping policy with malformed pattern");
                    return false;
                }
            }
        }

        policy.conditions.iter().all(|condition| {
            self.conditions.evaluate(condition, request).unwrap_or_else(|e| {
                warn!(policy = %policy.id, error = %e, "Skipping policy with malformed condition");
                false
            })
        })
    }

    fn record(
        &self,
        username: &str,
        request: &DecisionRequest,
        response: &DecisionResponse,
        pool: &[Policy],
        deciders: &[&Policy],
    ) {
        let record = AuditRecord::new(
            username,
            request,
            response,
            pool,
            deciders,
            self.audit.options(),
        );
        self.audit.send_record(record);
    }
}

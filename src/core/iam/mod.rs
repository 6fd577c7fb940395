//! Identity and access management
//!
//! Policies are cached per subject, matched with `<regex>`-delimited
//! patterns, refined by conditions, and decided with deny-overrides:
//! a single matching deny beats any number of matching allows.

mod cache;
mod condition;
mod engine;
mod pattern;
mod policy;

pub use cache::PolicyCache;
pub use condition::{
    BooleanCondition, CidrCondition, Condition, ConditionFactory, ConditionRegistry,
    EqualsSubjectCondition, StringEqualCondition,
};
pub use engine::{
    DecisionEngine, PolicyLookup, REASON_LOOKUP_FAILED, REASON_MISSING_SUBJECT, REASON_NO_MATCH,
    REASON_NO_POLICIES,
};
pub use pattern::PatternMatcher;
pub use policy::{
    ConditionSpec, ContextValue, DecisionRequest, DecisionResponse, Effect, Policy, Secret,
};

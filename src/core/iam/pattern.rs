//! Pattern matching for policy subjects, actions and resources
//!
//! Supports:
//! - literal text, matched exactly (e.g. `users:alice`)
//! - `<...>` regex segments (e.g. `users:<alice|bob>`, `articles:<.*>`)
//! - `*` outside delimiters, matching any run of characters (e.g. `doc:*`)
//!
//! The whole input must match. Compiled patterns are kept in an LRU cache.

use crate::error::{AuthzError, Result};
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use std::num::NonZeroUsize;
use std::sync::Arc;

const START_DELIMITER: char = '<';
const END_DELIMITER: char = '>';

/// Pattern matcher with a bounded cache of compiled patterns
pub struct PatternMatcher {
    compiled: Mutex<LruCache<String, Arc<Regex>>>,
}

impl PatternMatcher {
    /// Create a matcher caching up to `capacity` compiled patterns
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        PatternMatcher {
            compiled: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Check whether `value` matches `pattern`
    ///
    /// # Examples
    /// ```
    /// use authzd::iam::PatternMatcher;
    ///
    /// let matcher = PatternMatcher::default();
    /// assert!(matcher.matches("users:<alice|bob>", "users:bob").unwrap());
    /// assert!(matcher.matches("doc:*", "doc:1").unwrap());
    /// assert!(!matcher.matches("users:alice", "users:bob").unwrap());
    /// ```
    pub fn matches(&self, pattern: &str, value: &str) -> Result<bool> {
        if !Self::has_wildcards(pattern) {
            return Ok(pattern == value);
        }

        Ok(self.compile(pattern)?.is_match(value))
    }

    /// Number of compiled patterns currently cached
    pub fn cached(&self) -> usize {
        self.compiled.lock().len()
    }

    fn has_wildcards(pattern: &str) -> bool {
        pattern.contains(START_DELIMITER) || pattern.contains('*')
    }

    fn compile(&self, pattern: &str) -> Result<Arc<Regex>> {
        if let Some(regex) = self.compiled.lock().get(pattern) {
            return Ok(Arc::clone(regex));
        }

        let regex = Arc::new(Self::build(pattern)?);
        self.compiled
            .lock()
            .put(pattern.to_string(), Arc::clone(&regex));
        Ok(regex)
    }

    /// Translate a pattern into an anchored regex
    fn build(pattern: &str) -> Result<Regex> {
        let invalid = |reason: &str| AuthzError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let mut source = String::with_capacity(pattern.len() + 8);
        source.push('^');

        let mut literal = String::new();
        let mut segment = String::new();
        let mut depth = 0usize;

        for ch in pattern.chars() {
            match ch {
                START_DELIMITER => {
                    if depth == 0 {
                        source.push_str(&regex::escape(&literal));
                        literal.clear();
                    } else {
                        segment.push(ch);
                    }
                    depth += 1;
                }
                END_DELIMITER if depth > 0 => {
                    depth -= 1;
                    if depth == 0 {
                        source.push_str("(?:");
                        source.push_str(&segment);
                        source.push(')');
                        segment.clear();
                    } else {
                        segment.push(ch);
                    }
                }
                END_DELIMITER => return Err(invalid("unbalanced '>'")),
                '*' if depth == 0 => {
                    source.push_str(&regex::escape(&literal));
                    literal.clear();
                    source.push_str(".*");
                }
                _ if depth > 0 => segment.push(ch),
                _ => literal.push(ch),
            }
        }

        if depth != 0 {
            return Err(invalid("unterminated '<'"));
        }

        source.push_str(&regex::escape(&literal));
        source.push('$');

        Regex::new(&source).map_err(|e| invalid(&e.to_string()))
    }
}

impl Default for PatternMatcher {
    fn default() -> Self {
        Self::new(1024)
    }
}

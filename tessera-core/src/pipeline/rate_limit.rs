//! Per-category rate limiting
//!
//! Every capability maps to a category fixed at configuration time. Each
//! category owns an independent fixed-window budget; admission never blocks.
//!
//! Category resolution: explicit assignment, then the longest matching
//! prefix rule, then [`GENERAL_CATEGORY`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Category for capabilities without an assignment
pub const GENERAL_CATEGORY: &str = "general";

/// Permits per window for one category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    /// Maximum permits per window
    pub max_requests: u64,

    /// Window duration
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
        }
    }
}

impl Budget {
    pub fn new(max_requests: u64, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    /// Budget of `max_requests` per minute
    pub fn per_minute(max_requests: u64) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }
}

/// Assigns capabilities whose name starts with `prefix` to `category`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixRule {
    pub prefix: String,
    pub category: String,
}

/// Rate limit configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Budget for the general category
    pub general: Budget,

    /// Named category budgets
    pub categories: HashMap<String, Budget>,

    /// Explicit capability -> category assignments
    pub assignments: HashMap<String, String>,

    /// Name-prefix fallbacks, consulted when no explicit assignment exists
    pub prefix_rules: Vec<PrefixRule>,
}

impl RateLimitConfig {
    /// Add a named category
    pub fn with_category(mut self, category: impl Into<String>, budget: Budget) -> Self {
        self.categories.insert(category.into(), budget);
        self
    }

    /// Assign a capability to a category
    pub fn with_assignment(
        mut self,
        capability: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        self.assignments.insert(capability.into(), category.into());
        self
    }

    /// Add a prefix rule
    pub fn with_prefix_rule(mut self, prefix: impl Into<String>, category: impl Into<String>) -> Self {
        self.prefix_rules.push(PrefixRule {
            prefix: prefix.into(),
            category: category.into(),
        });
        self
    }

    /// Set the general budget
    pub fn with_general(mut self, budget: Budget) -> Self {
        self.general = budget;
        self
    }

    fn is_known(&self, category: &str) -> bool {
        category == GENERAL_CATEGORY || self.categories.contains_key(category)
    }

    /// Check budgets and category references
    pub fn validate(&self) -> Result<(), String> {
        let budgets = std::iter::once((GENERAL_CATEGORY, &self.general))
            .chain(self.categories.iter().map(|(k, v)| (k.as_str(), v)));
        for (category, budget) in budgets {
            if budget.max_requests == 0 {
                return Err(format!("category '{}' must allow at least one request", category));
            }
            if budget.window.is_zero() {
                return Err(format!("category '{}' has a zero-length window", category));
            }
        }

        if self.categories.contains_key(GENERAL_CATEGORY) {
            return Err(format!(
                "'{}' is reserved; configure it through the general budget",
                GENERAL_CATEGORY
            ));
        }

        for (capability, category) in &self.assignments {
            if !self.is_known(category) {
                return Err(format!(
                    "capability '{}' is assigned to undefined category '{}'",
                    capability, category
                ));
            }
        }

        for rule in &self.prefix_rules {
            if rule.prefix.is_empty() {
                return Err("prefix rules must have a non-empty prefix".to_string());
            }
            if !self.is_known(&rule.category) {
                return Err(format!(
                    "prefix rule '{}' refers to undefined category '{}'",
                    rule.prefix, rule.category
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
struct WindowState {
    window_start: Instant,
    used: u64,
}

#[derive(Debug)]
struct Bucket {
    budget: Budget,
    state: Mutex<WindowState>,
}

impl Bucket {
    fn new(budget: Budget) -> Self {
        Self {
            budget,
            state: Mutex::new(WindowState {
                window_start: Instant::now(),
                used: 0,
            }),
        }
    }

    /// Lock the window, resetting it if it has elapsed
    fn current(&self) -> MutexGuard<'_, WindowState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if now.duration_since(state.window_start) >= self.budget.window {
            state.window_start = now;
            state.used = 0;
        }
        state
    }

    fn try_consume(&self, cost: u64) -> bool {
        let mut state = self.current();
        match state.used.checked_add(cost) {
            Some(total) if total <= self.budget.max_requests => {
                state.used = total;
                true
            }
            _ => false,
        }
    }

    fn remaining(&self) -> u64 {
        self.budget.max_requests.saturating_sub(self.current().used)
    }

    fn retry_after(&self) -> Duration {
        let state = self.current();
        self.budget
            .window
            .saturating_sub(Instant::now().duration_since(state.window_start))
    }
}

/// Non-blocking per-category admission control
#[derive(Debug)]
pub struct RateLimiter {
    general: Bucket,
    buckets: HashMap<String, Bucket>,
    assignments: HashMap<String, String>,
    prefix_rules: Vec<PrefixRule>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(&RateLimitConfig::default())
    }
}

impl RateLimiter {
    /// Build a limiter; windows start now
    pub fn new(config: &RateLimitConfig) -> Self {
        let mut prefix_rules = config.prefix_rules.clone();
        // Longest prefix wins
        prefix_rules.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        Self {
            general: Bucket::new(config.general),
            buckets: config
                .categories
                .iter()
                .map(|(name, budget)| (name.clone(), Bucket::new(*budget)))
                .collect(),
            assignments: config.assignments.clone(),
            prefix_rules,
        }
    }

    /// Category a capability is charged against
    pub fn category_for<'a>(&'a self, capability: &str) -> &'a str {
        if let Some(category) = self.assignments.get(capability) {
            return category;
        }
        self.prefix_rules
            .iter()
            .find(|rule| capability.starts_with(&rule.prefix))
            .map(|rule| rule.category.as_str())
            .unwrap_or(GENERAL_CATEGORY)
    }

    fn bucket(&self, category: &str) -> &Bucket {
        self.buckets.get(category).unwrap_or(&self.general)
    }

    /// Try to take `cost` permits from `category`
    ///
    /// Unknown categories are charged to the general budget. A denied call
    /// consumes nothing.
    pub fn admit(&self, category: &str, cost: u64) -> bool {
        let admitted = self.bucket(category).try_consume(cost);
        if !admitted {
            debug!(category, cost, "Rate limit budget exhausted");
        }
        admitted
    }

    /// Permits left in the current window
    pub fn remaining(&self, category: &str) -> u64 {
        self.bucket(category).remaining()
    }

    /// Time until the category's window rolls over
    pub fn retry_after(&self, category: &str) -> Duration {
        self.bucket(category).retry_after()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        let config = RateLimitConfig::default()
            .with_general(Budget::new(5, Duration::from_secs(60)))
            .with_category("analysis", Budget::new(3, Duration::from_secs(10)))
            .with_category("db", Budget::new(2, Duration::from_secs(10)))
            .with_assignment("sql_explain", "db")
            .with_prefix_rule("lint", "analysis")
            .with_prefix_rule("sql", "analysis");
        RateLimiter::new(&config)
    }

    #[test]
    fn test_category_resolution() {
        let limiter = limiter();

        // Explicit assignment beats the matching prefix rule
        assert_eq!(limiter.category_for("sql_explain"), "db");
        assert_eq!(limiter.category_for("sql_format"), "analysis");
        assert_eq!(limiter.category_for("lint_python"), "analysis");
        assert_eq!(limiter.category_for("migration_check"), GENERAL_CATEGORY);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let config = RateLimitConfig::default()
            .with_category("broad", Budget::per_minute(10))
            .with_category("narrow", Budget::per_minute(10))
            .with_prefix_rule("schema", "broad")
            .with_prefix_rule("schema_diff", "narrow");
        let limiter = RateLimiter::new(&config);

        assert_eq!(limiter.category_for("schema_diff_v2"), "narrow");
        assert_eq!(limiter.category_for("schema_dump"), "broad");
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_and_rollover() {
        let limiter = limiter();

        for _ in 0..3 {
            assert!(limiter.admit("analysis", 1));
        }
        assert!(!limiter.admit("analysis", 1));
        assert_eq!(limiter.remaining("analysis"), 0);
        assert_eq!(limiter.retry_after("analysis"), Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!limiter.admit("analysis", 1));
        assert_eq!(limiter.retry_after("analysis"), Duration::from_secs(6));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(limiter.admit("analysis", 1));
        assert_eq!(limiter.remaining("analysis"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_categories_are_independent() {
        let limiter = limiter();

        assert!(limiter.admit("db", 1));
        assert!(limiter.admit("db", 1));
        assert!(!limiter.admit("db", 1));

        assert!(limiter.admit("analysis", 1));
        assert!(limiter.admit(GENERAL_CATEGORY, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_category_uses_general() {
        let limiter = limiter();

        for _ in 0..5 {
            assert!(limiter.admit("never_configured", 1));
        }
        assert!(!limiter.admit(GENERAL_CATEGORY, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cost_larger_than_remaining_consumes_nothing() {
        let limiter = limiter();

        assert!(limiter.admit("analysis", 2));
        assert!(!limiter.admit("analysis", 2));
        assert_eq!(limiter.remaining("analysis"), 1);
        assert!(limiter.admit("analysis", 1));
        assert!(!limiter.admit("analysis", u64::MAX));
    }

    #[test]
    fn test_config_validation() {
        assert!(RateLimitConfig::default().validate().is_ok());

        let zero = RateLimitConfig::default().with_category("db", Budget::per_minute(0));
        assert!(zero.validate().is_err());

        let no_window =
            RateLimitConfig::default().with_category("db", Budget::new(1, Duration::ZERO));
        assert!(no_window.validate().is_err());

        let dangling = RateLimitConfig::default().with_assignment("lint", "missing");
        assert!(dangling.validate().is_err());

        let general_ok = RateLimitConfig::default().with_assignment("lint", GENERAL_CATEGORY);
        assert!(general_ok.validate().is_ok());

        let reserved =
            RateLimitConfig::default().with_category(GENERAL_CATEGORY, Budget::per_minute(1));
        assert!(reserved.validate().is_err());
    }
}

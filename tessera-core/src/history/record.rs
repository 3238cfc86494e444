use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One completed dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub success: bool,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Invocation attempts made; zero for cache hits
    pub attempts: u32,
    pub cache_hit: bool,
}

impl ExecutionRecord {
    /// Record that ended `duration` after `started_at`
    pub fn new(started_at: DateTime<Utc>, duration: Duration, success: bool) -> Self {
        let elapsed = chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            started_at,
            ended_at: started_at + elapsed,
            success,
            duration,
            attempts: 1,
            cache_hit: false,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_cache_hit(mut self, cache_hit: bool) -> Self {
        self.cache_hit = cache_hit;
        self
    }
}

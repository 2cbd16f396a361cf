use std::time::Duration;

use crate::gateway::consumer::RetryPolicy;
use crate::gateway::fanout::FanoutConfig;

/// Notify worker configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Redis connection string (presence sets, pub/sub, queues).
    pub redis_url: String,
    /// Queue the worker consumes committed mutations from.
    pub mutation_queue: String,
    /// Upper bound on a channel presence query before it degrades to "nobody".
    pub presence_timeout_ms: u64,
    /// Page size when iterating participants of large chats.
    pub participant_page_size: i64,
    /// Attempts (including the first) before a delivery is dead-lettered.
    pub max_delivery_attempts: u32,
    /// Pause before a failed delivery is handed back to the queue.
    pub retry_backoff_ms: u64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self {
            database_url: required_var("DATABASE_URL"),
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379/0".to_string()),
            mutation_queue: std::env::var("MUTATION_QUEUE")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "parley:mutations".to_string()),
            presence_timeout_ms: parsed_var("PRESENCE_TIMEOUT_MS", 500),
            participant_page_size: parsed_var("PARTICIPANT_PAGE_SIZE", 500),
            max_delivery_attempts: parsed_var("MAX_DELIVERY_ATTEMPTS", 5),
            retry_backoff_ms: parsed_var("RETRY_BACKOFF_MS", 250),
        }
    }

    pub fn presence_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_timeout_ms)
    }

    pub fn fanout(&self) -> FanoutConfig {
        FanoutConfig {
            page_size: self.participant_page_size.max(1),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_delivery_attempts.max(1),
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

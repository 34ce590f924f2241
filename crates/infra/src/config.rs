//! Configuration loading and representation.
//!
//! Everything is read from environment variables with defaults. Unparseable
//! values fall back to the default with a warning rather than aborting start.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::jobs::processor::ProcessorConfig;
use crate::jobs::types::{DEFAULT_MAX_ATTEMPTS, MAX_ALLOWED_ATTEMPTS};

/// Job system configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSystemConfig {
    pub poll_interval: Duration,
    /// Ready jobs fetched per poll
    pub batch_size: usize,
    pub default_max_attempts: u32,
    /// Running jobs untouched for longer are reaped
    pub stale_threshold: Duration,
    pub reaper_interval: Duration,
    pub cleanup_interval: Duration,
    pub completed_retention: Duration,
    pub failed_retention: Duration,
    /// Name for logging
    pub worker_name: String,
    /// Credits needed to admit one commit pipeline
    pub summary_credit_cost: u64,
    /// Where callers are sent when admission is refused
    pub billing_url: String,
    /// Balance every account starts with in the in-memory credit ledger
    pub dev_credit_balance: u64,
    /// Postgres connection string; `None` means in-memory stores
    pub database_url: Option<String>,
    pub github_token: Option<String>,
    pub bind_addr: String,
}

impl Default for JobSystemConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            batch_size: 10,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            stale_threshold: Duration::from_secs(600),
            reaper_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(3600),
            completed_retention: Duration::from_secs(24 * 3600),
            failed_retention: Duration::from_secs(168 * 3600),
            worker_name: "job-processor".to_string(),
            summary_credit_cost: 1,
            billing_url: "/billing".to_string(),
            dev_credit_balance: 100,
            database_url: None,
            github_token: None,
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl JobSystemConfig {
    /// Load from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let num = |key: &str, default: u64| parse_or(&lookup, key, default);

        let default_max_attempts = parse_or(&lookup, "JOB_DEFAULT_MAX_ATTEMPTS", defaults.default_max_attempts);
        let default_max_attempts = if (1..=MAX_ALLOWED_ATTEMPTS).contains(&default_max_attempts) {
            default_max_attempts
        } else {
            warn!(
                value = default_max_attempts,
                "JOB_DEFAULT_MAX_ATTEMPTS out of range, using default"
            );
            defaults.default_max_attempts
        };

        let use_persistent = parse_or(&lookup, "USE_PERSISTENT_STORES", false);
        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());
        let database_url = match (use_persistent, database_url) {
            (true, Some(url)) => Some(url),
            (true, None) => {
                warn!("USE_PERSISTENT_STORES=true but DATABASE_URL not set, falling back to in-memory");
                None
            }
            (false, _) => None,
        };

        Self {
            poll_interval: Duration::from_millis(num("JOB_POLL_INTERVAL_MS", 1000)),
            batch_size: parse_or(&lookup, "JOB_BATCH_SIZE", defaults.batch_size).max(1),
            default_max_attempts,
            stale_threshold: Duration::from_secs(num("JOB_STALE_THRESHOLD_SECS", 600)),
            reaper_interval: Duration::from_secs(num("JOB_REAPER_INTERVAL_SECS", 60)),
            cleanup_interval: Duration::from_secs(num("JOB_CLEANUP_INTERVAL_SECS", 3600)),
            completed_retention: hours(num("JOB_COMPLETED_RETENTION_HOURS", 24)),
            failed_retention: hours(num("JOB_FAILED_RETENTION_HOURS", 168)),
            worker_name: lookup("JOB_WORKER_NAME").unwrap_or(defaults.worker_name),
            summary_credit_cost: num("SUMMARY_CREDIT_COST", defaults.summary_credit_cost),
            billing_url: lookup("BILLING_URL").unwrap_or(defaults.billing_url),
            dev_credit_balance: num("DEV_CREDIT_BALANCE", defaults.dev_credit_balance),
            database_url,
            github_token: lookup("GITHUB_TOKEN").filter(|t| !t.trim().is_empty()),
            bind_addr: lookup("API_BIND_ADDR").unwrap_or(defaults.bind_addr),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    pub fn with_summary_credit_cost(mut self, cost: u64) -> Self {
        self.summary_credit_cost = cost;
        self
    }

    pub fn with_billing_url(mut self, url: impl Into<String>) -> Self {
        self.billing_url = url.into();
        self
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig::default()
            .with_name(self.worker_name.clone())
            .with_poll_interval(self.poll_interval)
            .with_batch_size(self.batch_size)
    }
}

fn hours(h: u64) -> Duration {
    Duration::from_secs(h.saturating_mul(3600))
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Copy + std::fmt::Debug,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, default = ?default, "invalid configuration value, using default");
            default
        }),
    }
}

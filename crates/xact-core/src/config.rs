//! Transaction manager configuration.
//!
//! [`TransactionConfig`] is a plain serde-friendly struct; every field has a
//! default so a partial JSON document is enough to override a few values.
//! [`ConfigurationProvider`] is the read-only view the coordinator consumes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do with a transaction whose outcome cannot be determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeuristicDirection {
    /// Commit the remaining participants.
    Commit,
    /// Roll back the remaining participants.
    #[default]
    Rollback,
    /// Leave the transaction for an operator to resolve.
    Manual,
}

/// Ordering of asynchronous (remote) prepares relative to synchronous ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AsyncPrepareOrdering {
    /// Prepare and join remote participants before any local resource.
    AsyncBeforeSync,
    /// Issue remote prepares, prepare local resources, then join.
    #[default]
    Concurrent,
    /// Prepare local resources first, then remote participants.
    AsyncAfterSync,
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// JSON could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Process-wide transaction manager settings. All durations are seconds
/// unless the field name says otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Timeout applied by `begin` when the thread has not set one.
    pub default_transaction_timeout: u64,
    /// Upper bound for any transaction timeout (0 = unbounded).
    pub maximum_transaction_timeout: u64,
    /// Completion retries before giving up (0 = retry forever).
    pub heuristic_retry_limit: u32,
    /// Initial wait between completion retries.
    pub heuristic_retry_interval: u64,
    /// Ceiling for the doubled retry interval.
    pub max_retry_interval: u64,
    /// Resolution for transactions whose outcome cannot be determined.
    pub heuristic_completion_direction: HeuristicDirection,
    /// Inactivity window for suspended transactions (0 = disabled).
    pub client_inactivity_timeout: u64,
    /// Ordering of remote prepares.
    pub async_prepare_ordering: AsyncPrepareOrdering,
    /// Treat a communication failure during prepare as a rollback vote.
    pub prepare_fail_fast: bool,
    /// Prepare attempts after a communication failure when not failing fast.
    pub prepare_retry_limit: u32,
    /// Worker threads driving remote participants.
    pub worker_threads: usize,
    /// Maximum remote operations in flight at once.
    pub max_concurrent_operations: usize,
    /// Per-operation timeout for remote participants, in milliseconds.
    pub async_operation_timeout_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            default_transaction_timeout: 120,
            maximum_transaction_timeout: 0,
            heuristic_retry_limit: 0,
            heuristic_retry_interval: 60,
            max_retry_interval: 3600,
            heuristic_completion_direction: HeuristicDirection::Rollback,
            client_inactivity_timeout: 0,
            async_prepare_ordering: AsyncPrepareOrdering::Concurrent,
            prepare_fail_fast: true,
            prepare_retry_limit: 3,
            worker_threads: 2,
            max_concurrent_operations: 64,
            async_operation_timeout_ms: 30_000,
        }
    }
}

impl TransactionConfig {
    /// Starts a builder seeded with defaults.
    #[must_use]
    pub fn builder() -> TransactionConfigBuilder {
        TransactionConfigBuilder::default()
    }

    /// Parses a JSON document; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for malformed JSON and
    /// `ConfigError::Invalid` if a value is out of range.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid("worker_threads must be > 0".into()));
        }
        if self.max_concurrent_operations == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_operations must be > 0".into(),
            ));
        }
        if self.async_operation_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "async_operation_timeout_ms must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Per-operation timeout for remote participants.
    #[must_use]
    pub fn async_operation_timeout(&self) -> Duration {
        Duration::from_millis(self.async_operation_timeout_ms)
    }
}

/// Read-only view of the settings the coordinator consults while driving
/// completion and recovery.
pub trait ConfigurationProvider: Send + Sync {
    /// Upper bound for transaction timeouts (0 = unbounded).
    fn maximum_transaction_timeout(&self) -> u64;
    /// Retry limit for completion (0 = unlimited).
    fn heuristic_retry_limit(&self) -> u32;
    /// Initial retry interval in seconds.
    fn heuristic_retry_interval(&self) -> u64;
    /// Resolution for undeterminable outcomes.
    fn heuristic_completion_direction(&self) -> HeuristicDirection;
    /// Inactivity window for suspended transactions.
    fn client_inactivity_timeout(&self) -> u64;

    /// Clamps a requested timeout to the maximum. Zero on either side
    /// means "no limit".
    fn effective_timeout(&self, requested: u64) -> u64 {
        let max = self.maximum_transaction_timeout();
        if max > 0 && (requested == 0 || requested > max) {
            max
        } else {
            requested
        }
    }
}

impl ConfigurationProvider for TransactionConfig {
    fn maximum_transaction_timeout(&self) -> u64 {
        self.maximum_transaction_timeout
    }

    fn heuristic_retry_limit(&self) -> u32 {
        self.heuristic_retry_limit
    }

    fn heuristic_retry_interval(&self) -> u64 {
        self.heuristic_retry_interval
    }

    fn heuristic_completion_direction(&self) -> HeuristicDirection {
        self.heuristic_completion_direction
    }

    fn client_inactivity_timeout(&self) -> u64 {
        self.client_inactivity_timeout
    }
}

/// Fluent builder for [`TransactionConfig`].
#[derive(Debug, Clone, Default)]
pub struct TransactionConfigBuilder {
    config: TransactionConfig,
}

impl TransactionConfigBuilder {
    /// Sets the default transaction timeout.
    #[must_use]
    pub fn default_timeout(mut self, secs: u64) -> Self {
        self.config.default_transaction_timeout = secs;
        self
    }

    /// Sets the maximum transaction timeout.
    #[must_use]
    pub fn maximum_timeout(mut self, secs: u64) -> Self {
        self.config.maximum_transaction_timeout = secs;
        self
    }

    /// Sets the completion retry limit.
    #[must_use]
    pub fn retry_limit(mut self, limit: u32) -> Self {
        self.config.heuristic_retry_limit = limit;
        self
    }

    /// Sets the initial completion retry interval.
    #[must_use]
    pub fn retry_interval(mut self, secs: u64) -> Self {
        self.config.heuristic_retry_interval = secs;
        self
    }

    /// Sets the retry interval ceiling.
    #[must_use]
    pub fn max_retry_interval(mut self, secs: u64) -> Self {
        self.config.max_retry_interval = secs;
        self
    }

    /// Sets the heuristic completion direction.
    #[must_use]
    pub fn direction(mut self, direction: HeuristicDirection) -> Self {
        self.config.heuristic_completion_direction = direction;
        self
    }

    /// Sets the client inactivity timeout.
    #[must_use]
    pub fn inactivity_timeout(mut self, secs: u64) -> Self {
        self.config.client_inactivity_timeout = secs;
        self
    }

    /// Sets the remote prepare ordering.
    #[must_use]
    pub fn async_ordering(mut self, ordering: AsyncPrepareOrdering) -> Self {
        self.config.async_prepare_ordering = ordering;
        self
    }

    /// Chooses between fail-fast and retrying prepares.
    #[must_use]
    pub fn prepare_fail_fast(mut self, fail_fast: bool) -> Self {
        self.config.prepare_fail_fast = fail_fast;
        self
    }

    /// Sets how often a failed prepare is retried when not failing fast.
    #[must_use]
    pub fn prepare_retry_limit(mut self, limit: u32) -> Self {
        self.config.prepare_retry_limit = limit;
        self
    }

    /// Sets the per-operation timeout for remote participants.
    #[must_use]
    pub fn async_operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.async_operation_timeout_ms =
            u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the worker pool size.
    #[must_use]
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = threads;
        self
    }

    /// Finishes the builder.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if validation fails.
    pub fn build(self) -> Result<TransactionConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

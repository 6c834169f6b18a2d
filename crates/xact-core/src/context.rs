//! Shared services for every transaction of one coordinator instance.

use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;
use tracing::info;

use crate::config::{ConfigurationProvider, TransactionConfig};
use crate::error::TransactionError;
use crate::log::RecoveryLog;
use crate::services::ServiceRegistry;
use crate::timeout::TimeoutManager;
use crate::transaction::Transaction;
use crate::wsat::WorkerPool;
use crate::xid::IdGenerator;

/// Configuration, recovery log, timer, factories and worker pool, plus
/// the table of transactions that have not finished yet.
///
/// Completion policy (timeout bounds, retry limit and interval, heuristic
/// direction, inactivity window) is read through a
/// [`ConfigurationProvider`], which defaults to the configuration itself.
///
/// Transactions hold the context; the context holds unfinished
/// transactions so that in-doubt ones stay reachable for retries and
/// operator resolution.
pub struct TxContext {
    config: TransactionConfig,
    policy: Arc<dyn ConfigurationProvider>,
    log: Arc<dyn RecoveryLog>,
    timeouts: TimeoutManager,
    services: ServiceRegistry,
    pool: Arc<WorkerPool>,
    ids: IdGenerator,
    live: Mutex<FxHashMap<u64, Arc<Transaction>>>,
}

impl TxContext {
    /// Validates `config` and starts the timer thread and worker pool.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::System` if the configuration is invalid
    /// or a thread cannot be started.
    pub fn new(
        config: TransactionConfig,
        log: Arc<dyn RecoveryLog>,
        services: ServiceRegistry,
    ) -> Result<Arc<Self>, TransactionError> {
        let policy = Arc::new(config.clone());
        Self::with_provider(config, policy, log, services)
    }

    /// Like [`TxContext::new`], with completion policy supplied by
    /// `policy` instead of `config`.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::System` if the configuration is invalid
    /// or a thread cannot be started.
    pub fn with_provider(
        config: TransactionConfig,
        policy: Arc<dyn ConfigurationProvider>,
        log: Arc<dyn RecoveryLog>,
        services: ServiceRegistry,
    ) -> Result<Arc<Self>, TransactionError> {
        config
            .validate()
            .map_err(|e| TransactionError::System(format!("invalid configuration: {e}")))?;
        let timeouts = TimeoutManager::start()
            .map_err(|e| TransactionError::System(format!("cannot start timeout thread: {e}")))?;
        let pool = WorkerPool::from_config(&config)
            .map_err(|e| TransactionError::System(format!("cannot start worker pool: {e}")))?;
        info!(
            default_timeout = config.default_transaction_timeout,
            direction = ?policy.heuristic_completion_direction(),
            workers = config.worker_threads,
            "transaction context started"
        );
        Ok(Arc::new(Self {
            config,
            policy,
            log,
            timeouts,
            services,
            pool: Arc::new(pool),
            ids: IdGenerator::new(),
            live: Mutex::new(FxHashMap::default()),
        }))
    }

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Completion policy.
    #[must_use]
    pub fn policy(&self) -> &dyn ConfigurationProvider {
        self.policy.as_ref()
    }

    /// Recovery log.
    #[must_use]
    pub fn log(&self) -> &Arc<dyn RecoveryLog> {
        &self.log
    }

    /// Timer service.
    #[must_use]
    pub fn timeouts(&self) -> &TimeoutManager {
        &self.timeouts
    }

    /// Recovery factories.
    #[must_use]
    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// Worker pool for remote participants.
    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Identifier source.
    #[must_use]
    pub fn ids(&self) -> &IdGenerator {
        &self.ids
    }

    pub(crate) fn retain(&self, tx: &Arc<Transaction>) {
        self.live.lock().insert(tx.id().local(), Arc::clone(tx));
    }

    pub(crate) fn release(&self, local: u64) {
        self.live.lock().remove(&local);
    }

    /// Transactions that have not finished.
    #[must_use]
    pub fn live_transactions(&self) -> Vec<Arc<Transaction>> {
        let mut live: Vec<_> = self.live.lock().values().cloned().collect();
        live.sort_by_key(|tx| tx.id().local());
        live
    }

    /// Unfinished transaction with global id `gtrid`, if any.
    #[must_use]
    pub fn find(&self, gtrid: &[u8]) -> Option<Arc<Transaction>> {
        self.live
            .lock()
            .values()
            .find(|tx| tx.id().xid().gtrid() == gtrid)
            .cloned()
    }

    /// Drops every unfinished transaction without completing it and
    /// cancels their timers. The log is left untouched, so the next
    /// coordinator instance recovers them.
    pub fn shutdown(&self) {
        let abandoned: Vec<_> = self.live.lock().drain().map(|(_, tx)| tx).collect();
        for tx in &abandoned {
            self.timeouts.cancel_all(tx.id().local());
        }
        if !abandoned.is_empty() {
            info!(abandoned = abandoned.len(), "transaction context shut down");
        }
    }
}

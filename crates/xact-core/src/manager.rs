//! Thread-associated transaction demarcation.
//!
//! [`TransactionManager`] is the application-facing façade. It keeps the
//! association between threads and transactions and forwards every call to
//! the transaction currently on the calling thread.

use std::sync::Arc;
use std::thread::ThreadId;

use fxhash::FxHashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::TransactionConfig;
use crate::context::TxContext;
use crate::error::TransactionError;
use crate::log::RecoveryLog;
use crate::recovery::{RecoveryManager, RecoverySummary};
use crate::resource::{OnePhaseResource, ResourceDescriptor, Vote, XaResource};
use crate::services::{RecoveryCoordinator, ServiceRegistry};
use crate::state::{Status, TransactionState};
use crate::sync::Synchronization;
use crate::timeout::TimeoutKind;
use crate::transaction::Transaction;
use crate::wsat::RemoteParticipant;
use crate::xid::Xid;

/// What a thread is associated with.
#[derive(Clone)]
enum Association {
    /// A global transaction.
    Global(Arc<Transaction>),
    /// Work outside global transaction control (e.g. a container-managed
    /// local transaction). Blocks `begin` like a global transaction does.
    Passthrough,
}

/// Application-facing transaction manager.
pub struct TransactionManager {
    ctx: Arc<TxContext>,
    threads: Mutex<FxHashMap<ThreadId, Association>>,
    thread_timeouts: Mutex<FxHashMap<ThreadId, u64>>,
}

impl TransactionManager {
    /// Creates a manager with its own context.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::System` if the configuration is invalid
    /// or the background threads cannot start.
    pub fn new(
        config: TransactionConfig,
        log: Arc<dyn RecoveryLog>,
        services: ServiceRegistry,
    ) -> Result<Self, TransactionError> {
        Ok(Self::with_context(TxContext::new(config, log, services)?))
    }

    /// Creates a manager over an existing context.
    #[must_use]
    pub fn with_context(ctx: Arc<TxContext>) -> Self {
        Self {
            ctx,
            threads: Mutex::new(FxHashMap::default()),
            thread_timeouts: Mutex::new(FxHashMap::default()),
        }
    }

    /// Shared context.
    #[must_use]
    pub fn context(&self) -> &Arc<TxContext> {
        &self.ctx
    }

    fn current_thread() -> ThreadId {
        std::thread::current().id()
    }

    fn current(&self) -> Option<Arc<Transaction>> {
        match self.threads.lock().get(&Self::current_thread()) {
            Some(Association::Global(tx)) => Some(Arc::clone(tx)),
            _ => None,
        }
    }

    fn require_current(&self) -> Result<Arc<Transaction>, TransactionError> {
        self.current().ok_or_else(|| {
            TransactionError::IllegalState("no transaction associated with this thread".into())
        })
    }

    fn check_no_association(threads: &FxHashMap<ThreadId, Association>) -> Result<(), TransactionError> {
        match threads.get(&Self::current_thread()) {
            Some(Association::Global(tx)) => Err(TransactionError::NotSupported(format!(
                "nested transactions are not supported; {} is already associated",
                tx.id()
            ))),
            Some(Association::Passthrough) => Err(TransactionError::NotSupported(
                "thread is running outside global transaction control".into(),
            )),
            None => Ok(()),
        }
    }

    /// Starts a transaction on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::NotSupported` if the thread already has a
    /// transaction.
    pub fn begin(&self) -> Result<Arc<Transaction>, TransactionError> {
        let requested = self
            .thread_timeouts
            .lock()
            .get(&Self::current_thread())
            .copied()
            .unwrap_or(self.ctx.config().default_transaction_timeout);
        self.begin_with_timeout(requested)
    }

    /// Starts a transaction with an explicit timeout in seconds, bounded by
    /// the configured maximum. Zero means no limit of its own.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::NotSupported` if the thread already has a
    /// transaction.
    pub fn begin_with_timeout(&self, seconds: u64) -> Result<Arc<Transaction>, TransactionError> {
        let timeout = self.ctx.policy().effective_timeout(seconds);
        let id = self.ctx.ids().next_id();
        self.start(
            Self::current_thread(),
            Transaction::new(&self.ctx, id, timeout, None),
        )
    }

    /// Imports a transaction whose outcome is decided by `coordinator`
    /// and associates it with the calling thread.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::NotSupported` if the thread already has a
    /// transaction.
    pub fn import_transaction(
        &self,
        xid: Xid,
        timeout: u64,
        coordinator_filter: &str,
        coordinator: Arc<dyn RecoveryCoordinator>,
    ) -> Result<Arc<Transaction>, TransactionError> {
        let me = Self::current_thread();
        let timeout = self.ctx.policy().effective_timeout(timeout);
        let id = self.ctx.ids().adopt(xid);
        let superior = Some((coordinator_filter.to_owned(), coordinator));
        self.start(me, Transaction::new(&self.ctx, id, timeout, superior))
    }

    fn start(&self, me: ThreadId, tx: Arc<Transaction>) -> Result<Arc<Transaction>, TransactionError> {
        let mut threads = self.threads.lock();
        Self::check_no_association(&threads)?;
        tx.add_association()?;
        self.ctx.retain(&tx);
        tx.arm_timeout(TimeoutKind::Active, tx.timeout());
        threads.insert(me, Association::Global(Arc::clone(&tx)));
        info!(
            tx = %tx.id(),
            timeout = tx.timeout(),
            subordinate = tx.is_subordinate(),
            "transaction begun"
        );
        Ok(tx)
    }

    /// Marks the calling thread as running outside global transaction
    /// control.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::NotSupported` if the thread already has a
    /// transaction.
    pub fn begin_passthrough(&self) -> Result<(), TransactionError> {
        let mut threads = self.threads.lock();
        Self::check_no_association(&threads)?;
        threads.insert(Self::current_thread(), Association::Passthrough);
        Ok(())
    }

    /// Clears a passthrough marker set by
    /// [`TransactionManager::begin_passthrough`].
    pub fn end_passthrough(&self) {
        let mut threads = self.threads.lock();
        if matches!(threads.get(&Self::current_thread()), Some(Association::Passthrough)) {
            threads.remove(&Self::current_thread());
        }
    }

    fn disassociate(&self, tx: &Transaction) {
        self.threads.lock().remove(&Self::current_thread());
        tx.remove_association();
    }

    /// Commits the calling thread's transaction and disassociates it.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::IllegalState` without a transaction,
    /// `Security` for subordinates or with outstanding suspensions, and
    /// otherwise the outcome of [`Transaction::commit`].
    pub fn commit(&self) -> Result<(), TransactionError> {
        let tx = self.require_current()?;
        tx.check_completable()?;
        tx.before_completion();
        self.disassociate(&tx);
        tx.complete_commit()
    }

    /// Rolls back the calling thread's transaction and disassociates it.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::IllegalState` without a transaction,
    /// `Security` for subordinates or with outstanding suspensions, and
    /// otherwise the outcome of [`Transaction::rollback`].
    pub fn rollback(&self) -> Result<(), TransactionError> {
        let tx = self.require_current()?;
        tx.check_completable()?;
        self.disassociate(&tx);
        tx.rollback_local()
    }

    /// Detaches the calling thread's transaction, arming the inactivity
    /// timeout. Returns `None` if no transaction was associated.
    pub fn suspend(&self) -> Option<Arc<Transaction>> {
        let mut threads = self.threads.lock();
        let me = Self::current_thread();
        match threads.remove(&me) {
            Some(Association::Global(tx)) => {
                drop(threads);
                tx.remove_association();
                tx.arm_timeout(
                    TimeoutKind::Inactivity,
                    self.ctx.policy().client_inactivity_timeout(),
                );
                debug!(tx = %tx.id(), "suspended");
                Some(tx)
            }
            Some(Association::Passthrough) => {
                threads.insert(me, Association::Passthrough);
                None
            }
            None => None,
        }
    }

    /// Attaches `tx` to the calling thread.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::IllegalState` if the thread already has a
    /// transaction, `tx` is not active, or another thread is actively
    /// associated with it.
    pub fn resume(&self, tx: &Arc<Transaction>) -> Result<(), TransactionError> {
        let me = Self::current_thread();
        let mut threads = self.threads.lock();
        if threads.contains_key(&me) {
            return Err(TransactionError::IllegalState(
                "thread is already associated with a transaction".into(),
            ));
        }
        let state = tx.state();
        if state != TransactionState::Active {
            return Err(TransactionError::IllegalState(format!(
                "cannot resume {} in state {state}",
                tx.id()
            )));
        }
        if tx.is_active_elsewhere(me) {
            return Err(TransactionError::IllegalState(format!(
                "{} is active on another thread",
                tx.id()
            )));
        }
        tx.add_association()?;
        tx.cancel_timeout(TimeoutKind::Inactivity);
        threads.insert(me, Association::Global(Arc::clone(tx)));
        debug!(tx = %tx.id(), "resumed");
        Ok(())
    }

    /// Marks the calling thread's transaction rollback-only.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::IllegalState` without a transaction.
    pub fn set_rollback_only(&self) -> Result<(), TransactionError> {
        self.require_current()?.set_rollback_only()
    }

    /// Sets the timeout used by the next `begin` on this thread; zero
    /// restores the default.
    pub fn set_transaction_timeout(&self, seconds: u64) {
        let me = Self::current_thread();
        let mut timeouts = self.thread_timeouts.lock();
        if seconds == 0 {
            timeouts.remove(&me);
        } else {
            timeouts.insert(me, seconds);
        }
    }

    /// Status of the calling thread's transaction.
    #[must_use]
    pub fn status(&self) -> Status {
        self.current()
            .map_or(Status::NoTransaction, |tx| tx.status())
    }

    /// The calling thread's transaction.
    #[must_use]
    pub fn transaction(&self) -> Option<Arc<Transaction>> {
        self.current()
    }

    /// Enlists an XA resource in the calling thread's transaction.
    ///
    /// # Errors
    ///
    /// See [`Transaction::enlist_resource`].
    pub fn enlist_resource(
        &self,
        resource: Box<dyn XaResource>,
        descriptor: ResourceDescriptor,
    ) -> Result<(), TransactionError> {
        self.require_current()?.enlist_resource(resource, descriptor)
    }

    /// Enlists the one-phase resource in the calling thread's transaction.
    ///
    /// # Errors
    ///
    /// See [`Transaction::enlist_one_phase`].
    pub fn enlist_one_phase(
        &self,
        resource: Box<dyn OnePhaseResource>,
        name: &str,
        priority: i32,
    ) -> Result<(), TransactionError> {
        self.require_current()?
            .enlist_one_phase(resource, name, priority)
    }

    /// Enlists a remote participant in the calling thread's transaction.
    ///
    /// # Errors
    ///
    /// See [`Transaction::enlist_async`].
    pub fn enlist_async(
        &self,
        remote: Arc<dyn RemoteParticipant>,
        descriptor: ResourceDescriptor,
    ) -> Result<(), TransactionError> {
        self.require_current()?.enlist_async(remote, descriptor)
    }

    /// Registers a synchronization with the calling thread's transaction.
    ///
    /// # Errors
    ///
    /// See [`Transaction::register_synchronization`].
    pub fn register_synchronization(&self, sync: Arc<dyn Synchronization>) -> Result<(), TransactionError> {
        self.require_current()?.register_synchronization(sync)
    }

    fn subordinate(&self, xid: &Xid) -> Result<Arc<Transaction>, TransactionError> {
        let tx = self.ctx.find(xid.gtrid()).ok_or_else(|| {
            TransactionError::IllegalState(format!("no imported transaction for {xid}"))
        })?;
        if !tx.is_subordinate() {
            return Err(TransactionError::Security(format!(
                "{} is not a subordinate transaction",
                tx.id()
            )));
        }
        let me = Self::current_thread();
        let mut threads = self.threads.lock();
        if matches!(threads.get(&me), Some(Association::Global(current)) if Arc::ptr_eq(current, &tx)) {
            threads.remove(&me);
            drop(threads);
            tx.remove_association();
        }
        Ok(tx)
    }

    /// Prepares the imported transaction `xid` for its superior.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::IllegalState` if `xid` was not imported,
    /// otherwise see [`Transaction::prepare_as_subordinate`].
    pub fn prepare_subordinate(&self, xid: &Xid) -> Result<Vote, TransactionError> {
        self.subordinate(xid)?.prepare_as_subordinate()
    }

    /// Commits the imported transaction `xid` for its superior.
    ///
    /// # Errors
    ///
    /// See [`Transaction::commit_as_subordinate`].
    pub fn commit_subordinate(&self, xid: &Xid, one_phase: bool) -> Result<(), TransactionError> {
        self.subordinate(xid)?.commit_as_subordinate(one_phase)
    }

    /// Rolls back the imported transaction `xid` for its superior.
    ///
    /// # Errors
    ///
    /// See [`Transaction::rollback_as_subordinate`].
    pub fn rollback_subordinate(&self, xid: &Xid) -> Result<(), TransactionError> {
        self.subordinate(xid)?.rollback_as_subordinate()
    }

    /// Forgets the heuristic outcome of the imported transaction `xid`.
    ///
    /// # Errors
    ///
    /// See [`Transaction::forget_as_subordinate`].
    pub fn forget_subordinate(&self, xid: &Xid) -> Result<(), TransactionError> {
        self.subordinate(xid)?.forget_as_subordinate()
    }

    /// Rebuilds and completes every transaction left in the recovery log.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::Log` if the log cannot be read.
    pub fn recover(&self) -> Result<RecoverySummary, TransactionError> {
        RecoveryManager::new(&self.ctx).recover()
    }

    /// Transactions that have started to complete but not finished.
    #[must_use]
    pub fn in_doubt(&self) -> Vec<Arc<Transaction>> {
        self.ctx
            .live_transactions()
            .into_iter()
            .filter(|tx| tx.state() != TransactionState::Active)
            .collect()
    }

    /// Decides the outcome of a transaction awaiting manual completion.
    ///
    /// # Errors
    ///
    /// See [`Transaction::resolve_manually`].
    pub fn resolve_manually(&self, tx: &Transaction, commit: bool) -> Result<(), TransactionError> {
        tx.resolve_manually(commit)
    }
}

//! The transaction state machine.
//!
//! A [`Transaction`] owns its [`RegisteredResources`] and drives them
//! through the protocol, guarding every state change with the transition
//! table and logging the states recovery needs before acting on them.
//!
//! Lock order is associations, then resources, then state. The state lock
//! is only ever held for a check-and-set; synchronization callbacks and
//! the log unit removal run with no lock held.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::HeuristicDirection;
use crate::context::TxContext;
use crate::error::TransactionError;
use crate::log::{
    RecoverableUnit, GLOBAL_ID_SECTION, RECOVERY_COORDINATOR_SECTION, STATE_SECTION,
};
use crate::registry::{OnePhaseResult, PrepareOutcome, RegisteredResources, RollbackReason};
use crate::resource::{
    CoordinatorRecord, HeuristicOutcome, OnePhaseParticipant, OnePhaseResource, RecordError,
    ResourceDescriptor, ResourceStatus, Vote, XaParticipant, XaResource,
};
use crate::services::{RecoveryCoordinator, ReplayOutcome};
use crate::state::{Status, TransactionState};
use crate::sync::Synchronization;
use crate::timeout::{TimeoutKind, TimeoutTarget};
use crate::wsat::{AsyncParticipant, RemoteParticipant};
use crate::xid::{TransactionId, Xid};

/// Interval used to re-check a timed-out transaction that is still
/// associated with a thread, when it has no timeout of its own.
const REPEAT_TIMEOUT_SECS: u64 = 10;

/// Callback invoked when a suspended transaction sees no client activity
/// for the configured window. Replaces the default rollback.
pub type InactivityCallback = Arc<dyn Fn(&Transaction) + Send + Sync>;

/// Superior coordinator of a subordinate transaction, with the filter of
/// the factory that can rebuild it.
pub type Superior = (String, Arc<dyn RecoveryCoordinator>);

#[derive(Debug, Default)]
struct Associations {
    active: u32,
    suspended: u32,
    threads: Vec<ThreadId>,
}

#[derive(Debug)]
struct RetryState {
    count: u32,
    interval: u64,
}

/// What to do once the resource lock is released.
enum Settle {
    /// The transaction is done: remove its log unit and notify.
    Finished(Status),
    /// The outcome is decided but work remains: notify only.
    Pending(Status),
    /// Nothing yet.
    Nothing,
}

/// One global transaction.
pub struct Transaction {
    id: TransactionId,
    ctx: Arc<TxContext>,
    self_ref: Weak<Transaction>,
    superior: Option<Superior>,
    timeout_secs: AtomicU64,
    state: Mutex<TransactionState>,
    resources: Mutex<RegisteredResources>,
    synchronizations: Mutex<Vec<Arc<dyn Synchronization>>>,
    associations: Mutex<Associations>,
    rollback_only: AtomicBool,
    timed_out: AtomicBool,
    needs_manual_completion: AtomicBool,
    unit: Mutex<Option<Arc<dyn RecoverableUnit>>>,
    retry: Mutex<RetryState>,
    inactivity_callback: Mutex<Option<InactivityCallback>>,
    after_completion_done: AtomicBool,
    finished: AtomicBool,
}

impl Transaction {
    pub(crate) fn new(
        ctx: &Arc<TxContext>,
        id: TransactionId,
        timeout_secs: u64,
        superior: Option<Superior>,
    ) -> Arc<Self> {
        let interval = match ctx.policy().heuristic_retry_interval() {
            0 => 60,
            secs => secs,
        };
        let resources = RegisteredResources::new(id.clone(), ctx.config());
        Arc::new_cyclic(|weak| Self {
            id,
            ctx: Arc::clone(ctx),
            self_ref: weak.clone(),
            superior,
            timeout_secs: AtomicU64::new(timeout_secs),
            state: Mutex::new(TransactionState::Active),
            resources: Mutex::new(resources),
            synchronizations: Mutex::new(Vec::new()),
            associations: Mutex::new(Associations::default()),
            rollback_only: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            needs_manual_completion: AtomicBool::new(false),
            unit: Mutex::new(None),
            retry: Mutex::new(RetryState { count: 0, interval }),
            inactivity_callback: Mutex::new(None),
            after_completion_done: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        })
    }

    // ── Queries ──

    /// Identifier.
    #[must_use]
    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    /// Global identifier.
    #[must_use]
    pub fn xid(&self) -> &Xid {
        self.id.xid()
    }

    /// Whether a superior coordinator drives completion.
    #[must_use]
    pub fn is_subordinate(&self) -> bool {
        self.superior.is_some()
    }

    /// Internal state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    /// Status as reported to applications.
    #[must_use]
    pub fn status(&self) -> Status {
        Status::from_state(self.state(), self.is_rollback_only())
    }

    /// Timeout in seconds (0 = none).
    #[must_use]
    pub fn timeout(&self) -> u64 {
        self.timeout_secs.load(Ordering::Relaxed)
    }

    /// Whether the transaction can only roll back.
    #[must_use]
    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::SeqCst)
    }

    /// Whether the transaction timeout expired.
    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// Whether an operator must decide the outcome.
    #[must_use]
    pub fn needs_manual_completion(&self) -> bool {
        self.needs_manual_completion.load(Ordering::SeqCst)
    }

    /// Whether the transaction has finished and left the log.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Aggregate heuristic outcome so far.
    #[must_use]
    pub fn heuristic_outcome(&self) -> HeuristicOutcome {
        self.resources.lock().heuristic_outcome()
    }

    /// Key and status of every participant.
    #[must_use]
    pub fn resource_statuses(&self) -> Vec<(String, ResourceStatus)> {
        self.resources.lock().statuses()
    }

    /// Keys of participants awaiting a completion retry.
    #[must_use]
    pub fn failed_resources(&self) -> Vec<String> {
        self.resources.lock().failed_resources().to_vec()
    }

    /// Completion retries performed so far.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry.lock().count
    }

    /// Current completion retry interval in seconds.
    #[must_use]
    pub fn retry_interval(&self) -> u64 {
        self.retry.lock().interval
    }

    /// Marks the transaction rollback-only.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::IllegalState` once completion has
    /// started past prepare.
    pub fn set_rollback_only(&self) -> Result<(), TransactionError> {
        let state = self.state();
        match state {
            TransactionState::Active | TransactionState::Preparing | TransactionState::Prepared => {
                self.rollback_only.store(true, Ordering::SeqCst);
                debug!(tx = %self.id, "marked rollback-only");
                Ok(())
            }
            _ => Err(TransactionError::IllegalState(format!(
                "cannot mark {} rollback-only in state {state}",
                self.id
            ))),
        }
    }

    /// Replaces the default inactivity rollback.
    pub fn set_inactivity_callback(&self, callback: InactivityCallback) {
        *self.inactivity_callback.lock() = Some(callback);
    }

    // ── State changes ──

    fn set_state(&self, next: TransactionState) -> Result<(), TransactionError> {
        {
            let mut state = self.state.lock();
            if !state.can_transition_to(next) {
                return Err(TransactionError::IllegalState(format!(
                    "{}: illegal transition {} -> {next}",
                    self.id, *state
                )));
            }
            *state = next;
        }
        debug!(tx = %self.id, state = %next, "state changed");
        self.log_state(next)
    }

    fn advance_to(&self, next: TransactionState) -> Result<(), TransactionError> {
        if self.state() == next {
            return Ok(());
        }
        self.set_state(next)
    }

    fn log_state(&self, state: TransactionState) -> Result<(), TransactionError> {
        if !state.is_logged() {
            return Ok(());
        }
        let unit = self.unit.lock().clone();
        if let Some(unit) = unit {
            unit.replace_data(STATE_SECTION, &[state.to_byte()])?;
            unit.force()?;
        }
        Ok(())
    }

    fn arm(&self, kind: TimeoutKind, seconds: u64) {
        let target: Weak<dyn TimeoutTarget> = self.self_ref.clone();
        self.ctx
            .timeouts()
            .set_timeout(self.id.local(), target, kind, seconds);
    }

    pub(crate) fn arm_timeout(&self, kind: TimeoutKind, seconds: u64) {
        self.arm(kind, seconds);
    }

    pub(crate) fn cancel_timeout(&self, kind: TimeoutKind) {
        self.ctx.timeouts().cancel(self.id.local(), kind);
    }

    // ── Associations ──

    /// Records that a thread has started working on the transaction.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::Rollback` if another thread is already
    /// actively associated; the transaction is then marked rollback-only.
    pub fn add_association(&self) -> Result<(), TransactionError> {
        let mut assoc = self.associations.lock();
        if assoc.active > assoc.suspended {
            self.rollback_only.store(true, Ordering::SeqCst);
            warn!(
                tx = %self.id,
                active = assoc.active,
                suspended = assoc.suspended,
                "concurrent association rejected"
            );
            return Err(TransactionError::Rollback(format!(
                "{} is already active on another thread",
                self.id
            )));
        }
        assoc.active += 1;
        assoc.threads.push(std::thread::current().id());
        Ok(())
    }

    /// Records that a thread has stopped working on the transaction.
    pub fn remove_association(&self) {
        let mut assoc = self.associations.lock();
        assoc.active = assoc.active.saturating_sub(1);
        let me = std::thread::current().id();
        if let Some(pos) = assoc.threads.iter().rposition(|t| *t == me) {
            assoc.threads.remove(pos);
        } else {
            assoc.threads.pop();
        }
    }

    /// Records a suspension that is expected to be resumed.
    pub fn suspend_association(&self) {
        self.associations.lock().suspended += 1;
    }

    /// Undoes [`Transaction::suspend_association`].
    pub fn resume_association(&self) {
        let mut assoc = self.associations.lock();
        assoc.suspended = assoc.suspended.saturating_sub(1);
    }

    /// Threads currently associated.
    #[must_use]
    pub fn active_associations(&self) -> u32 {
        self.associations.lock().active
    }

    /// Outstanding suspensions.
    #[must_use]
    pub fn suspended_associations(&self) -> u32 {
        self.associations.lock().suspended
    }

    /// Whether a thread other than `thread` is actively associated.
    #[must_use]
    pub fn is_active_elsewhere(&self, thread: ThreadId) -> bool {
        let assoc = self.associations.lock();
        assoc.active > assoc.suspended && assoc.threads.last() != Some(&thread)
    }

    // ── Enlistment ──

    fn check_enlistable(&self) -> Result<(), TransactionError> {
        let state = self.state();
        if state != TransactionState::Active {
            return Err(TransactionError::IllegalState(format!(
                "cannot enlist in {} while {state}",
                self.id
            )));
        }
        if self.is_rollback_only() {
            return Err(TransactionError::Rollback(format!(
                "{} is marked rollback-only",
                self.id
            )));
        }
        Ok(())
    }

    /// Enlists an XA resource on a fresh branch.
    ///
    /// # Errors
    ///
    /// Fails if the transaction is not active or the key is already
    /// enlisted.
    pub fn enlist_resource(
        &self,
        resource: Box<dyn XaResource>,
        descriptor: ResourceDescriptor,
    ) -> Result<(), TransactionError> {
        let mut reg = self.resources.lock();
        self.check_enlistable()?;
        let xid = reg.branch_xid();
        reg.add_resource(Box::new(XaParticipant::new(resource, descriptor, xid)))
    }

    /// Enlists the one-phase (last) resource.
    ///
    /// # Errors
    ///
    /// Fails if the transaction is not active, a one-phase resource is
    /// already enlisted, or the transaction is a subordinate.
    pub fn enlist_one_phase(
        &self,
        resource: Box<dyn OnePhaseResource>,
        name: &str,
        priority: i32,
    ) -> Result<(), TransactionError> {
        if self.is_subordinate() {
            return Err(TransactionError::NotSupported(
                "subordinate transactions cannot enlist one-phase resources".into(),
            ));
        }
        let mut reg = self.resources.lock();
        self.check_enlistable()?;
        reg.add_one_phase_resource(Box::new(OnePhaseParticipant::new(resource, name, priority)))
    }

    /// Enlists a remote participant.
    ///
    /// # Errors
    ///
    /// Fails if the transaction is not active or the key is already
    /// enlisted.
    pub fn enlist_async(
        &self,
        remote: Arc<dyn RemoteParticipant>,
        descriptor: ResourceDescriptor,
    ) -> Result<(), TransactionError> {
        let mut reg = self.resources.lock();
        self.check_enlistable()?;
        let xid = reg.branch_xid();
        reg.add_async_resource(AsyncParticipant::new(
            remote,
            Arc::clone(self.ctx.pool()),
            descriptor,
            xid,
        ))
    }

    /// Registers a synchronization callback.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::IllegalState` unless the transaction is
    /// active, or `Rollback` if it is marked rollback-only.
    pub fn register_synchronization(&self, sync: Arc<dyn Synchronization>) -> Result<(), TransactionError> {
        self.check_enlistable()?;
        self.synchronizations.lock().push(sync);
        Ok(())
    }

    // ── Completion ──

    /// Runs `before_completion` on every synchronization. The first
    /// failure marks the transaction rollback-only and stops the round.
    pub fn before_completion(&self) {
        if self.state() != TransactionState::Active || self.is_rollback_only() {
            return;
        }
        let syncs = self.synchronizations.lock().clone();
        for sync in syncs {
            if let Err(e) = sync.before_completion() {
                warn!(tx = %self.id, error = %e, "before_completion failed; marking rollback-only");
                self.rollback_only.store(true, Ordering::SeqCst);
                break;
            }
        }
    }

    /// Subordinates are completed by their superior, and a transaction
    /// with outstanding suspensions cannot complete.
    pub(crate) fn check_completable(&self) -> Result<(), TransactionError> {
        if self.is_subordinate() {
            return Err(TransactionError::Security(format!(
                "{} is completed by its superior",
                self.id
            )));
        }
        if self.suspended_associations() > 0 {
            return Err(TransactionError::Security(format!(
                "{} has outstanding suspended associations",
                self.id
            )));
        }
        Ok(())
    }

    /// Runs `before_completion`, then prepares, logs and commits every
    /// participant, or rolls them all back.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::Security` for a subordinate or while
    /// suspensions are outstanding, `Rollback` if the transaction rolled
    /// back, a heuristic error if participants disagree on the outcome, or
    /// `IllegalState` if completion already started elsewhere.
    pub fn commit(&self) -> Result<(), TransactionError> {
        self.check_completable()?;
        self.before_completion();
        self.complete_commit()
    }

    pub(crate) fn complete_commit(&self) -> Result<(), TransactionError> {
        if let Err(e) = self.set_state(TransactionState::Preparing) {
            return Err(self.completion_conflict(e));
        }
        self.cancel_timeout(TimeoutKind::Active);
        self.cancel_timeout(TimeoutKind::Repeat);
        info!(tx = %self.id, "commit started");

        let (result, settle) = {
            let mut reg = self.resources.lock();
            self.commit_locked(&mut reg)
        };
        self.settle(settle);
        result
    }

    fn completion_conflict(&self, err: TransactionError) -> TransactionError {
        if self.is_timed_out() {
            TransactionError::Rollback(format!("{} timed out and was rolled back", self.id))
        } else {
            err
        }
    }

    fn commit_locked(&self, reg: &mut RegisteredResources) -> (Result<(), TransactionError>, Settle) {
        if self.is_rollback_only() {
            let reason = if self.is_timed_out() {
                "timed out"
            } else {
                "marked rollback-only"
            };
            let (result, settle) = self.complete_locked(reg, false);
            let err = result.err().unwrap_or_else(|| {
                TransactionError::Rollback(format!("{} {reason}", self.id))
            });
            return (Err(err), settle);
        }

        if reg.is_empty() {
            return match self.set_state(TransactionState::Committed) {
                Ok(()) => (Ok(()), Settle::Finished(Status::Committed)),
                Err(e) => (Err(e), Settle::Nothing),
            };
        }

        if reg.is_only_agent() {
            debug!(tx = %self.id, "single resource; committing in one phase");
            let result = reg.commit_only_agent();
            return self.complete_one_phase(reg, result);
        }

        match reg.distribute_prepare(self.is_subordinate(), &self.rollback_only) {
            PrepareOutcome::ReadOnly => match self.set_state(TransactionState::Committed) {
                Ok(()) => (Ok(()), Settle::Finished(Status::Committed)),
                Err(e) => (Err(e), Settle::Nothing),
            },
            PrepareOutcome::OnePhase(result) => self.complete_one_phase(reg, result),
            PrepareOutcome::Commit => {
                if let Err(e) = self.log_prepared(reg) {
                    return self.rollback_after_log_failure(reg, e);
                }
                self.complete_locked(reg, true)
            }
            PrepareOutcome::LastParticipant => {
                if let Err(e) = self
                    .log_prepared(reg)
                    .and_then(|()| self.set_state(TransactionState::LastParticipant))
                {
                    return self.rollback_after_log_failure(reg, e);
                }
                let result = reg.commit_last_agent();
                self.complete_last_participant(reg, result)
            }
            PrepareOutcome::Rollback(reason) => {
                let (result, settle) = self.complete_locked(reg, false);
                (Err(result.err().unwrap_or_else(|| reason.into_error())), settle)
            }
        }
    }

    fn rollback_after_log_failure(
        &self,
        reg: &mut RegisteredResources,
        err: TransactionError,
    ) -> (Result<(), TransactionError>, Settle) {
        error!(tx = %self.id, error = %err, "cannot log prepared resources; rolling back");
        let (_, settle) = self.complete_locked(reg, false);
        (
            Err(TransactionError::Rollback(format!(
                "{}: recovery log write failed: {err}",
                self.id
            ))),
            settle,
        )
    }

    fn log_prepared(&self, reg: &mut RegisteredResources) -> Result<(), TransactionError> {
        let unit = self.ensure_unit()?;
        reg.attach_log(unit);
        reg.log_resources()
    }

    fn ensure_unit(&self) -> Result<Arc<dyn RecoverableUnit>, TransactionError> {
        let mut slot = self.unit.lock();
        if let Some(unit) = slot.as_ref() {
            return Ok(Arc::clone(unit));
        }
        let unit = self.ctx.log().create_unit()?;
        unit.replace_data(GLOBAL_ID_SECTION, &self.id.xid().to_bytes())?;
        if let Some((filter, coordinator)) = &self.superior {
            let record = CoordinatorRecord {
                filter: filter.clone(),
                data: coordinator.to_bytes(),
            };
            unit.replace_data(RECOVERY_COORDINATOR_SECTION, &record.to_bytes())?;
        }
        debug!(tx = %self.id, unit = unit.id(), "log unit created");
        *slot = Some(Arc::clone(&unit));
        Ok(unit)
    }

    /// Moves into the commit or rollback family of states, delivers the
    /// outcome, and works out what follows.
    fn complete_locked(
        &self,
        reg: &mut RegisteredResources,
        commit: bool,
    ) -> (Result<(), TransactionError>, Settle) {
        let state = self.state();
        let in_family = if commit {
            matches!(
                state,
                TransactionState::Committing | TransactionState::HeuristicOnCommit
            )
        } else {
            matches!(
                state,
                TransactionState::RollingBack | TransactionState::HeuristicOnRollback
            )
        };
        if !in_family {
            let next = if commit {
                TransactionState::Committing
            } else {
                TransactionState::RollingBack
            };
            if let Err(e) = self.set_state(next) {
                return (Err(e), Settle::Nothing);
            }
        }
        let result = if commit {
            reg.distribute_commit()
        } else {
            reg.distribute_rollback()
        };
        self.after_outcome(reg, commit, result)
    }

    fn after_outcome(
        &self,
        reg: &mut RegisteredResources,
        commit: bool,
        result: Result<(), TransactionError>,
    ) -> (Result<(), TransactionError>, Settle) {
        let status = if commit {
            Status::Committed
        } else {
            Status::RolledBack
        };

        if reg.retry_required() {
            if self.retries_exhausted() {
                return (result, self.give_up(reg, commit));
            }
            self.schedule_retry();
            return (result, Settle::Pending(status));
        }

        if reg.has_heuristics() {
            let heuristic_state = if commit {
                TransactionState::HeuristicOnCommit
            } else {
                TransactionState::HeuristicOnRollback
            };
            if let Err(e) = self.advance_to(heuristic_state) {
                return (Err(e), Settle::Pending(status));
            }
            if self.is_subordinate() {
                // The superior decides when to forget.
                return (result, Settle::Pending(status));
            }
            if reg.distribute_forget() {
                if self.retries_exhausted() {
                    return (result, self.give_up(reg, commit));
                }
                self.schedule_retry();
                return (result, Settle::Pending(status));
            }
        }

        let terminal = if commit {
            TransactionState::Committed
        } else {
            TransactionState::RolledBack
        };
        if let Err(e) = self.advance_to(terminal) {
            return (Err(e), Settle::Pending(status));
        }
        (result, Settle::Finished(status))
    }

    fn complete_one_phase(
        &self,
        reg: &mut RegisteredResources,
        result: OnePhaseResult,
    ) -> (Result<(), TransactionError>, Settle) {
        match result {
            OnePhaseResult::Committed
            | OnePhaseResult::Heuristic(HeuristicOutcome::Commit | HeuristicOutcome::None, _) => {
                if let Err(e) = self.set_state(TransactionState::Committing) {
                    return (Err(e), Settle::Nothing);
                }
                self.after_outcome(reg, true, Ok(()))
            }
            OnePhaseResult::RolledBack(msg) => {
                let (_, settle) = self.one_phase_rolled_back(reg);
                (Err(TransactionError::Rollback(msg)), settle)
            }
            OnePhaseResult::Heuristic(HeuristicOutcome::Rollback, msg) => {
                let (_, settle) = self.one_phase_rolled_back(reg);
                (Err(TransactionError::HeuristicRollback(msg)), settle)
            }
            OnePhaseResult::Heuristic(outcome, msg) => {
                if let Err(e) = self.set_state(TransactionState::Committing) {
                    return (Err(e), Settle::Nothing);
                }
                let (_, settle) = self.after_outcome(reg, true, Ok(()));
                let err = if outcome == HeuristicOutcome::Mixed {
                    TransactionError::HeuristicMixed(msg)
                } else {
                    TransactionError::HeuristicHazard(msg)
                };
                (Err(err), settle)
            }
            OnePhaseResult::Unknown(msg) => {
                if let Err(e) = self.set_state(TransactionState::Committing) {
                    return (Err(e), Settle::Nothing);
                }
                let (_, settle) = self.after_outcome(reg, true, Ok(()));
                (Err(TransactionError::HeuristicHazard(msg)), settle)
            }
            OnePhaseResult::Failed(msg) => {
                if let Err(e) = self.set_state(TransactionState::Committing) {
                    return (Err(e), Settle::Nothing);
                }
                let (_, settle) = self.after_outcome(reg, true, Ok(()));
                (Err(TransactionError::System(msg)), settle)
            }
        }
    }

    fn one_phase_rolled_back(&self, reg: &mut RegisteredResources) -> (Result<(), TransactionError>, Settle) {
        if let Err(e) = self.set_state(TransactionState::RollingBack) {
            return (Err(e), Settle::Nothing);
        }
        let result = reg.distribute_rollback();
        self.after_outcome(reg, false, result)
    }

    fn complete_last_participant(
        &self,
        reg: &mut RegisteredResources,
        result: OnePhaseResult,
    ) -> (Result<(), TransactionError>, Settle) {
        match result {
            OnePhaseResult::Committed | OnePhaseResult::Heuristic(HeuristicOutcome::Commit, _) => {
                self.complete_locked(reg, true)
            }
            OnePhaseResult::RolledBack(msg)
            | OnePhaseResult::Heuristic(HeuristicOutcome::Rollback, msg) => {
                info!(tx = %self.id, "last participant rolled back; rolling back the rest");
                let (result, settle) = self.complete_locked(reg, false);
                (
                    Err(result.err().unwrap_or_else(|| TransactionError::Rollback(msg))),
                    settle,
                )
            }
            OnePhaseResult::Heuristic(_, msg)
            | OnePhaseResult::Unknown(msg)
            | OnePhaseResult::Failed(msg) => {
                error!(tx = %self.id, error = %msg, "last participant outcome unknown");
                let settle = self.direction_locked(reg);
                (Err(TransactionError::HeuristicHazard(msg)), settle)
            }
        }
    }

    /// Resolves an undeterminable outcome with the configured direction.
    fn direction_locked(&self, reg: &mut RegisteredResources) -> Settle {
        match self.ctx.policy().heuristic_completion_direction() {
            HeuristicDirection::Commit => {
                warn!(tx = %self.id, "completing heuristically: commit");
                reg.record_heuristic(HeuristicOutcome::Commit);
                self.complete_locked(reg, true).1
            }
            HeuristicDirection::Rollback => {
                warn!(tx = %self.id, "completing heuristically: rollback");
                reg.record_heuristic(HeuristicOutcome::Rollback);
                self.complete_locked(reg, false).1
            }
            HeuristicDirection::Manual => {
                self.needs_manual_completion.store(true, Ordering::SeqCst);
                warn!(tx = %self.id, state = %self.state(), "transaction requires manual completion");
                Settle::Nothing
            }
        }
    }

    fn apply_heuristic_direction(&self) {
        let settle = {
            let mut reg = self.resources.lock();
            self.direction_locked(&mut reg)
        };
        self.settle(settle);
    }

    /// Rolls back a transaction that has not started to commit.
    ///
    /// Rolling back a transaction that was already rolled back because it
    /// timed out succeeds.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::Security` for a subordinate or while
    /// suspensions are outstanding, `IllegalState` if completion already
    /// started, or a heuristic error if a participant committed.
    pub fn rollback(&self) -> Result<(), TransactionError> {
        self.check_completable()?;
        self.rollback_local()
    }

    pub(crate) fn rollback_local(&self) -> Result<(), TransactionError> {
        if let Err(e) = self.set_state(TransactionState::RollingBack) {
            let state = self.state();
            if self.is_timed_out()
                && matches!(state, TransactionState::RollingBack | TransactionState::RolledBack)
            {
                debug!(tx = %self.id, "already rolled back after timeout");
                return Ok(());
            }
            return Err(e);
        }
        self.cancel_timeout(TimeoutKind::Active);
        self.cancel_timeout(TimeoutKind::Repeat);
        info!(tx = %self.id, "rollback started");

        let (result, settle) = {
            let mut reg = self.resources.lock();
            self.complete_locked(&mut reg, false)
        };
        self.settle(settle);
        result
    }

    fn timeout_transaction(&self, initial: bool) {
        self.timed_out.store(true, Ordering::SeqCst);
        self.rollback_only.store(true, Ordering::SeqCst);

        let assoc = self.associations.lock();
        if self.state() != TransactionState::Active {
            return;
        }
        if assoc.active > 0 {
            drop(assoc);
            let timeout = self.timeout();
            let secs = if timeout == 0 { REPEAT_TIMEOUT_SECS } else { timeout };
            info!(tx = %self.id, retry_in = secs, "timed out while associated; rollback deferred");
            self.arm(TimeoutKind::Repeat, secs);
            return;
        }
        if self.set_state(TransactionState::RollingBack).is_err() {
            return;
        }
        drop(assoc);

        warn!(tx = %self.id, timeout = self.timeout(), "transaction timed out; rolling back");
        let (result, settle) = {
            let mut reg = self.resources.lock();
            if initial {
                reg.abort_all();
            }
            self.complete_locked(&mut reg, false)
        };
        if let Err(e) = result {
            warn!(tx = %self.id, error = %e, "timeout rollback reported an error");
        }
        self.settle(settle);
    }

    fn inactivity_timeout(&self) {
        let callback = self.inactivity_callback.lock().clone();
        if let Some(callback) = callback {
            debug!(tx = %self.id, "inactivity timeout handed to callback");
            callback(self);
            return;
        }

        warn!(tx = %self.id, "client inactivity timeout; rolling back");
        self.rollback_only.store(true, Ordering::SeqCst);
        let assoc = self.associations.lock();
        if self.state() != TransactionState::Active {
            return;
        }
        let on_thread = assoc.active > 0;
        if self.set_state(TransactionState::RollingBack).is_err() {
            return;
        }
        drop(assoc);

        if on_thread {
            self.suspend_association();
        }
        let (_, settle) = {
            let mut reg = self.resources.lock();
            self.complete_locked(&mut reg, false)
        };
        self.settle(settle);
        if on_thread {
            self.resume_association();
        }
    }

    // ── Retry ──

    fn retries_exhausted(&self) -> bool {
        let limit = self.ctx.policy().heuristic_retry_limit();
        limit > 0 && self.retry.lock().count >= limit
    }

    fn schedule_retry(&self) {
        let interval = self.retry.lock().interval;
        warn!(tx = %self.id, retry_in = interval, "completion incomplete; retry scheduled");
        self.arm(TimeoutKind::InDoubt, interval);
    }

    fn count_retry(&self) {
        let max = self.ctx.config().max_retry_interval;
        let mut retry = self.retry.lock();
        retry.count += 1;
        if retry.count % 10 == 0 {
            let doubled = retry.interval.saturating_mul(2);
            retry.interval = if max > 0 { doubled.min(max) } else { doubled };
            debug!(tx = %self.id, interval = retry.interval, "retry interval doubled");
        }
    }

    fn give_up(&self, reg: &mut RegisteredResources, commit: bool) -> Settle {
        let count = self.retry.lock().count;
        error!(
            tx = %self.id,
            retries = count,
            failed = ?reg.failed_resources(),
            "retry limit reached; abandoning completion"
        );
        reg.destroy_resources();
        reg.record_heuristic(HeuristicOutcome::Mixed);
        let (heuristic_state, terminal, status) = if commit {
            (
                TransactionState::HeuristicOnCommit,
                TransactionState::Committed,
                Status::Committed,
            )
        } else {
            (
                TransactionState::HeuristicOnRollback,
                TransactionState::RolledBack,
                Status::RolledBack,
            )
        };
        if let Err(e) = self
            .advance_to(heuristic_state)
            .and_then(|()| self.set_state(terminal))
        {
            warn!(tx = %self.id, error = %e, "cannot record abandoned completion");
        }
        Settle::Finished(status)
    }

    /// Runs one completion retry now, as the IN_DOUBT alarm would. A
    /// subordinate still waiting for its superior asks it for the outcome.
    pub fn retry_completion(&self) {
        if self.needs_manual_completion() || self.is_finished() {
            return;
        }
        self.count_retry();
        let commit = match self.state() {
            TransactionState::Preparing | TransactionState::Prepared if self.is_subordinate() => {
                self.replay_completion();
                return;
            }
            TransactionState::Committing | TransactionState::HeuristicOnCommit => true,
            TransactionState::RollingBack | TransactionState::HeuristicOnRollback => false,
            state => {
                debug!(tx = %self.id, %state, "nothing to retry");
                return;
            }
        };
        info!(tx = %self.id, attempt = self.retry_count(), commit, "retrying completion");
        let (result, settle) = {
            let mut reg = self.resources.lock();
            self.complete_locked(&mut reg, commit)
        };
        if let Err(e) = result {
            warn!(tx = %self.id, error = %e, "retry reported a heuristic outcome");
        }
        self.settle(settle);
    }

    /// Asks the superior for the outcome and applies it. Without an answer
    /// the request is retried; once the retry limit is reached the
    /// configured direction decides.
    fn replay_completion(&self) {
        let Some((_, coordinator)) = &self.superior else {
            self.apply_heuristic_direction();
            return;
        };
        let answer = coordinator.replay_completion(self.id.xid());
        debug!(tx = %self.id, ?answer, "replay completion answered");
        match answer {
            Ok(ReplayOutcome::Committed) => self.log_recovery_result(self.resolve(true)),
            Ok(ReplayOutcome::RolledBack) => self.log_recovery_result(self.resolve(false)),
            Ok(ReplayOutcome::Unknown) | Err(_) => {
                if self.retries_exhausted() {
                    warn!(tx = %self.id, "superior never answered; applying heuristic direction");
                    self.apply_heuristic_direction();
                } else {
                    let interval = self.retry.lock().interval;
                    self.arm(TimeoutKind::InDoubt, interval);
                }
            }
        }
    }

    fn resolve(&self, commit: bool) -> Result<(), TransactionError> {
        let (result, settle) = {
            let mut reg = self.resources.lock();
            self.complete_locked(&mut reg, commit)
        };
        self.settle(settle);
        result
    }

    fn log_recovery_result(&self, result: Result<(), TransactionError>) {
        if let Err(e) = result {
            warn!(tx = %self.id, error = %e, "completion reported a heuristic outcome");
        }
    }

    /// Completes a transaction that is waiting for an operator.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::IllegalState` if the transaction is not
    /// waiting for manual completion, or the heuristic error of the pass.
    pub fn resolve_manually(&self, commit: bool) -> Result<(), TransactionError> {
        if !self.needs_manual_completion.swap(false, Ordering::SeqCst) {
            return Err(TransactionError::IllegalState(format!(
                "{} is not awaiting manual completion",
                self.id
            )));
        }
        info!(tx = %self.id, commit, "manual completion");
        self.retry.lock().count = 0;
        self.resolve(commit)
    }

    // ── Subordinate ──

    /// First phase on behalf of the superior.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::Rollback` if the subordinate rolled
    /// back, or `IllegalState` if it is not active.
    pub fn prepare_as_subordinate(&self) -> Result<Vote, TransactionError> {
        self.before_completion();
        if let Err(e) = self.set_state(TransactionState::Preparing) {
            return Err(self.completion_conflict(e));
        }
        self.cancel_timeout(TimeoutKind::Active);
        self.cancel_timeout(TimeoutKind::Repeat);
        info!(tx = %self.id, "subordinate prepare");

        let (result, settle) = {
            let mut reg = self.resources.lock();
            self.prepare_locked(&mut reg)
        };
        self.settle(settle);
        result
    }

    fn prepare_locked(&self, reg: &mut RegisteredResources) -> (Result<Vote, TransactionError>, Settle) {
        let outcome = if self.is_rollback_only() {
            PrepareOutcome::Rollback(RollbackReason::RollbackOnly)
        } else if reg.is_empty() {
            PrepareOutcome::ReadOnly
        } else {
            reg.distribute_prepare(true, &self.rollback_only)
        };
        match outcome {
            PrepareOutcome::ReadOnly => match self.set_state(TransactionState::Committed) {
                Ok(()) => (Ok(Vote::ReadOnly), Settle::Finished(Status::Committed)),
                Err(e) => (Err(e), Settle::Nothing),
            },
            PrepareOutcome::Commit => {
                if let Err(e) = self
                    .log_prepared(reg)
                    .and_then(|()| self.set_state(TransactionState::Prepared))
                {
                    let (_, settle) = self.rollback_after_log_failure(reg, e);
                    return (
                        Err(TransactionError::Rollback(format!(
                            "{}: cannot log prepared state",
                            self.id
                        ))),
                        settle,
                    );
                }
                (Ok(Vote::Ok), Settle::Nothing)
            }
            PrepareOutcome::Rollback(reason) => {
                let (result, settle) = self.complete_locked(reg, false);
                (Err(result.err().unwrap_or_else(|| reason.into_error())), settle)
            }
            PrepareOutcome::OnePhase(_) | PrepareOutcome::LastParticipant => {
                let (_, settle) = self.complete_locked(reg, false);
                (
                    Err(TransactionError::System(format!(
                        "{}: one-phase completion during subordinate prepare",
                        self.id
                    ))),
                    settle,
                )
            }
        }
    }

    /// Second phase (or single-phase commit) on behalf of the superior.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::IllegalState` if a two-phase commit
    /// arrives before prepare, or the heuristic error of the pass.
    pub fn commit_as_subordinate(&self, one_phase: bool) -> Result<(), TransactionError> {
        if one_phase {
            self.before_completion();
            return self.complete_commit();
        }
        let state = self.state();
        if !matches!(
            state,
            TransactionState::Prepared
                | TransactionState::Committing
                | TransactionState::HeuristicOnCommit
        ) {
            return Err(TransactionError::IllegalState(format!(
                "{}: commit requested in state {state}",
                self.id
            )));
        }
        self.cancel_timeout(TimeoutKind::InDoubt);
        self.resolve(true)
    }

    /// Rollback on behalf of the superior.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::IllegalState` once a commit has started,
    /// or the heuristic error of the pass.
    pub fn rollback_as_subordinate(&self) -> Result<(), TransactionError> {
        match self.state() {
            TransactionState::Active => self.rollback_local(),
            TransactionState::Prepared
            | TransactionState::RollingBack
            | TransactionState::HeuristicOnRollback => {
                self.cancel_timeout(TimeoutKind::InDoubt);
                self.resolve(false)
            }
            state => Err(TransactionError::IllegalState(format!(
                "{}: rollback requested in state {state}",
                self.id
            ))),
        }
    }

    /// Forgets a heuristic outcome on behalf of the superior.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::IllegalState` unless the transaction is
    /// in a heuristic state.
    pub fn forget_as_subordinate(&self) -> Result<(), TransactionError> {
        let commit = match self.state() {
            TransactionState::HeuristicOnCommit => true,
            TransactionState::HeuristicOnRollback => false,
            state => {
                return Err(TransactionError::IllegalState(format!(
                    "{}: forget requested in state {state}",
                    self.id
                )))
            }
        };
        let settle = {
            let mut reg = self.resources.lock();
            if reg.distribute_forget() {
                self.schedule_retry();
                Settle::Nothing
            } else {
                let (terminal, status) = if commit {
                    (TransactionState::Committed, Status::Committed)
                } else {
                    (TransactionState::RolledBack, Status::RolledBack)
                };
                self.set_state(terminal)?;
                Settle::Finished(status)
            }
        };
        self.settle(settle);
        Ok(())
    }

    // ── Recovery ──

    /// Rebuilds a transaction from its log unit. Units written before the
    /// state was logged are treated as still preparing.
    pub(crate) fn reconstruct(
        ctx: &Arc<TxContext>,
        unit: Arc<dyn RecoverableUnit>,
    ) -> Result<Arc<Self>, TransactionError> {
        let state = match unit.last_data(STATE_SECTION) {
            Some(bytes) => {
                TransactionState::from_byte(*bytes.first().ok_or(RecordError::Truncated(0))?)?
            }
            None => TransactionState::Preparing,
        };
        let gid = unit.last_data(GLOBAL_ID_SECTION).ok_or_else(|| {
            TransactionError::System(format!("log unit {} has no global id", unit.id()))
        })?;
        let xid = Xid::from_bytes(&gid)?;

        let superior = match unit.last_data(RECOVERY_COORDINATOR_SECTION) {
            Some(bytes) => {
                let record = CoordinatorRecord::from_bytes(&bytes)?;
                let factory = ctx.services().coordinator_factory(&record.filter)?;
                let coordinator = factory.restore(&record.data).map_err(|e| {
                    TransactionError::System(format!("cannot restore superior coordinator: {e}"))
                })?;
                Some((record.filter, coordinator))
            }
            None => None,
        };

        let tx = Self::new(ctx, ctx.ids().adopt(xid), 0, superior);
        tx.resources
            .lock()
            .reconstruct(Arc::clone(&unit), ctx.services(), ctx.pool())?;
        *tx.state.lock() = state;
        *tx.unit.lock() = Some(unit);
        info!(tx = %tx.id, %state, subordinate = tx.is_subordinate(), "transaction reconstructed");
        Ok(tx)
    }

    /// Drives a reconstructed transaction towards completion.
    pub(crate) fn recover(&self) {
        let state = self.state();
        let result = match state {
            TransactionState::Committing | TransactionState::HeuristicOnCommit => self.resolve(true),
            TransactionState::RollingBack | TransactionState::HeuristicOnRollback => {
                self.resolve(false)
            }
            _ if self.is_subordinate() => {
                self.replay_completion();
                Ok(())
            }
            TransactionState::LastParticipant => {
                self.apply_heuristic_direction();
                Ok(())
            }
            // Presumed abort.
            _ => self.resolve(false),
        };
        self.log_recovery_result(result);
    }

    // ── Finishing ──

    fn settle(&self, settle: Settle) {
        match settle {
            Settle::Finished(status) => self.finish(status),
            Settle::Pending(status) => self.distribute_after(status),
            Settle::Nothing => {}
        }
    }

    fn finish(&self, status: Status) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ctx.timeouts().cancel_all(self.id.local());
        let unit = self.unit.lock().take();
        if let Some(unit) = unit {
            if let Err(e) = self.ctx.log().remove_unit(unit.id()) {
                warn!(tx = %self.id, unit = unit.id(), error = %e, "cannot remove log unit");
            }
        }
        self.distribute_after(status);
        self.ctx.release(self.id.local());
        info!(tx = %self.id, ?status, "transaction finished");
    }

    fn distribute_after(&self, status: Status) {
        if self.after_completion_done.swap(true, Ordering::SeqCst) {
            return;
        }
        let syncs = std::mem::take(&mut *self.synchronizations.lock());
        for sync in syncs {
            sync.after_completion(status);
        }
    }
}

impl TimeoutTarget for Transaction {
    fn timeout_fired(&self, kind: TimeoutKind) {
        debug!(tx = %self.id, %kind, "alarm fired");
        match kind {
            TimeoutKind::Active => self.timeout_transaction(true),
            TimeoutKind::Repeat => self.timeout_transaction(false),
            TimeoutKind::InDoubt => self.retry_completion(),
            TimeoutKind::Inactivity => self.inactivity_timeout(),
            TimeoutKind::Cancel => {}
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("subordinate", &self.is_subordinate())
            .finish_non_exhaustive()
    }
}

//! Registered resources: the two-phase-commit driver for one transaction.
//!
//! [`RegisteredResources`] owns every participant enlisted in a transaction
//! and runs the protocol across them:
//!
//! ```text
//!   enlist ──▶ distribute_prepare ──▶ log_resources ──▶ distribute_commit
//!                     │                                       │
//!                     └── rollback vote ──▶ distribute_rollback
//!                                                             │
//!                                     heuristic states ──▶ distribute_forget
//! ```
//!
//! Prepare failures always resolve to rolling back the whole transaction.
//! Completion failures are isolated per participant: a participant that
//! cannot be reached is put in the failed set and the caller is told to
//! retry, while every other participant completes normally.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::{AsyncPrepareOrdering, TransactionConfig};
use crate::error::{ResourceError, TransactionError, XaErrorCode};
use crate::log::{
    RecoverableUnit, Section, ASYNC_RESOURCE_SECTION, HEURISTIC_OUTCOME_SECTION,
    XA_RESOURCE_SECTION,
};
use crate::resource::{
    HeuristicOutcome, Participant, RecordError, RecoveryRecord, ResourceStatus, Vote,
    XaParticipant,
};
use crate::services::ServiceRegistry;
use crate::wsat::{AsyncParticipant, WorkerPool};
use crate::xid::{TransactionId, Xid};

/// Why a prepare ended in rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackReason {
    /// A participant voted to roll back.
    Vote(String),
    /// A participant could not be reached.
    CommunicationFailure(String),
    /// A participant completed heuristically during prepare.
    Heuristic(HeuristicOutcome, String),
    /// A participant reported an internal error.
    System(String),
    /// The transaction was marked rollback-only.
    RollbackOnly,
    /// A subordinate cannot prepare a one-phase resource.
    SubordinateOnePhase,
}

impl RollbackReason {
    /// Error reported to the caller of commit.
    #[must_use]
    pub fn into_error(self) -> TransactionError {
        match self {
            Self::Vote(msg) | Self::CommunicationFailure(msg) => TransactionError::Rollback(msg),
            Self::Heuristic(HeuristicOutcome::Mixed | HeuristicOutcome::Commit, msg) => {
                TransactionError::HeuristicMixed(msg)
            }
            Self::Heuristic(HeuristicOutcome::Hazard, msg) => TransactionError::HeuristicHazard(msg),
            Self::Heuristic(_, msg) => TransactionError::Rollback(msg),
            Self::System(msg) => TransactionError::System(msg),
            Self::RollbackOnly => {
                TransactionError::Rollback("transaction marked rollback-only".into())
            }
            Self::SubordinateOnePhase => TransactionError::Rollback(
                "subordinate transaction cannot prepare a one-phase resource".into(),
            ),
        }
    }
}

/// Result of committing a participant in one phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnePhaseResult {
    /// Committed.
    Committed,
    /// Rolled back.
    RolledBack(String),
    /// Completed heuristically.
    Heuristic(HeuristicOutcome, String),
    /// Outcome unknown (communication lost mid-commit).
    Unknown(String),
    /// Internal error.
    Failed(String),
}

/// Aggregate result of the prepare phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// Every participant voted read-only; nothing to complete.
    ReadOnly,
    /// At least one participant is prepared; the decision is commit.
    Commit,
    /// The last resource was committed in one phase in place of prepare.
    OnePhase(OnePhaseResult),
    /// Every two-phase participant is prepared; the one-phase last
    /// participant must now be committed.
    LastParticipant,
    /// The transaction must roll back.
    Rollback(RollbackReason),
}

#[derive(Default)]
struct CompletionTally {
    retry: bool,
    failed: Vec<String>,
    hazard: bool,
    system_error: bool,
}

/// Participants of one transaction and the state of the protocol over them.
pub struct RegisteredResources {
    id: TransactionId,
    resources: Vec<Box<dyn Participant>>,
    async_resources: Vec<AsyncParticipant>,
    last_participant: Option<usize>,
    keys: HashSet<String>,
    next_branch: u32,
    unit: Option<Arc<dyn RecoverableUnit>>,
    logged: bool,
    retry_required: bool,
    failed: Vec<String>,
    heuristic: HeuristicOutcome,
    system_error: bool,
    completion_passes: u32,
    ordering: AsyncPrepareOrdering,
    fail_fast: bool,
    prepare_retry_limit: u32,
}

impl RegisteredResources {
    /// Creates an empty registry for transaction `id`.
    #[must_use]
    pub fn new(id: TransactionId, config: &TransactionConfig) -> Self {
        Self {
            id,
            resources: Vec::new(),
            async_resources: Vec::new(),
            last_participant: None,
            keys: HashSet::new(),
            next_branch: 0,
            unit: None,
            logged: false,
            retry_required: false,
            failed: Vec::new(),
            heuristic: HeuristicOutcome::None,
            system_error: false,
            completion_passes: 0,
            ordering: config.async_prepare_ordering,
            fail_fast: config.prepare_fail_fast,
            prepare_retry_limit: config.prepare_retry_limit,
        }
    }

    // ── Enlistment ──

    /// Branch identifier for the next enlisted resource.
    pub fn branch_xid(&mut self) -> Xid {
        self.next_branch += 1;
        self.id.xid().branch(self.next_branch)
    }

    fn claim_key(&mut self, key: &str) -> Result<(), TransactionError> {
        if !self.keys.insert(key.to_owned()) {
            error!(tx = %self.id, key, "duplicate enlistment");
            return Err(TransactionError::DuplicateEnlistment(key.to_owned()));
        }
        Ok(())
    }

    /// Enlists a two-phase participant.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::DuplicateEnlistment` if the key is taken.
    pub fn add_resource(&mut self, mut participant: Box<dyn Participant>) -> Result<(), TransactionError> {
        self.claim_key(participant.key())?;
        participant.set_status(ResourceStatus::Registered);
        debug!(tx = %self.id, key = participant.key(), priority = participant.priority(), "resource enlisted");
        self.resources.push(participant);
        Ok(())
    }

    /// Enlists the one-phase (last) participant.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::IllegalState` if a one-phase participant
    /// is already enlisted, or `DuplicateEnlistment` if the key is taken.
    pub fn add_one_phase_resource(
        &mut self,
        mut participant: Box<dyn Participant>,
    ) -> Result<(), TransactionError> {
        if self.last_participant.is_some() {
            return Err(TransactionError::IllegalState(
                "only one one-phase resource may be enlisted".into(),
            ));
        }
        self.claim_key(participant.key())?;
        participant.set_status(ResourceStatus::Registered);
        debug!(tx = %self.id, key = participant.key(), "one-phase resource enlisted");
        self.last_participant = Some(self.resources.len());
        self.resources.push(participant);
        Ok(())
    }

    /// Enlists a remote participant.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::DuplicateEnlistment` if the key is taken.
    pub fn add_async_resource(&mut self, mut participant: AsyncParticipant) -> Result<(), TransactionError> {
        self.claim_key(participant.key())?;
        participant.set_status(ResourceStatus::Registered);
        debug!(tx = %self.id, key = participant.key(), "remote participant enlisted");
        self.async_resources.push(participant);
        Ok(())
    }

    // ── Queries ──

    /// No participant of any kind is enlisted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.async_resources.is_empty()
    }

    /// Number of participants of every kind.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len() + self.async_resources.len()
    }

    /// Whether remote participants are enlisted.
    #[must_use]
    pub fn has_async(&self) -> bool {
        !self.async_resources.is_empty()
    }

    /// Exactly one synchronous resource, able to commit in one phase, and
    /// no remote participants.
    #[must_use]
    pub fn is_only_agent(&self) -> bool {
        self.resources.len() == 1
            && self.async_resources.is_empty()
            && self.resources[0].supports_one_phase()
    }

    /// Key and status of every participant, synchronous ones first.
    #[must_use]
    pub fn statuses(&self) -> Vec<(String, ResourceStatus)> {
        self.resources
            .iter()
            .map(|p| (p.key().to_owned(), p.status()))
            .chain(
                self.async_resources
                    .iter()
                    .map(|p| (p.key().to_owned(), p.status())),
            )
            .collect()
    }

    fn all_statuses(&self) -> impl Iterator<Item = ResourceStatus> + '_ {
        self.resources
            .iter()
            .map(|p| p.status())
            .chain(self.async_resources.iter().map(|p| p.status()))
    }

    /// Whether a participant is left in a heuristic status.
    #[must_use]
    pub fn has_heuristics(&self) -> bool {
        self.all_statuses().any(ResourceStatus::is_heuristic)
    }

    /// The last completion pass left participants to retry.
    #[must_use]
    pub fn retry_required(&self) -> bool {
        self.retry_required
    }

    /// Keys of participants that could not be reached.
    #[must_use]
    pub fn failed_resources(&self) -> &[String] {
        &self.failed
    }

    /// Aggregate heuristic outcome so far.
    #[must_use]
    pub fn heuristic_outcome(&self) -> HeuristicOutcome {
        self.heuristic
    }

    /// Whether a participant reported an unexpected error.
    #[must_use]
    pub fn system_error(&self) -> bool {
        self.system_error
    }

    /// Whether prepared records have been written.
    #[must_use]
    pub fn is_logged(&self) -> bool {
        self.logged
    }

    // ── Prepare ──

    /// Prepares every participant and aggregates the votes.
    ///
    /// Remote prepares are dispatched according to the configured ordering
    /// and always joined before this returns, even when a synchronous
    /// participant has already voted to roll back.
    pub fn distribute_prepare(&mut self, subordinate: bool, rollback_only: &AtomicBool) -> PrepareOutcome {
        if subordinate && self.last_participant.is_some() {
            return PrepareOutcome::Rollback(RollbackReason::SubordinateOnePhase);
        }

        let mut ok_votes = 0usize;
        let mut rollback: Option<RollbackReason> = None;
        let has_async = self.has_async();

        if has_async && self.ordering != AsyncPrepareOrdering::AsyncAfterSync {
            rollback = self.send_async_prepares();
        }
        if has_async && self.ordering == AsyncPrepareOrdering::AsyncBeforeSync && rollback.is_none() {
            rollback = self.join_async_prepares(&mut ok_votes);
        }

        let mut one_phase = None;
        if rollback.is_none() {
            match self.prepare_sync(subordinate, rollback_only, &mut ok_votes) {
                Ok(result) => one_phase = result,
                Err(reason) => rollback = Some(reason),
            }
        }

        if has_async {
            if self.ordering == AsyncPrepareOrdering::AsyncAfterSync && rollback.is_none() {
                rollback = self.send_async_prepares();
            }
            let async_rollback = self.join_async_prepares(&mut ok_votes);
            rollback = rollback.or(async_rollback);
        }

        if rollback.is_none() && rollback_only.load(Ordering::SeqCst) {
            rollback = Some(RollbackReason::RollbackOnly);
        }
        if let Some(reason) = rollback {
            info!(tx = %self.id, ?reason, "prepare failed; rolling back");
            return PrepareOutcome::Rollback(reason);
        }
        if let Some(result) = one_phase {
            return PrepareOutcome::OnePhase(result);
        }
        if self.last_participant.is_some() {
            return PrepareOutcome::LastParticipant;
        }
        if ok_votes == 0 {
            debug!(tx = %self.id, "all participants voted read-only");
            PrepareOutcome::ReadOnly
        } else {
            debug!(tx = %self.id, ok_votes, "prepare complete");
            PrepareOutcome::Commit
        }
    }

    fn prepare_sync(
        &mut self,
        subordinate: bool,
        rollback_only: &AtomicBool,
        ok_votes: &mut usize,
    ) -> Result<Option<OnePhaseResult>, RollbackReason> {
        let count = self.resources.len();
        let optimise = !subordinate && self.async_resources.is_empty() && self.last_participant.is_none();
        for i in 0..count {
            if Some(i) == self.last_participant {
                continue;
            }
            if optimise && i + 1 == count && *ok_votes == 0 && self.resources[i].supports_one_phase() {
                debug!(tx = %self.id, key = self.resources[i].key(), "committing last resource in one phase");
                return Ok(Some(one_phase_commit(self.resources[i].as_mut())));
            }
            match self.prepare_one(i)? {
                Vote::Ok => {
                    self.resources[i].set_status(ResourceStatus::Prepared);
                    *ok_votes += 1;
                }
                Vote::ReadOnly => self.resources[i].set_status(ResourceStatus::Completed),
            }
            if rollback_only.load(Ordering::SeqCst) {
                return Err(RollbackReason::RollbackOnly);
            }
        }
        Ok(None)
    }

    fn prepare_one(&mut self, index: usize) -> Result<Vote, RollbackReason> {
        let mut attempts = 0u32;
        loop {
            let participant = self.resources[index].as_mut();
            match participant.prepare() {
                Ok(vote) => return Ok(vote),
                Err(e)
                    if e.code == XaErrorCode::RmFailed
                        && !self.fail_fast
                        && attempts < self.prepare_retry_limit =>
                {
                    attempts += 1;
                    warn!(tx = %self.id, key = participant.key(), attempts, error = %e, "prepare failed; retrying");
                }
                Err(e) => return Err(classify_prepare_error(&self.id, participant, e)),
            }
        }
    }

    fn send_async_prepares(&mut self) -> Option<RollbackReason> {
        let mut reason = None;
        for participant in &mut self.async_resources {
            if let Err(e) = participant.send_async_prepare() {
                reason.get_or_insert(RollbackReason::System(e.to_string()));
            }
        }
        reason
    }

    fn join_async_prepares(&mut self, ok_votes: &mut usize) -> Option<RollbackReason> {
        let mut reason = None;
        for participant in &mut self.async_resources {
            if !participant.prepare_outstanding() {
                continue;
            }
            match participant.prepare() {
                Ok(Vote::Ok) => {
                    participant.set_status(ResourceStatus::Prepared);
                    *ok_votes += 1;
                }
                Ok(Vote::ReadOnly) => participant.set_status(ResourceStatus::Completed),
                Err(e) => {
                    let r = classify_prepare_error(&self.id, participant, e);
                    reason.get_or_insert(r);
                }
            }
        }
        reason
    }

    // ── Logging ──

    /// Attaches the log unit that prepared records are written to.
    pub fn attach_log(&mut self, unit: Arc<dyn RecoverableUnit>) {
        self.unit = Some(unit);
    }

    /// Writes one recovery record per prepared participant and forces the
    /// unit. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::System` if no unit is attached, or the
    /// log error if a write fails.
    pub fn log_resources(&mut self) -> Result<(), TransactionError> {
        if self.logged {
            debug!(tx = %self.id, "resources already logged");
            return Ok(());
        }
        let Some(unit) = self.unit.clone() else {
            return Err(TransactionError::System("no recovery log unit attached".into()));
        };

        let xa_section = Section::new(Arc::clone(&unit), XA_RESOURCE_SECTION);
        let async_section = Section::new(Arc::clone(&unit), ASYNC_RESOURCE_SECTION);
        let mut written = 0usize;
        for participant in &self.resources {
            if participant.status() != ResourceStatus::Prepared {
                continue;
            }
            if let Some(record) = participant.recovery_record() {
                xa_section.add_data(&record.to_bytes())?;
                written += 1;
            }
        }
        for participant in &self.async_resources {
            if participant.status() != ResourceStatus::Prepared {
                continue;
            }
            if let Some(record) = participant.recovery_record() {
                async_section.add_data(&record.to_bytes())?;
                written += 1;
            }
        }
        unit.force()?;
        self.logged = true;
        debug!(tx = %self.id, unit = unit.id(), written, "prepared resources logged");
        Ok(())
    }

    fn persist_heuristic(&self) {
        let Some(unit) = self.unit.as_ref().filter(|_| self.logged) else {
            return;
        };
        let result = unit
            .replace_data(HEURISTIC_OUTCOME_SECTION, &[self.heuristic.to_byte()])
            .and_then(|()| unit.force());
        if let Err(e) = result {
            warn!(tx = %self.id, error = %e, "failed to log heuristic outcome");
        }
    }

    /// Folds `outcome` into the aggregate and logs it.
    pub fn record_heuristic(&mut self, outcome: HeuristicOutcome) {
        self.heuristic = self.heuristic.combine(outcome);
        if self.heuristic != HeuristicOutcome::None {
            self.persist_heuristic();
        }
    }

    // ── Completion ──

    /// Commits the sole participant in one phase.
    pub fn commit_only_agent(&mut self) -> OnePhaseResult {
        match self.resources.first_mut() {
            Some(participant) => one_phase_commit(participant.as_mut()),
            None => OnePhaseResult::Failed("no resource enlisted".into()),
        }
    }

    /// Commits the one-phase last participant.
    pub fn commit_last_agent(&mut self) -> OnePhaseResult {
        match self.last_participant {
            Some(index) => {
                info!(tx = %self.id, key = self.resources[index].key(), "committing last participant");
                one_phase_commit(self.resources[index].as_mut())
            }
            None => OnePhaseResult::Failed("no last participant enlisted".into()),
        }
    }

    /// Delivers the outcome to every participant that still needs it.
    ///
    /// Remote participants are sent the outcome first so their round-trips
    /// overlap the synchronous ones; synchronous participants complete in
    /// ascending priority order. Afterwards the heuristic outcome and the
    /// retry flag reflect the pass.
    pub fn distribute_outcome(&mut self, commit: bool) {
        let is_retry = self.completion_passes > 0;
        let mut tally = CompletionTally::default();

        let mut dispatched = vec![false; self.async_resources.len()];
        for (i, participant) in self.async_resources.iter_mut().enumerate() {
            if !needs_outcome(participant.status(), commit) {
                continue;
            }
            let sent = if commit {
                participant.send_async_commit()
            } else {
                participant.send_async_rollback()
            };
            if let Err(e) = sent {
                debug!(tx = %self.id, key = participant.key(), error = %e, "outcome already outstanding");
            }
            dispatched[i] = true;
        }

        let mut order: Vec<usize> = (0..self.resources.len()).collect();
        order.sort_by_key(|&i| self.resources[i].priority());
        for i in order {
            deliver_outcome(&self.id, self.resources[i].as_mut(), commit, is_retry, &mut tally);
        }

        for (participant, sent) in self.async_resources.iter_mut().zip(dispatched) {
            if sent {
                deliver_outcome(&self.id, participant, commit, is_retry, &mut tally);
            }
        }

        self.completion_passes += 1;
        self.retry_required = tally.retry;
        self.failed = tally.failed;
        self.system_error |= tally.system_error;

        let mut outcome = HeuristicOutcome::from_statuses(self.all_statuses());
        if tally.hazard {
            outcome = outcome.combine(HeuristicOutcome::Hazard);
        }
        self.record_heuristic(outcome);

        if self.retry_required {
            warn!(tx = %self.id, failed = ?self.failed, "completion incomplete");
        }
    }

    /// Commits every participant.
    ///
    /// # Errors
    ///
    /// Returns the heuristic error matching the aggregate outcome; a
    /// heuristic commit is success.
    pub fn distribute_commit(&mut self) -> Result<(), TransactionError> {
        self.distribute_outcome(true);
        match self.heuristic {
            HeuristicOutcome::None | HeuristicOutcome::Commit => Ok(()),
            HeuristicOutcome::Rollback => Err(TransactionError::HeuristicRollback(format!(
                "{}: participants rolled back during commit",
                self.id
            ))),
            HeuristicOutcome::Hazard => Err(TransactionError::HeuristicHazard(format!(
                "{}: outcome of some participants is unknown",
                self.id
            ))),
            HeuristicOutcome::Mixed => Err(TransactionError::HeuristicMixed(format!(
                "{}: some participants committed, some rolled back",
                self.id
            ))),
        }
    }

    /// Rolls back every participant.
    ///
    /// # Errors
    ///
    /// Returns the heuristic error matching the aggregate outcome; a
    /// heuristic rollback is success.
    pub fn distribute_rollback(&mut self) -> Result<(), TransactionError> {
        self.distribute_outcome(false);
        match self.heuristic {
            HeuristicOutcome::None | HeuristicOutcome::Rollback => Ok(()),
            HeuristicOutcome::Commit => Err(TransactionError::HeuristicCommit(format!(
                "{}: participants committed during rollback",
                self.id
            ))),
            HeuristicOutcome::Hazard => Err(TransactionError::HeuristicHazard(format!(
                "{}: outcome of some participants is unknown",
                self.id
            ))),
            HeuristicOutcome::Mixed => Err(TransactionError::HeuristicMixed(format!(
                "{}: some participants committed, some rolled back",
                self.id
            ))),
        }
    }

    /// Tells every heuristically completed participant to forget. Returns
    /// true if some of them must be retried.
    pub fn distribute_forget(&mut self) -> bool {
        let mut retry = false;
        for participant in &mut self.resources {
            retry |= forget_one(&self.id, participant.as_mut());
        }
        for participant in &mut self.async_resources {
            retry |= forget_one(&self.id, participant);
        }
        self.retry_required |= retry;
        retry
    }

    /// Dissociates every synchronous resource ahead of a timeout rollback.
    pub fn abort_all(&mut self) {
        for participant in &mut self.resources {
            participant.abort();
        }
    }

    /// Releases every participant and forgets pending retries.
    pub fn destroy_resources(&mut self) {
        for participant in &mut self.resources {
            participant.destroy();
        }
        for participant in &mut self.async_resources {
            participant.destroy();
        }
        self.failed.clear();
        self.retry_required = false;
    }

    // ── Recovery ──

    /// Rebuilds the participants recorded in `unit`, each in `Prepared`
    /// status. Returns whether remote participants were recovered.
    ///
    /// # Errors
    ///
    /// Fails on the first record that cannot be decoded or whose factory
    /// cannot produce a live handle.
    pub fn reconstruct(
        &mut self,
        unit: Arc<dyn RecoverableUnit>,
        services: &ServiceRegistry,
        pool: &Arc<WorkerPool>,
    ) -> Result<bool, TransactionError> {
        if let Some(bytes) = unit.last_data(HEURISTIC_OUTCOME_SECTION) {
            let byte = *bytes.first().ok_or(RecordError::Truncated(0))?;
            self.heuristic = HeuristicOutcome::from_byte(byte)?;
        }

        for bytes in Section::new(Arc::clone(&unit), XA_RESOURCE_SECTION).data() {
            let record = RecoveryRecord::from_bytes(&bytes)?;
            let factory = services.xa_factory(&record.filter)?;
            let resource = factory
                .recover(&record.recovery_key)
                .map_err(|e| recovery_failure(&record, &e))?;
            self.claim_key(&record.name)?;
            self.resources
                .push(Box::new(XaParticipant::recovered(resource, record)));
        }

        let async_records = Section::new(Arc::clone(&unit), ASYNC_RESOURCE_SECTION).data();
        for bytes in &async_records {
            let record = RecoveryRecord::from_bytes(bytes)?;
            let factory = services.remote_factory(&record.filter)?;
            let remote = factory
                .recover(&record.recovery_key)
                .map_err(|e| recovery_failure(&record, &e))?;
            self.claim_key(&record.name)?;
            self.async_resources
                .push(AsyncParticipant::recovered(remote, Arc::clone(pool), record));
        }

        self.unit = Some(unit);
        self.logged = true;
        // Outcomes already delivered before the restart are not hazards.
        self.completion_passes = 1;
        info!(tx = %self.id, resources = self.len(), "participants reconstructed");
        Ok(!async_records.is_empty())
    }
}

fn recovery_failure(record: &RecoveryRecord, err: &ResourceError) -> TransactionError {
    TransactionError::System(format!(
        "cannot recover resource '{}' via '{}': {err}",
        record.name, record.filter
    ))
}

fn classify_prepare_error(
    id: &TransactionId,
    participant: &mut dyn Participant,
    err: ResourceError,
) -> RollbackReason {
    let key = participant.key().to_owned();
    match err.code {
        XaErrorCode::Rollback | XaErrorCode::NotFound => {
            info!(tx = %id, key, error = %err, "participant voted to roll back");
            participant.set_status(ResourceStatus::RolledBack);
            RollbackReason::Vote(format!("{key}: {err}"))
        }
        XaErrorCode::HeuristicMixed
        | XaErrorCode::HeuristicHazard
        | XaErrorCode::HeuristicCommit
        | XaErrorCode::HeuristicRollback => {
            let (status, outcome) = heuristic_status(err.code);
            error!(tx = %id, key, error = %err, "heuristic outcome during prepare");
            participant.set_status(status);
            RollbackReason::Heuristic(outcome, format!("{key}: {err}"))
        }
        XaErrorCode::RmFailed => {
            warn!(tx = %id, key, error = %err, "participant unreachable during prepare");
            participant.set_status(ResourceStatus::Prepared);
            RollbackReason::CommunicationFailure(format!("{key}: {err}"))
        }
        XaErrorCode::RmError => {
            error!(tx = %id, key, error = %err, "resource manager error during prepare");
            participant.set_status(ResourceStatus::Prepared);
            RollbackReason::System(format!("{key}: {err}"))
        }
        XaErrorCode::ProtocolError | XaErrorCode::Other | XaErrorCode::Retry => {
            error!(tx = %id, key, error = %err, "unexpected error during prepare");
            RollbackReason::System(format!("{key}: {err}"))
        }
    }
}

fn heuristic_status(code: XaErrorCode) -> (ResourceStatus, HeuristicOutcome) {
    match code {
        XaErrorCode::HeuristicCommit => (ResourceStatus::HeuristicCommit, HeuristicOutcome::Commit),
        XaErrorCode::HeuristicRollback => {
            (ResourceStatus::HeuristicRollback, HeuristicOutcome::Rollback)
        }
        XaErrorCode::HeuristicMixed => (ResourceStatus::HeuristicMixed, HeuristicOutcome::Mixed),
        _ => (ResourceStatus::HeuristicHazard, HeuristicOutcome::Hazard),
    }
}

fn one_phase_commit(participant: &mut dyn Participant) -> OnePhaseResult {
    participant.set_status(ResourceStatus::CompletingOnePhase);
    let key = participant.key().to_owned();
    match participant.commit_one_phase() {
        Ok(()) => {
            participant.set_status(ResourceStatus::Committed);
            OnePhaseResult::Committed
        }
        Err(e) => match e.code {
            XaErrorCode::Rollback | XaErrorCode::RmError | XaErrorCode::NotFound => {
                participant.set_status(ResourceStatus::RolledBack);
                OnePhaseResult::RolledBack(format!("{key}: {e}"))
            }
            code if code.is_heuristic() => {
                let (status, outcome) = heuristic_status(code);
                participant.set_status(status);
                OnePhaseResult::Heuristic(outcome, format!("{key}: {e}"))
            }
            XaErrorCode::RmFailed | XaErrorCode::Retry => {
                error!(key, error = %e, "one-phase commit outcome unknown");
                participant.set_status(ResourceStatus::Completed);
                OnePhaseResult::Unknown(format!("{key}: {e}"))
            }
            _ => {
                error!(key, error = %e, "unexpected error from one-phase commit");
                participant.set_status(ResourceStatus::Completed);
                OnePhaseResult::Failed(format!("{key}: {e}"))
            }
        },
    }
}

/// Returns true if the forget must be retried.
fn forget_one(id: &TransactionId, participant: &mut dyn Participant) -> bool {
    if !participant.status().is_heuristic() {
        return false;
    }
    match participant.forget() {
        Ok(()) => {
            participant.set_status(ResourceStatus::Completed);
            false
        }
        Err(e) => match e.code {
            XaErrorCode::RmError | XaErrorCode::RmFailed => {
                warn!(tx = %id, key = participant.key(), error = %e, "forget failed; will retry");
                true
            }
            XaErrorCode::NotFound => {
                participant.set_status(ResourceStatus::Completed);
                false
            }
            _ => {
                error!(tx = %id, key = participant.key(), error = %e, "unexpected error from forget");
                participant.set_status(ResourceStatus::Completed);
                false
            }
        },
    }
}

fn needs_outcome(status: ResourceStatus, commit: bool) -> bool {
    match status {
        ResourceStatus::Prepared | ResourceStatus::Completing | ResourceStatus::CompletingOnePhase => {
            true
        }
        ResourceStatus::Registered => !commit,
        _ => false,
    }
}

fn deliver_outcome(
    id: &TransactionId,
    participant: &mut dyn Participant,
    commit: bool,
    is_retry: bool,
    tally: &mut CompletionTally,
) {
    let before = participant.status();
    if !needs_outcome(before, commit) {
        return;
    }
    let result = match before {
        ResourceStatus::CompletingOnePhase if commit => participant.commit_one_phase(),
        ResourceStatus::Registered => participant.rollback(),
        _ => {
            participant.set_status(ResourceStatus::Completing);
            if commit {
                participant.commit(false)
            } else {
                participant.rollback()
            }
        }
    };

    let Err(err) = result else {
        participant.set_status(if commit {
            ResourceStatus::Committed
        } else {
            ResourceStatus::RolledBack
        });
        return;
    };

    let key = participant.key().to_owned();
    let retry_status = if before == ResourceStatus::CompletingOnePhase {
        ResourceStatus::CompletingOnePhase
    } else {
        ResourceStatus::Prepared
    };
    match err.code {
        code if code.is_heuristic() => {
            let (status, _) = heuristic_status(code);
            error!(tx = %id, key, error = %err, "heuristic outcome reported");
            participant.set_status(status);
        }
        XaErrorCode::RmError if commit => {
            error!(
                tx = %id, key, error = %err,
                "resource rolled back a committed branch; manual diagnostics required"
            );
            participant.set_status(ResourceStatus::HeuristicRollback);
        }
        XaErrorCode::RmError => participant.set_status(ResourceStatus::RolledBack),
        XaErrorCode::RmFailed if !commit && before == ResourceStatus::Registered => {
            // Never prepared: the resource manager rolls back on its own.
            participant.set_status(ResourceStatus::RolledBack);
        }
        XaErrorCode::RmFailed | XaErrorCode::Retry => {
            warn!(tx = %id, key, error = %err, "participant unreachable; will retry");
            participant.set_status(retry_status);
            tally.failed.push(key);
            tally.retry = true;
        }
        XaErrorCode::NotFound => {
            if commit && !is_retry {
                warn!(tx = %id, key, "branch unknown to resource manager during commit");
                tally.hazard = true;
            }
            participant.set_status(ResourceStatus::Completed);
        }
        XaErrorCode::Rollback if commit => {
            error!(tx = %id, key, error = %err, "branch rolled back during commit");
            participant.set_status(ResourceStatus::HeuristicRollback);
        }
        XaErrorCode::Rollback => participant.set_status(ResourceStatus::RolledBack),
        _ => {
            error!(tx = %id, key, error = %err, "unexpected completion error; continuing");
            participant.set_status(ResourceStatus::Completed);
            tally.system_error = true;
        }
    }
}

//! Testing utilities for resource and coordinator implementations.
//!
//! Provides scriptable mock resources, remote participants, factories and
//! a superior coordinator. Every mock records the calls it receives in a
//! shared [`CallJournal`] so tests can assert ordering across resources.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Condvar, Mutex};

use crate::error::{ResourceError, TransactionError};
use crate::resource::{OnePhaseResource, Vote, XaResource};
use crate::services::{
    RecoveryCoordinator, RecoveryCoordinatorFactory, RemoteParticipantFactory, ReplayOutcome,
    XaResourceFactory,
};
use crate::state::Status;
use crate::sync::Synchronization;
use crate::wsat::RemoteParticipant;
use crate::xid::Xid;

/// Ordered record of calls made on mocks, shared between them.
#[derive(Debug, Clone, Default)]
pub struct CallJournal {
    calls: Arc<Mutex<Vec<(String, &'static str)>>>,
}

impl CallJournal {
    /// Creates an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a call.
    pub fn record(&self, name: &str, op: &'static str) {
        self.calls.lock().push((name.to_owned(), op));
    }

    /// Every call in order.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, &'static str)> {
        self.calls.lock().clone()
    }

    /// Operations called on `name`, in order.
    #[must_use]
    pub fn calls_for(&self, name: &str) -> Vec<&'static str> {
        self.calls
            .lock()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, op)| *op)
            .collect()
    }

    /// Names that received `op`, in call order.
    #[must_use]
    pub fn names_for(&self, op: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|(_, o)| *o == op)
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// How often `name` received `op`.
    #[must_use]
    pub fn count(&self, name: &str, op: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(n, o)| n == name && *o == op)
            .count()
    }

    /// Forgets every call.
    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

/// One-shot gate between test threads.
#[derive(Debug, Default)]
pub struct Latch {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    /// Creates a closed latch.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Opens the latch, releasing every waiter.
    pub fn open(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }

    /// Whether the latch is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }

    /// Blocks until the latch opens or `timeout` passes. Returns whether it
    /// opened.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut open = self.open.lock();
        while !*open {
            if self.cond.wait_until(&mut open, deadline).timed_out() {
                return *open;
            }
        }
        true
    }

    async fn wait_async(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_open() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        true
    }
}

const GATE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct Script {
    vote: Option<Vote>,
    prepare: VecDeque<ResourceError>,
    commit: VecDeque<ResourceError>,
    rollback: VecDeque<ResourceError>,
    forget: VecDeque<ResourceError>,
}

impl Script {
    fn vote(&mut self) -> Result<Vote, ResourceError> {
        match self.prepare.pop_front() {
            Some(err) => Err(err),
            None => Ok(self.vote.unwrap_or(Vote::Ok)),
        }
    }

    fn next(queue: &mut VecDeque<ResourceError>) -> Result<(), ResourceError> {
        queue.pop_front().map_or(Ok(()), Err)
    }
}

/// Scriptable XA resource.
///
/// Each `fail_*` call queues one error for the matching operation; once the
/// queue is drained the operation succeeds.
#[derive(Debug)]
pub struct MockXaResource {
    name: String,
    journal: CallJournal,
    script: Script,
    one_phase: bool,
    prepare_started: Option<Arc<Latch>>,
    prepare_gate: Option<Arc<Latch>>,
}

impl MockXaResource {
    /// Creates a resource that votes OK and completes normally.
    #[must_use]
    pub fn new(name: &str, journal: &CallJournal) -> Self {
        Self {
            name: name.to_owned(),
            journal: journal.clone(),
            script: Script::default(),
            one_phase: true,
            prepare_started: None,
            prepare_gate: None,
        }
    }

    /// Sets the prepare vote.
    #[must_use]
    pub fn vote(mut self, vote: Vote) -> Self {
        self.script.vote = Some(vote);
        self
    }

    /// Queues a prepare failure.
    #[must_use]
    pub fn fail_prepare(mut self, err: ResourceError) -> Self {
        self.script.prepare.push_back(err);
        self
    }

    /// Queues a commit failure.
    #[must_use]
    pub fn fail_commit(mut self, err: ResourceError) -> Self {
        self.script.commit.push_back(err);
        self
    }

    /// Queues a rollback failure.
    #[must_use]
    pub fn fail_rollback(mut self, err: ResourceError) -> Self {
        self.script.rollback.push_back(err);
        self
    }

    /// Queues a forget failure.
    #[must_use]
    pub fn fail_forget(mut self, err: ResourceError) -> Self {
        self.script.forget.push_back(err);
        self
    }

    /// Refuses one-phase commit.
    #[must_use]
    pub fn without_one_phase(mut self) -> Self {
        self.one_phase = false;
        self
    }

    /// Opens `latch` when prepare is entered.
    #[must_use]
    pub fn signal_prepare(mut self, latch: Arc<Latch>) -> Self {
        self.prepare_started = Some(latch);
        self
    }

    /// Holds prepare until `latch` opens.
    #[must_use]
    pub fn gate_prepare(mut self, latch: Arc<Latch>) -> Self {
        self.prepare_gate = Some(latch);
        self
    }
}

impl XaResource for MockXaResource {
    fn prepare(&mut self, _xid: &Xid) -> Result<Vote, ResourceError> {
        self.journal.record(&self.name, "prepare");
        if let Some(latch) = &self.prepare_started {
            latch.open();
        }
        if let Some(gate) = &self.prepare_gate {
            gate.wait(GATE_TIMEOUT);
        }
        self.script.vote()
    }

    fn commit(&mut self, _xid: &Xid, one_phase: bool) -> Result<(), ResourceError> {
        self.journal
            .record(&self.name, if one_phase { "commit_one_phase" } else { "commit" });
        Script::next(&mut self.script.commit)
    }

    fn rollback(&mut self, _xid: &Xid) -> Result<(), ResourceError> {
        self.journal.record(&self.name, "rollback");
        Script::next(&mut self.script.rollback)
    }

    fn forget(&mut self, _xid: &Xid) -> Result<(), ResourceError> {
        self.journal.record(&self.name, "forget");
        Script::next(&mut self.script.forget)
    }

    fn end_failed(&mut self, _xid: &Xid) -> Result<(), ResourceError> {
        self.journal.record(&self.name, "end_failed");
        Ok(())
    }

    fn supports_one_phase(&self) -> bool {
        self.one_phase
    }
}

/// Scriptable one-phase resource.
#[derive(Debug)]
pub struct MockOnePhaseResource {
    name: String,
    journal: CallJournal,
    script: Script,
}

impl MockOnePhaseResource {
    /// Creates a resource that commits normally.
    #[must_use]
    pub fn new(name: &str, journal: &CallJournal) -> Self {
        Self {
            name: name.to_owned(),
            journal: journal.clone(),
            script: Script::default(),
        }
    }

    /// Queues a commit failure.
    #[must_use]
    pub fn fail_commit(mut self, err: ResourceError) -> Self {
        self.script.commit.push_back(err);
        self
    }
}

impl OnePhaseResource for MockOnePhaseResource {
    fn commit(&mut self) -> Result<(), ResourceError> {
        self.journal.record(&self.name, "commit_one_phase");
        Script::next(&mut self.script.commit)
    }

    fn rollback(&mut self) -> Result<(), ResourceError> {
        self.journal.record(&self.name, "rollback");
        Script::next(&mut self.script.rollback)
    }
}

/// Rebuilds [`MockXaResource`]s named after their recovery key.
#[derive(Debug)]
pub struct MockXaFactory {
    journal: CallJournal,
    commit_failures: Mutex<HashMap<Vec<u8>, Vec<ResourceError>>>,
    unavailable: Mutex<Vec<Vec<u8>>>,
}

impl MockXaFactory {
    /// Creates a factory recording into `journal`.
    #[must_use]
    pub fn new(journal: &CallJournal) -> Self {
        Self {
            journal: journal.clone(),
            commit_failures: Mutex::new(HashMap::new()),
            unavailable: Mutex::new(Vec::new()),
        }
    }

    /// Resources recovered for `key` fail their next commit with `err`.
    pub fn fail_commit_for(&self, key: &[u8], err: ResourceError) {
        self.commit_failures
            .lock()
            .entry(key.to_vec())
            .or_default()
            .push(err);
    }

    /// `recover` fails for `key`.
    pub fn make_unavailable(&self, key: &[u8]) {
        self.unavailable.lock().push(key.to_vec());
    }
}

impl XaResourceFactory for MockXaFactory {
    fn recover(&self, recovery_key: &[u8]) -> Result<Box<dyn XaResource>, ResourceError> {
        let name = String::from_utf8_lossy(recovery_key).into_owned();
        self.journal.record(&name, "recover");
        if self.unavailable.lock().iter().any(|k| k == recovery_key) {
            return Err(ResourceError::rm_failed(format!("{name} unavailable")));
        }
        let mut resource = MockXaResource::new(&name, &self.journal);
        if let Some(errors) = self.commit_failures.lock().remove(recovery_key) {
            for err in errors {
                resource = resource.fail_commit(err);
            }
        }
        Ok(Box::new(resource))
    }
}

/// Scriptable remote participant.
#[derive(Debug)]
pub struct MockRemoteParticipant {
    name: String,
    journal: CallJournal,
    script: Mutex<Script>,
    prepare_started: Option<Arc<Latch>>,
    prepare_gate: Option<Arc<Latch>>,
}

impl MockRemoteParticipant {
    /// Creates a participant that votes OK and completes normally.
    #[must_use]
    pub fn new(name: &str, journal: &CallJournal) -> Self {
        Self {
            name: name.to_owned(),
            journal: journal.clone(),
            script: Mutex::new(Script::default()),
            prepare_started: None,
            prepare_gate: None,
        }
    }

    /// Sets the prepare vote.
    #[must_use]
    pub fn vote(self, vote: Vote) -> Self {
        self.script.lock().vote = Some(vote);
        self
    }

    /// Queues a prepare failure.
    #[must_use]
    pub fn fail_prepare(self, err: ResourceError) -> Self {
        self.script.lock().prepare.push_back(err);
        self
    }

    /// Queues a commit failure.
    #[must_use]
    pub fn fail_commit(self, err: ResourceError) -> Self {
        self.script.lock().commit.push_back(err);
        self
    }

    /// Opens `latch` when prepare is entered.
    #[must_use]
    pub fn signal_prepare(mut self, latch: Arc<Latch>) -> Self {
        self.prepare_started = Some(latch);
        self
    }

    /// Holds the prepare response until `latch` opens.
    #[must_use]
    pub fn gate_prepare(mut self, latch: Arc<Latch>) -> Self {
        self.prepare_gate = Some(latch);
        self
    }
}

#[async_trait]
impl RemoteParticipant for MockRemoteParticipant {
    async fn prepare(&self, _xid: &Xid) -> Result<Vote, ResourceError> {
        self.journal.record(&self.name, "prepare");
        if let Some(latch) = &self.prepare_started {
            latch.open();
        }
        if let Some(gate) = &self.prepare_gate {
            gate.wait_async(GATE_TIMEOUT).await;
        }
        self.script.lock().vote()
    }

    async fn commit(&self, _xid: &Xid) -> Result<(), ResourceError> {
        self.journal.record(&self.name, "commit");
        Script::next(&mut self.script.lock().commit)
    }

    async fn rollback(&self, _xid: &Xid) -> Result<(), ResourceError> {
        self.journal.record(&self.name, "rollback");
        Script::next(&mut self.script.lock().rollback)
    }

    async fn forget(&self, _xid: &Xid) -> Result<(), ResourceError> {
        self.journal.record(&self.name, "forget");
        Script::next(&mut self.script.lock().forget)
    }
}

/// Rebuilds [`MockRemoteParticipant`]s named after their recovery key.
#[derive(Debug)]
pub struct MockRemoteFactory {
    journal: CallJournal,
}

impl MockRemoteFactory {
    /// Creates a factory recording into `journal`.
    #[must_use]
    pub fn new(journal: &CallJournal) -> Self {
        Self {
            journal: journal.clone(),
        }
    }
}

impl RemoteParticipantFactory for MockRemoteFactory {
    fn recover(&self, recovery_key: &[u8]) -> Result<Arc<dyn RemoteParticipant>, ResourceError> {
        let name = String::from_utf8_lossy(recovery_key).into_owned();
        self.journal.record(&name, "recover");
        Ok(Arc::new(MockRemoteParticipant::new(&name, &self.journal)))
    }
}

/// Superior coordinator answering replay requests from a script.
#[derive(Debug)]
pub struct MockRecoveryCoordinator {
    journal: CallJournal,
    answers: Mutex<VecDeque<Result<ReplayOutcome, ResourceError>>>,
}

impl MockRecoveryCoordinator {
    /// Journal name used for replay calls.
    pub const NAME: &'static str = "superior";

    /// Creates a coordinator that answers `Unknown` until scripted.
    #[must_use]
    pub fn new(journal: &CallJournal) -> Arc<Self> {
        Arc::new(Self {
            journal: journal.clone(),
            answers: Mutex::new(VecDeque::new()),
        })
    }

    /// Queues an answer.
    pub fn answer(&self, outcome: ReplayOutcome) {
        self.answers.lock().push_back(Ok(outcome));
    }

    /// Queues a failed replay.
    pub fn fail(&self, err: ResourceError) {
        self.answers.lock().push_back(Err(err));
    }
}

impl RecoveryCoordinator for MockRecoveryCoordinator {
    fn replay_completion(&self, _xid: &Xid) -> Result<ReplayOutcome, ResourceError> {
        self.journal.record(Self::NAME, "replay_completion");
        self.answers
            .lock()
            .pop_front()
            .unwrap_or(Ok(ReplayOutcome::Unknown))
    }

    fn to_bytes(&self) -> Vec<u8> {
        Self::NAME.as_bytes().to_vec()
    }
}

/// Hands out one shared [`MockRecoveryCoordinator`].
#[derive(Debug)]
pub struct MockCoordinatorFactory {
    coordinator: Arc<MockRecoveryCoordinator>,
}

impl MockCoordinatorFactory {
    /// Creates a factory restoring `coordinator`.
    #[must_use]
    pub fn new(coordinator: &Arc<MockRecoveryCoordinator>) -> Self {
        Self {
            coordinator: Arc::clone(coordinator),
        }
    }
}

impl RecoveryCoordinatorFactory for MockCoordinatorFactory {
    fn restore(&self, data: &[u8]) -> Result<Arc<dyn RecoveryCoordinator>, ResourceError> {
        if data != MockRecoveryCoordinator::NAME.as_bytes() {
            return Err(ResourceError::protocol("unknown coordinator reference"));
        }
        Ok(Arc::clone(&self.coordinator) as Arc<dyn RecoveryCoordinator>)
    }
}

/// Synchronization recording its callbacks.
#[derive(Debug)]
pub struct RecordingSynchronization {
    name: String,
    journal: CallJournal,
    fail_before: bool,
    statuses: Mutex<Vec<Status>>,
}

impl RecordingSynchronization {
    /// Creates a synchronization recording into `journal`.
    #[must_use]
    pub fn new(name: &str, journal: &CallJournal) -> Self {
        Self {
            name: name.to_owned(),
            journal: journal.clone(),
            fail_before: false,
            statuses: Mutex::new(Vec::new()),
        }
    }

    /// Makes `before_completion` fail.
    #[must_use]
    pub fn failing(mut self) -> Self {
        self.fail_before = true;
        self
    }

    /// Statuses passed to `after_completion`.
    #[must_use]
    pub fn statuses(&self) -> Vec<Status> {
        self.statuses.lock().clone()
    }
}

impl Synchronization for RecordingSynchronization {
    fn before_completion(&self) -> Result<(), TransactionError> {
        self.journal.record(&self.name, "before_completion");
        if self.fail_before {
            return Err(TransactionError::System(format!("{} refused", self.name)));
        }
        Ok(())
    }

    fn after_completion(&self, status: Status) {
        self.journal.record(&self.name, "after_completion");
        self.statuses.lock().push(status);
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

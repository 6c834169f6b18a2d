//! Remote (WS-AT style) participants.
//!
//! A [`RemoteParticipant`] is reached over the network through an async
//! interface. [`AsyncParticipant`] adapts it to the synchronous
//! [`Participant`] contract: `send_async_*` dispatches the call onto the
//! shared [`WorkerPool`], and the matching synchronous method joins the
//! result. The registry sends to every remote participant before joining
//! any of them, which is what lets many round-trips overlap.

pub mod pool;

pub use pool::{PendingOp, WorkerPool};

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{ResourceError, XaErrorCode};
use crate::resource::{
    Participant, ParticipantStatus, RecoveryRecord, ResourceDescriptor, ResourceStatus, Vote,
};
use crate::xid::Xid;

/// Participant reached over a remote protocol.
#[async_trait]
pub trait RemoteParticipant: Send + Sync {
    /// Asks the participant to prepare.
    async fn prepare(&self, xid: &Xid) -> Result<Vote, ResourceError>;
    /// Tells the participant to commit.
    async fn commit(&self, xid: &Xid) -> Result<(), ResourceError>;
    /// Tells the participant to roll back.
    async fn rollback(&self, xid: &Xid) -> Result<(), ResourceError>;
    /// Tells the participant to forget a heuristic outcome.
    async fn forget(&self, xid: &Xid) -> Result<(), ResourceError>;
}

/// [`Participant`] over a [`RemoteParticipant`].
pub struct AsyncParticipant {
    remote: Arc<dyn RemoteParticipant>,
    pool: Arc<WorkerPool>,
    descriptor: ResourceDescriptor,
    xid: Xid,
    status: ResourceStatus,
    vote_status: ParticipantStatus,
    pending_prepare: Option<PendingOp<Vote>>,
    pending_commit: Option<PendingOp<()>>,
    pending_rollback: Option<PendingOp<()>>,
    pending_forget: Option<PendingOp<()>>,
}

impl AsyncParticipant {
    /// Wraps a freshly enlisted remote participant.
    #[must_use]
    pub fn new(
        remote: Arc<dyn RemoteParticipant>,
        pool: Arc<WorkerPool>,
        descriptor: ResourceDescriptor,
        xid: Xid,
    ) -> Self {
        Self {
            remote,
            pool,
            descriptor,
            xid,
            status: ResourceStatus::Registered,
            vote_status: ParticipantStatus::Active,
            pending_prepare: None,
            pending_commit: None,
            pending_rollback: None,
            pending_forget: None,
        }
    }

    /// Wraps a participant rebuilt from its recovery record; it starts out
    /// prepared.
    #[must_use]
    pub fn recovered(
        remote: Arc<dyn RemoteParticipant>,
        pool: Arc<WorkerPool>,
        record: RecoveryRecord,
    ) -> Self {
        let mut participant = Self::new(
            remote,
            pool,
            ResourceDescriptor {
                name: record.name,
                filter: record.filter,
                recovery_key: record.recovery_key,
                priority: record.priority,
            },
            record.xid,
        );
        participant.status = ResourceStatus::Prepared;
        participant.vote_status = ParticipantStatus::Prepared;
        participant
    }

    /// Status as advanced by the participant's own responses.
    #[must_use]
    pub fn vote_status(&self) -> ParticipantStatus {
        self.vote_status
    }

    /// Applies a response, ignoring it if the transition table rejects it.
    fn advance(&mut self, next: ParticipantStatus) -> bool {
        if self.vote_status.can_transition_to(next) {
            self.vote_status = next;
            true
        } else {
            debug!(
                key = %self.descriptor.name,
                from = ?self.vote_status,
                to = ?next,
                "ignoring stale participant response"
            );
            false
        }
    }

    fn advance_on_error(&mut self, err: &ResourceError) {
        let next = match err.code {
            XaErrorCode::Rollback | XaErrorCode::NotFound => ParticipantStatus::Aborted,
            XaErrorCode::HeuristicCommit => ParticipantStatus::HeurCommit,
            XaErrorCode::HeuristicRollback => ParticipantStatus::HeurRollback,
            XaErrorCode::HeuristicMixed => ParticipantStatus::HeurMixed,
            XaErrorCode::HeuristicHazard => ParticipantStatus::HeurHazard,
            _ => return,
        };
        self.advance(next);
    }

    fn outstanding(name: &str, op: &str) -> ResourceError {
        ResourceError::protocol(format!("{op} already outstanding for participant '{name}'"))
    }

    /// Dispatches prepare without waiting.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if a prepare is already outstanding.
    pub fn send_async_prepare(&mut self) -> Result<(), ResourceError> {
        if self.pending_prepare.is_some() {
            return Err(Self::outstanding(&self.descriptor.name, "prepare"));
        }
        let remote = Arc::clone(&self.remote);
        let xid = self.xid.clone();
        self.pending_prepare = Some(self.pool.submit(async move { remote.prepare(&xid).await }));
        Ok(())
    }

    /// Dispatches commit without waiting.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if a commit is already outstanding.
    pub fn send_async_commit(&mut self) -> Result<(), ResourceError> {
        if self.pending_commit.is_some() {
            return Err(Self::outstanding(&self.descriptor.name, "commit"));
        }
        let remote = Arc::clone(&self.remote);
        let xid = self.xid.clone();
        self.pending_commit = Some(self.pool.submit(async move { remote.commit(&xid).await }));
        Ok(())
    }

    /// Dispatches rollback without waiting.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if a rollback is already outstanding.
    pub fn send_async_rollback(&mut self) -> Result<(), ResourceError> {
        if self.pending_rollback.is_some() {
            return Err(Self::outstanding(&self.descriptor.name, "rollback"));
        }
        let remote = Arc::clone(&self.remote);
        let xid = self.xid.clone();
        self.pending_rollback = Some(self.pool.submit(async move { remote.rollback(&xid).await }));
        Ok(())
    }

    /// Dispatches forget without waiting.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if a forget is already outstanding.
    pub fn send_async_forget(&mut self) -> Result<(), ResourceError> {
        if self.pending_forget.is_some() {
            return Err(Self::outstanding(&self.descriptor.name, "forget"));
        }
        let remote = Arc::clone(&self.remote);
        let xid = self.xid.clone();
        self.pending_forget = Some(self.pool.submit(async move { remote.forget(&xid).await }));
        Ok(())
    }

    /// Whether a prepare has been sent and not yet joined.
    #[must_use]
    pub fn prepare_outstanding(&self) -> bool {
        self.pending_prepare.is_some()
    }
}

impl Participant for AsyncParticipant {
    fn key(&self) -> &str {
        &self.descriptor.name
    }

    fn priority(&self) -> i32 {
        self.descriptor.priority
    }

    fn status(&self) -> ResourceStatus {
        self.status
    }

    fn set_status(&mut self, status: ResourceStatus) {
        self.status = status;
    }

    fn prepare(&mut self) -> Result<Vote, ResourceError> {
        if self.pending_prepare.is_none() {
            self.send_async_prepare()?;
        }
        let Some(op) = self.pending_prepare.take() else {
            return Err(ResourceError::protocol("prepare was not dispatched"));
        };
        match op.wait() {
            Ok(vote) => {
                self.advance(match vote {
                    Vote::Ok => ParticipantStatus::Prepared,
                    Vote::ReadOnly => ParticipantStatus::ReadOnly,
                });
                Ok(vote)
            }
            Err(e) => {
                self.advance_on_error(&e);
                Err(e)
            }
        }
    }

    fn commit(&mut self, _one_phase: bool) -> Result<(), ResourceError> {
        if self.pending_commit.is_none() {
            self.send_async_commit()?;
        }
        let Some(op) = self.pending_commit.take() else {
            return Err(ResourceError::protocol("commit was not dispatched"));
        };
        let result = op.wait();
        match &result {
            Ok(()) => {
                self.advance(ParticipantStatus::Committed);
            }
            Err(e) => self.advance_on_error(e),
        }
        result
    }

    fn rollback(&mut self) -> Result<(), ResourceError> {
        if self.pending_rollback.is_none() {
            self.send_async_rollback()?;
        }
        let Some(op) = self.pending_rollback.take() else {
            return Err(ResourceError::protocol("rollback was not dispatched"));
        };
        let result = op.wait();
        match &result {
            Ok(()) => {
                self.advance(ParticipantStatus::Aborted);
            }
            Err(e) => self.advance_on_error(e),
        }
        result
    }

    fn forget(&mut self) -> Result<(), ResourceError> {
        if self.pending_forget.is_none() {
            self.send_async_forget()?;
        }
        let Some(op) = self.pending_forget.take() else {
            return Err(ResourceError::protocol("forget was not dispatched"));
        };
        op.wait()
    }

    fn supports_one_phase(&self) -> bool {
        false
    }

    fn recovery_record(&self) -> Option<RecoveryRecord> {
        Some(RecoveryRecord {
            priority: self.descriptor.priority,
            name: self.descriptor.name.clone(),
            filter: self.descriptor.filter.clone(),
            recovery_key: self.descriptor.recovery_key.clone(),
            xid: self.xid.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CallJournal, MockRemoteParticipant};
    use std::time::Duration;

    fn pool() -> Arc<WorkerPool> {
        Arc::new(WorkerPool::new(2, 8, Duration::from_secs(5)).unwrap())
    }

    fn participant(remote: MockRemoteParticipant, pool: &Arc<WorkerPool>) -> AsyncParticipant {
        AsyncParticipant::new(
            Arc::new(remote),
            Arc::clone(pool),
            ResourceDescriptor::new("remote", "mock-remote"),
            Xid::new(1, vec![1], vec![2]),
        )
    }

    #[test]
    fn test_prepare_vote_advances_status() {
        let journal = CallJournal::new();
        let pool = pool();
        let mut p = participant(MockRemoteParticipant::new("remote", &journal), &pool);
        p.send_async_prepare().unwrap();
        assert!(p.prepare_outstanding());
        assert_eq!(p.prepare().unwrap(), Vote::Ok);
        assert_eq!(p.vote_status(), ParticipantStatus::Prepared);
        p.commit(false).unwrap();
        assert_eq!(p.vote_status(), ParticipantStatus::Committed);
        assert_eq!(journal.calls_for("remote"), vec!["prepare", "commit"]);
    }

    #[test]
    fn test_second_send_is_refused() {
        let journal = CallJournal::new();
        let pool = pool();
        let mut p = participant(MockRemoteParticipant::new("remote", &journal), &pool);
        p.send_async_prepare().unwrap();
        let err = p.send_async_prepare().unwrap_err();
        assert_eq!(err.code, XaErrorCode::ProtocolError);
        p.prepare().unwrap();
    }

    #[test]
    fn test_communication_failure_maps_to_rm_failed() {
        let journal = CallJournal::new();
        let pool = pool();
        let remote = MockRemoteParticipant::new("remote", &journal)
            .fail_prepare(ResourceError::rm_failed("connection refused"));
        let mut p = participant(remote, &pool);
        let err = p.prepare().unwrap_err();
        assert_eq!(err.code, XaErrorCode::RmFailed);
        assert_eq!(p.vote_status(), ParticipantStatus::Active);
    }

    #[test]
    fn test_read_only_vote_leaves_vote_status_active() {
        let journal = CallJournal::new();
        let pool = pool();
        let remote = MockRemoteParticipant::new("remote", &journal).vote(Vote::ReadOnly);
        let mut p = participant(remote, &pool);
        assert_eq!(p.prepare().unwrap(), Vote::ReadOnly);
        assert_eq!(p.vote_status(), ParticipantStatus::Active);
    }

    #[test]
    fn test_stale_response_does_not_regress() {
        let journal = CallJournal::new();
        let pool = pool();
        let mut p = participant(MockRemoteParticipant::new("remote", &journal), &pool);
        p.rollback().unwrap();
        assert_eq!(p.vote_status(), ParticipantStatus::Aborted);
        // A late prepare vote must not move an aborted participant.
        assert_eq!(p.prepare().unwrap(), Vote::Ok);
        assert_eq!(p.vote_status(), ParticipantStatus::Aborted);
    }

    #[test]
    fn test_recovered_participant_is_prepared() {
        let journal = CallJournal::new();
        let record = RecoveryRecord {
            priority: 0,
            name: "remote".into(),
            filter: "mock-remote".into(),
            recovery_key: b"remote".to_vec(),
            xid: Xid::new(1, vec![1], vec![2]),
        };
        let p = AsyncParticipant::recovered(
            Arc::new(MockRemoteParticipant::new("remote", &journal)),
            pool(),
            record,
        );
        assert_eq!(p.status(), ResourceStatus::Prepared);
        assert_eq!(p.vote_status(), ParticipantStatus::Prepared);
    }
}

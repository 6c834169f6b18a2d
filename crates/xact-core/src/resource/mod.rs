//! Uniform participant interface over heterogeneous resources.
//!
//! The registry only ever talks to [`Participant`]. Concrete wrappers adapt
//! XA resources ([`XaParticipant`]), one-phase resources
//! ([`OnePhaseParticipant`]) and remote participants
//! ([`crate::wsat::AsyncParticipant`]).

pub mod record;
pub mod status;
pub mod xa;

pub use record::{CoordinatorRecord, RecordError, RecoveryRecord};
pub use status::{HeuristicOutcome, ParticipantStatus, ResourceStatus};
pub use xa::{OnePhaseParticipant, OnePhaseResource, XaParticipant, XaResource};

use crate::error::ResourceError;

/// Prepare vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// Prepared; the resource must be told the outcome.
    Ok,
    /// Nothing was changed; the resource needs no second phase.
    ReadOnly,
}

/// How a resource identifies itself for enlistment and recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    /// Key, unique within one transaction.
    pub name: String,
    /// Factory filter used to find a factory during recovery.
    pub filter: String,
    /// Opaque key handed to the factory during recovery.
    pub recovery_key: Vec<u8>,
    /// Commit priority; lower values complete first.
    pub priority: i32,
}

impl ResourceDescriptor {
    /// Creates a descriptor with priority 0 and an empty recovery key.
    pub fn new(name: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter: filter.into(),
            recovery_key: Vec::new(),
            priority: 0,
        }
    }

    /// Sets the commit priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the recovery key.
    #[must_use]
    pub fn with_recovery_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.recovery_key = key.into();
        self
    }
}

/// A resource enlisted in a transaction.
///
/// Protocol methods are called by the registry on the thread driving
/// completion; the registry owns the participant and updates its status.
pub trait Participant: Send {
    /// Key used for duplicate detection and log reconciliation.
    fn key(&self) -> &str;

    /// Commit priority; lower values complete first.
    fn priority(&self) -> i32;

    /// Current status.
    fn status(&self) -> ResourceStatus;

    /// Overrides the status.
    fn set_status(&mut self, status: ResourceStatus);

    /// Asks the resource to prepare.
    ///
    /// # Errors
    ///
    /// Returns the resource manager's error.
    fn prepare(&mut self) -> Result<Vote, ResourceError>;

    /// Commits, optionally in a single phase.
    ///
    /// # Errors
    ///
    /// Returns the resource manager's error.
    fn commit(&mut self, one_phase: bool) -> Result<(), ResourceError>;

    /// Commits without a prior prepare.
    ///
    /// # Errors
    ///
    /// Returns the resource manager's error.
    fn commit_one_phase(&mut self) -> Result<(), ResourceError> {
        self.commit(true)
    }

    /// Rolls back.
    ///
    /// # Errors
    ///
    /// Returns the resource manager's error.
    fn rollback(&mut self) -> Result<(), ResourceError>;

    /// Discards heuristic knowledge of the branch.
    ///
    /// # Errors
    ///
    /// Returns the resource manager's error.
    fn forget(&mut self) -> Result<(), ResourceError>;

    /// Dissociates the resource from work in progress before a timeout
    /// rollback.
    fn abort(&mut self) {}

    /// Releases any handles.
    fn destroy(&mut self) {}

    /// Whether `commit_one_phase` is supported.
    fn supports_one_phase(&self) -> bool;

    /// Record needed to rebuild the participant after a restart, or `None`
    /// if it cannot be recovered.
    fn recovery_record(&self) -> Option<RecoveryRecord>;
}

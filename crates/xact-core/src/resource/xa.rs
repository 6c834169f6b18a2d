//! Wrappers for synchronous resources.

use tracing::debug;

use crate::error::ResourceError;
use crate::resource::{Participant, RecoveryRecord, ResourceDescriptor, ResourceStatus, Vote};
use crate::xid::Xid;

/// Resource manager speaking the XA protocol for one branch.
pub trait XaResource: Send {
    /// Prepares the branch.
    ///
    /// # Errors
    ///
    /// Returns the resource manager's error.
    fn prepare(&mut self, xid: &Xid) -> Result<Vote, ResourceError>;

    /// Commits the branch.
    ///
    /// # Errors
    ///
    /// Returns the resource manager's error.
    fn commit(&mut self, xid: &Xid, one_phase: bool) -> Result<(), ResourceError>;

    /// Rolls back the branch.
    ///
    /// # Errors
    ///
    /// Returns the resource manager's error.
    fn rollback(&mut self, xid: &Xid) -> Result<(), ResourceError>;

    /// Forgets a heuristically completed branch.
    ///
    /// # Errors
    ///
    /// Returns the resource manager's error.
    fn forget(&mut self, xid: &Xid) -> Result<(), ResourceError>;

    /// Ends work on the branch with failure. Called before a timeout
    /// rollback.
    ///
    /// # Errors
    ///
    /// Returns the resource manager's error.
    fn end_failed(&mut self, _xid: &Xid) -> Result<(), ResourceError> {
        Ok(())
    }

    /// Whether the resource can commit without preparing.
    fn supports_one_phase(&self) -> bool {
        true
    }
}

/// [`Participant`] over an [`XaResource`] branch.
pub struct XaParticipant {
    resource: Box<dyn XaResource>,
    descriptor: ResourceDescriptor,
    xid: Xid,
    status: ResourceStatus,
}

impl XaParticipant {
    /// Wraps a freshly enlisted resource.
    #[must_use]
    pub fn new(resource: Box<dyn XaResource>, descriptor: ResourceDescriptor, xid: Xid) -> Self {
        Self {
            resource,
            descriptor,
            xid,
            status: ResourceStatus::Registered,
        }
    }

    /// Wraps a resource rebuilt from its recovery record; it starts out
    /// `Prepared`.
    #[must_use]
    pub fn recovered(resource: Box<dyn XaResource>, record: RecoveryRecord) -> Self {
        Self {
            resource,
            descriptor: ResourceDescriptor {
                name: record.name,
                filter: record.filter,
                recovery_key: record.recovery_key,
                priority: record.priority,
            },
            xid: record.xid,
            status: ResourceStatus::Prepared,
        }
    }

    /// Branch identifier.
    #[must_use]
    pub fn xid(&self) -> &Xid {
        &self.xid
    }
}

impl Participant for XaParticipant {
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
        self.resource.prepare(&self.xid)
    }

    fn commit(&mut self, one_phase: bool) -> Result<(), ResourceError> {
        self.resource.commit(&self.xid, one_phase)
    }

    fn rollback(&mut self) -> Result<(), ResourceError> {
        self.resource.rollback(&self.xid)
    }

    fn forget(&mut self) -> Result<(), ResourceError> {
        self.resource.forget(&self.xid)
    }

    fn abort(&mut self) {
        if let Err(e) = self.resource.end_failed(&self.xid) {
            debug!(key = %self.descriptor.name, error = %e, "end(TMFAIL) failed");
        }
    }

    fn supports_one_phase(&self) -> bool {
        self.resource.supports_one_phase()
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

/// Resource that can only commit in one phase (a local transaction).
pub trait OnePhaseResource: Send {
    /// Commits the local transaction.
    ///
    /// # Errors
    ///
    /// Returns the resource's error; `Rollback` means it rolled back.
    fn commit(&mut self) -> Result<(), ResourceError>;

    /// Rolls back the local transaction.
    ///
    /// # Errors
    ///
    /// Returns the resource's error.
    fn rollback(&mut self) -> Result<(), ResourceError>;
}

/// [`Participant`] over a [`OnePhaseResource`]. Used alone it gets the
/// one-phase optimisation; alongside two-phase resources it is the last
/// participant, committed after every other resource has prepared.
pub struct OnePhaseParticipant {
    resource: Box<dyn OnePhaseResource>,
    name: String,
    priority: i32,
    status: ResourceStatus,
}

impl OnePhaseParticipant {
    /// Wraps a one-phase resource.
    pub fn new(resource: Box<dyn OnePhaseResource>, name: impl Into<String>, priority: i32) -> Self {
        Self {
            resource,
            name: name.into(),
            priority,
            status: ResourceStatus::Registered,
        }
    }
}

impl Participant for OnePhaseParticipant {
    fn key(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn status(&self) -> ResourceStatus {
        self.status
    }

    fn set_status(&mut self, status: ResourceStatus) {
        self.status = status;
    }

    fn prepare(&mut self) -> Result<Vote, ResourceError> {
        Err(ResourceError::protocol(format!(
            "one-phase resource '{}' cannot prepare",
            self.name
        )))
    }

    fn commit(&mut self, _one_phase: bool) -> Result<(), ResourceError> {
        self.resource.commit()
    }

    fn rollback(&mut self) -> Result<(), ResourceError> {
        self.resource.rollback()
    }

    fn forget(&mut self) -> Result<(), ResourceError> {
        Ok(())
    }

    fn supports_one_phase(&self) -> bool {
        true
    }

    fn recovery_record(&self) -> Option<RecoveryRecord> {
        None
    }
}

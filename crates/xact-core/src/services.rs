//! Factory lookup for recovery.
//!
//! During recovery the coordinator has only the bytes it logged. The
//! [`ServiceRegistry`] maps the filter stored in each record to a factory
//! that turns the opaque key back into a live handle.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{ResourceError, TransactionError};
use crate::resource::XaResource;
use crate::wsat::RemoteParticipant;
use crate::xid::Xid;

/// Rebuilds XA resources from their recovery key.
pub trait XaResourceFactory: Send + Sync {
    /// Creates a resource handle for `recovery_key`.
    ///
    /// # Errors
    ///
    /// Returns the resource manager's error if it cannot be reached.
    fn recover(&self, recovery_key: &[u8]) -> Result<Box<dyn XaResource>, ResourceError>;
}

/// Rebuilds remote participants from their recovery key.
pub trait RemoteParticipantFactory: Send + Sync {
    /// Creates a participant handle for `recovery_key`.
    ///
    /// # Errors
    ///
    /// Returns the error if the participant cannot be addressed.
    fn recover(&self, recovery_key: &[u8]) -> Result<Arc<dyn RemoteParticipant>, ResourceError>;
}

/// Answer of a superior to a replay-completion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// The superior committed.
    Committed,
    /// The superior rolled back (or never heard of the transaction).
    RolledBack,
    /// The superior has not decided yet.
    Unknown,
}

/// Handle on a superior coordinator, held by subordinates.
pub trait RecoveryCoordinator: Send + Sync {
    /// Asks the superior for the outcome of `xid`.
    ///
    /// # Errors
    ///
    /// Returns a resource error if the superior cannot be reached.
    fn replay_completion(&self, xid: &Xid) -> Result<ReplayOutcome, ResourceError>;

    /// Opaque bytes from which the matching factory can rebuild the handle.
    fn to_bytes(&self) -> Vec<u8>;
}

/// Rebuilds superior coordinator handles.
pub trait RecoveryCoordinatorFactory: Send + Sync {
    /// Restores a handle from [`RecoveryCoordinator::to_bytes`] output.
    ///
    /// # Errors
    ///
    /// Returns a resource error if the data is not understood.
    fn restore(&self, data: &[u8]) -> Result<Arc<dyn RecoveryCoordinator>, ResourceError>;
}

/// Registry of factories keyed by filter.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    xa: Arc<RwLock<HashMap<String, Arc<dyn XaResourceFactory>>>>,
    remote: Arc<RwLock<HashMap<String, Arc<dyn RemoteParticipantFactory>>>>,
    coordinators: Arc<RwLock<HashMap<String, Arc<dyn RecoveryCoordinatorFactory>>>>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an XA resource factory.
    pub fn register_xa_factory(&self, filter: impl Into<String>, factory: Arc<dyn XaResourceFactory>) {
        self.xa.write().insert(filter.into(), factory);
    }

    /// Registers a remote participant factory.
    pub fn register_remote_factory(
        &self,
        filter: impl Into<String>,
        factory: Arc<dyn RemoteParticipantFactory>,
    ) {
        self.remote.write().insert(filter.into(), factory);
    }

    /// Registers a recovery coordinator factory.
    pub fn register_coordinator_factory(
        &self,
        filter: impl Into<String>,
        factory: Arc<dyn RecoveryCoordinatorFactory>,
    ) {
        self.coordinators.write().insert(filter.into(), factory);
    }

    /// Looks up an XA resource factory.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::System` if nothing is registered for
    /// `filter`.
    pub fn xa_factory(&self, filter: &str) -> Result<Arc<dyn XaResourceFactory>, TransactionError> {
        self.xa
            .read()
            .get(filter)
            .cloned()
            .ok_or_else(|| TransactionError::System(format!("no XA resource factory for '{filter}'")))
    }

    /// Looks up a remote participant factory.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::System` if nothing is registered for
    /// `filter`.
    pub fn remote_factory(
        &self,
        filter: &str,
    ) -> Result<Arc<dyn RemoteParticipantFactory>, TransactionError> {
        self.remote.read().get(filter).cloned().ok_or_else(|| {
            TransactionError::System(format!("no remote participant factory for '{filter}'"))
        })
    }

    /// Looks up a recovery coordinator factory.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::System` if nothing is registered for
    /// `filter`.
    pub fn coordinator_factory(
        &self,
        filter: &str,
    ) -> Result<Arc<dyn RecoveryCoordinatorFactory>, TransactionError> {
        self.coordinators.read().get(filter).cloned().ok_or_else(|| {
            TransactionError::System(format!("no recovery coordinator factory for '{filter}'"))
        })
    }
}

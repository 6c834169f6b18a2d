//! Synchronization callbacks around completion.

use crate::error::TransactionError;
use crate::state::Status;

/// Callback registered with a transaction.
pub trait Synchronization: Send + Sync {
    /// Called before the transaction starts to complete, while it is still
    /// associated with the committing thread. An error marks the
    /// transaction rollback-only.
    ///
    /// # Errors
    ///
    /// Any error forces the transaction to roll back.
    fn before_completion(&self) -> Result<(), TransactionError> {
        Ok(())
    }

    /// Called once with the final status, after the transaction has been
    /// disassociated from the completing thread.
    fn after_completion(&self, status: Status);
}

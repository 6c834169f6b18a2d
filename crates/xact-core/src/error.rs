//! Error types for the transaction manager.
//!
//! Two layers exist:
//! - [`ResourceError`] is what a resource manager reports back for a single
//!   branch, tagged with an [`XaErrorCode`].
//! - [`TransactionError`] is what the coordinator surfaces to callers of
//!   `begin`/`commit`/`rollback` and friends.

use std::fmt;

use crate::log::LogError;
use crate::resource::RecordError;

/// Error code reported by a resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XaErrorCode {
    /// Communication with the resource manager was lost; retry later.
    RmFailed,
    /// The resource manager hit an error; for commit this means the branch
    /// was rolled back.
    RmError,
    /// Internal protocol fault in the caller or the resource manager.
    ProtocolError,
    /// Unexpected failure.
    Other,
    /// The branch was rolled back (vote to roll back during prepare).
    Rollback,
    /// The resource manager does not know the branch.
    NotFound,
    /// The operation could not be performed now; retry it.
    Retry,
    /// The branch was heuristically committed.
    HeuristicCommit,
    /// The branch was heuristically rolled back.
    HeuristicRollback,
    /// The branch was partly committed and partly rolled back.
    HeuristicMixed,
    /// The branch may have been heuristically completed.
    HeuristicHazard,
}

impl XaErrorCode {
    /// Short name used in diagnostics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RmFailed => "XAER_RMFAIL",
            Self::RmError => "XAER_RMERR",
            Self::ProtocolError => "XAER_PROTO",
            Self::Other => "XAER_OTHER",
            Self::Rollback => "XA_RB",
            Self::NotFound => "XAER_NOTA",
            Self::Retry => "XA_RETRY",
            Self::HeuristicCommit => "XA_HEURCOM",
            Self::HeuristicRollback => "XA_HEURRB",
            Self::HeuristicMixed => "XA_HEURMIX",
            Self::HeuristicHazard => "XA_HEURHAZ",
        }
    }

    /// Returns true for the four heuristic codes.
    #[must_use]
    pub fn is_heuristic(self) -> bool {
        matches!(
            self,
            Self::HeuristicCommit
                | Self::HeuristicRollback
                | Self::HeuristicMixed
                | Self::HeuristicHazard
        )
    }
}

impl fmt::Display for XaErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a resource manager for one branch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ResourceError {
    /// Error code.
    pub code: XaErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl ResourceError {
    /// Creates a new resource error.
    pub fn new(code: XaErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Communication failure (`RM_FAILED`).
    pub fn rm_failed(message: impl Into<String>) -> Self {
        Self::new(XaErrorCode::RmFailed, message)
    }

    /// Branch failure (`RM_ERROR`).
    pub fn rm_error(message: impl Into<String>) -> Self {
        Self::new(XaErrorCode::RmError, message)
    }

    /// Rollback vote.
    pub fn rollback(message: impl Into<String>) -> Self {
        Self::new(XaErrorCode::Rollback, message)
    }

    /// Protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(XaErrorCode::ProtocolError, message)
    }
}

/// Errors surfaced by the transaction coordinator.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    /// The transaction was rolled back instead of committed.
    #[error("Transaction rolled back: {0}")]
    Rollback(String),

    /// Some participants committed and some rolled back.
    #[error("Heuristic mixed outcome: {0}")]
    HeuristicMixed(String),

    /// The outcome of some participants is unknown.
    #[error("Heuristic hazard: {0}")]
    HeuristicHazard(String),

    /// All participants rolled back although the decision was commit.
    #[error("Heuristic rollback: {0}")]
    HeuristicRollback(String),

    /// All participants committed although the decision was rollback.
    #[error("Heuristic commit: {0}")]
    HeuristicCommit(String),

    /// Unexpected internal failure.
    #[error("System error: {0}")]
    System(String),

    /// Operation not valid in the current state.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Operation not supported (for example a nested begin).
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Caller is not allowed to complete the transaction locally.
    #[error("Security error: {0}")]
    Security(String),

    /// A resource with the same key is already enlisted.
    #[error("Duplicate enlistment of resource '{0}'")]
    DuplicateEnlistment(String),

    /// Recovery log failure.
    #[error("Log error: {0}")]
    Log(#[from] LogError),

    /// Malformed recovery record.
    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    /// Resource manager failure that could not be classified further.
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),
}

impl TransactionError {
    /// Returns true for heuristic outcomes, which need operator attention.
    #[must_use]
    pub fn is_heuristic(&self) -> bool {
        matches!(
            self,
            Self::HeuristicMixed(_)
                | Self::HeuristicHazard(_)
                | Self::HeuristicRollback(_)
                | Self::HeuristicCommit(_)
        )
    }
}

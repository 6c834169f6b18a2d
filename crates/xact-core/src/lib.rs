//! # xact core
//!
//! Embeddable two-phase-commit transaction manager.
//!
//! A [`TransactionManager`] associates transactions with threads and
//! coordinates atomic commit across XA resources, a one-phase last
//! participant and asynchronous remote participants. Prepared transactions
//! are written to a [`RecoveryLog`] so that a restarted manager can finish
//! them with [`TransactionManager::recover`].
//!
//! ```text
//!   TransactionManager ──▶ Transaction ──▶ RegisteredResources ──▶ Participant
//!          │                    │                  │
//!          └── TxContext ◀──────┘                  └──▶ RecoveryLog
//!               (config, timers, factories, worker pool)
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Transaction manager configuration
pub mod config;

/// Shared services of one coordinator instance
pub mod context;

/// Error types
pub mod error;

/// Recovery log interface and the in-memory log
pub mod log;

/// Thread-associated demarcation façade
pub mod manager;

/// Restart recovery
pub mod recovery;

/// Per-transaction participant registry and protocol driver
pub mod registry;

/// Participant abstraction and resource wrappers
pub mod resource;

/// Recovery factories and superior coordinators
pub mod services;

/// Lifecycle states
pub mod state;

/// Completion callbacks
pub mod sync;

/// Test doubles shared by unit and integration tests
pub mod testing;

/// Transaction timers
pub mod timeout;

/// The transaction state machine
pub mod transaction;

/// Asynchronous remote participants
pub mod wsat;

/// Transaction identifiers
pub mod xid;

pub use config::{
    AsyncPrepareOrdering, ConfigError, ConfigurationProvider, HeuristicDirection,
    TransactionConfig, TransactionConfigBuilder,
};
pub use context::TxContext;
pub use error::{ResourceError, TransactionError, XaErrorCode};
pub use log::{InMemoryRecoveryLog, LogError, RecoverableUnit, RecoveryLog, SectionId};
pub use manager::TransactionManager;
pub use recovery::{RecoveryManager, RecoverySummary};
pub use resource::{
    HeuristicOutcome, OnePhaseResource, Participant, ParticipantStatus, RecordError,
    ResourceDescriptor, ResourceStatus, Vote, XaResource,
};
pub use services::{
    RecoveryCoordinator, RecoveryCoordinatorFactory, RemoteParticipantFactory, ReplayOutcome,
    ServiceRegistry, XaResourceFactory,
};
pub use state::{Status, TransactionState};
pub use sync::Synchronization;
pub use timeout::TimeoutKind;
pub use transaction::Transaction;
pub use wsat::RemoteParticipant;
pub use xid::{TransactionId, Xid};

/// Result type for transaction operations.
pub type Result<T> = std::result::Result<T, TransactionError>;

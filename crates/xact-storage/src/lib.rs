//! # xact storage
//!
//! Durable recovery log for `xact-core`.
//!
//! [`FileRecoveryLog`] keeps one append-only file per recoverable unit in a
//! directory. Every write to a unit is a framed record; a reopened log
//! replays the records of each file to rebuild its sections.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Storage errors
pub mod error;

/// File-backed recovery log
pub mod file_log;

/// On-disk record framing
pub mod record;

pub use error::StorageError;
pub use file_log::{FileRecoverableUnit, FileRecoveryLog};
pub use record::{LogRecord, RecordReadResult};

//! Unit file record framing.
//!
//! Record format: `[length: 4 bytes][crc32c: 4 bytes][data: length bytes]`,
//! where `data` is an rkyv-encoded [`LogRecord`]. Integers are little-endian.

use std::io::{Read, Write};

use rkyv::{rancor::Error as RkyvError, util::AlignedVec};
use xact_core::SectionId;

use crate::error::StorageError;

/// Size of the record header (length + checksum).
pub const RECORD_HEADER_SIZE: u64 = 8;

mod record_types {
    #![allow(missing_docs)] // derive-generated archived types

    use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

    /// One write to a recoverable unit.
    #[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
    pub enum LogRecord {
        /// Append a record to a section.
        Add {
            /// Section number.
            section: u32,
            /// Record payload.
            data: Vec<u8>,
        },
        /// Replace every record of a section.
        Replace {
            /// Section number.
            section: u32,
            /// Record payload.
            data: Vec<u8>,
        },
        /// Drop one record of a section.
        Remove {
            /// Section number.
            section: u32,
            /// Position of the record within the section.
            index: u32,
        },
    }
}

pub use record_types::LogRecord;

impl LogRecord {
    /// Section the record belongs to.
    #[must_use]
    pub fn section(&self) -> SectionId {
        match self {
            Self::Add { section, .. }
            | Self::Replace { section, .. }
            | Self::Remove { section, .. } => *section,
        }
    }

    /// Writes the framed record and returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or I/O fails.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<u64, StorageError> {
        let bytes: AlignedVec = rkyv::to_bytes::<RkyvError>(self)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let crc = crc32c::crc32c(&bytes);

        #[allow(clippy::cast_possible_truncation)] // records hold one log entry, far below u32::MAX
        let len = bytes.len() as u32;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&crc.to_le_bytes())?;
        writer.write_all(&bytes)?;

        Ok(RECORD_HEADER_SIZE + u64::from(len))
    }
}

/// Outcome of reading one record.
#[derive(Debug)]
pub enum RecordReadResult {
    /// A valid record.
    Record(LogRecord),
    /// Clean end of file.
    Eof,
    /// The file ends inside a record.
    TornWrite {
        /// Start of the incomplete record.
        position: u64,
        /// What was missing.
        reason: String,
    },
    /// The record's payload does not match its checksum.
    ChecksumMismatch {
        /// Start of the bad record.
        position: u64,
    },
}

/// Sequential reader over a unit file.
pub struct RecordReader<R> {
    reader: R,
    position: u64,
    len: u64,
}

impl<R: Read> RecordReader<R> {
    /// Reads records from `reader`, which holds `len` bytes.
    pub fn new(reader: R, len: u64) -> Self {
        Self {
            reader,
            position: 0,
            len,
        }
    }

    /// Byte offset just past the last record read.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reads the next record.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if a checksummed payload cannot be
    /// decoded. Torn writes and checksum mismatches are reported as results.
    pub fn read_next(&mut self) -> Result<RecordReadResult, StorageError> {
        let remaining = self.len.saturating_sub(self.position);
        if remaining == 0 {
            return Ok(RecordReadResult::Eof);
        }
        if remaining < RECORD_HEADER_SIZE {
            return Ok(RecordReadResult::TornWrite {
                position: self.position,
                reason: format!(
                    "incomplete header: only {remaining} bytes remaining, need {RECORD_HEADER_SIZE}"
                ),
            });
        }

        let record_start = self.position;

        let mut len_bytes = [0u8; 4];
        self.reader.read_exact(&mut len_bytes)?;
        let len = u64::from(u32::from_le_bytes(len_bytes));

        let mut crc_bytes = [0u8; 4];
        self.reader.read_exact(&mut crc_bytes)?;
        let expected_crc = u32::from_le_bytes(crc_bytes);
        self.position += RECORD_HEADER_SIZE;

        let data_remaining = self.len.saturating_sub(self.position);
        if data_remaining < len {
            return Ok(RecordReadResult::TornWrite {
                position: record_start,
                reason: format!("incomplete data: only {data_remaining} bytes remaining, need {len}"),
            });
        }

        let mut data = AlignedVec::<16>::new();
        #[allow(clippy::cast_possible_truncation)] // bounded by a u32 length
        data.resize(len as usize, 0);
        self.reader.read_exact(&mut data)?;
        self.position += len;

        if crc32c::crc32c(&data) != expected_crc {
            return Ok(RecordReadResult::ChecksumMismatch {
                position: record_start,
            });
        }

        rkyv::from_bytes::<LogRecord, RkyvError>(&data)
            .map(RecordReadResult::Record)
            .map_err(|e| StorageError::Deserialization(e.to_string()))
    }
}

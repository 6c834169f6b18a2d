//! Transaction identifiers.
//!
//! A transaction has a process-local number used for timers and diagnostics,
//! and a global [`Xid`] shared with resource managers. Each enlisted branch
//! gets its own branch qualifier under the same global id.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::resource::record::{put_bytes, ByteReader};
use crate::resource::RecordError;

/// Format identifier stamped on every generated [`Xid`].
pub const XACT_FORMAT_ID: i32 = 0x5841_4354;

/// XA transaction branch identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    format_id: i32,
    gtrid: Vec<u8>,
    bqual: Vec<u8>,
}

impl Xid {
    /// Creates an identifier from its parts.
    #[must_use]
    pub fn new(format_id: i32, gtrid: Vec<u8>, bqual: Vec<u8>) -> Self {
        Self {
            format_id,
            gtrid,
            bqual,
        }
    }

    /// Format identifier.
    #[must_use]
    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    /// Global transaction id bytes.
    #[must_use]
    pub fn gtrid(&self) -> &[u8] {
        &self.gtrid
    }

    /// Branch qualifier bytes.
    #[must_use]
    pub fn bqual(&self) -> &[u8] {
        &self.bqual
    }

    /// Identifier for branch `branch` of the same global transaction.
    #[must_use]
    pub fn branch(&self, branch: u32) -> Self {
        Self {
            format_id: self.format_id,
            gtrid: self.gtrid.clone(),
            bqual: branch.to_be_bytes().to_vec(),
        }
    }

    /// Returns true if both ids belong to the same global transaction.
    #[must_use]
    pub fn same_transaction(&self, other: &Xid) -> bool {
        self.format_id == other.format_id && self.gtrid == other.gtrid
    }

    /// Appends the encoded id to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.format_id.to_le_bytes());
        put_bytes(buf, &self.gtrid);
        put_bytes(buf, &self.bqual);
    }

    /// Encodes the id on its own.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + self.gtrid.len() + self.bqual.len());
        self.encode_into(&mut buf);
        buf
    }

    pub(crate) fn decode_from(reader: &mut ByteReader<'_>) -> Result<Self, RecordError> {
        let format_id = reader.i32()?;
        let gtrid = reader.bytes()?.to_vec();
        let bqual = reader.bytes()?.to_vec();
        Ok(Self {
            format_id,
            gtrid,
            bqual,
        })
    }

    /// Decodes an id written by [`Xid::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns `RecordError::Truncated` if the buffer is short.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RecordError> {
        let mut reader = ByteReader::new(bytes);
        Self::decode_from(&mut reader)
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{b:02x}")?;
    }
    Ok(())
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:", self.format_id)?;
        write_hex(f, &self.gtrid)?;
        f.write_str(":")?;
        write_hex(f, &self.bqual)
    }
}

/// Identity of one transaction within this process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId {
    local: u64,
    xid: Xid,
}

impl TransactionId {
    /// Creates an id from a local number and a global id.
    #[must_use]
    pub fn new(local: u64, xid: Xid) -> Self {
        Self { local, xid }
    }

    /// Process-local number.
    #[must_use]
    pub fn local(&self) -> u64 {
        self.local
    }

    /// Global id.
    #[must_use]
    pub fn xid(&self) -> &Xid {
        &self.xid
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.local)
    }
}

/// Hands out transaction ids. Global ids are the process application id
/// followed by the local number, so they stay unique across restarts.
#[derive(Debug)]
pub struct IdGenerator {
    application_id: [u8; 16],
    next: AtomicU64,
}

impl IdGenerator {
    /// Creates a generator with a fresh random application id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            application_id: *uuid::Uuid::new_v4().as_bytes(),
            next: AtomicU64::new(1),
        }
    }

    /// Next local number.
    pub fn next_local(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Next id for a transaction originated here.
    pub fn next_id(&self) -> TransactionId {
        let local = self.next_local();
        let mut gtrid = Vec::with_capacity(24);
        gtrid.extend_from_slice(&self.application_id);
        gtrid.extend_from_slice(&local.to_be_bytes());
        TransactionId::new(local, Xid::new(XACT_FORMAT_ID, gtrid, Vec::new()))
    }

    /// Local id for a transaction whose global id came from elsewhere
    /// (an imported or recovered transaction).
    pub fn adopt(&self, xid: Xid) -> TransactionId {
        TransactionId::new(self.next_local(), xid)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

//! Versioned byte encoding of prepared participants.
//!
//! ## Wire format
//!
//! ```text
//! [version: u8][priority: i32 LE]
//! [name_len: u32 LE][name: UTF-8]
//! [filter_len: u32 LE][filter: UTF-8]
//! [key_len: u32 LE][recovery key]
//! [format_id: i32 LE][gtrid_len: u32 LE][gtrid][bqual_len: u32 LE][bqual]
//! ```
//!
//! Decoding is bounds-checked and never panics on truncated input.

use crate::xid::Xid;

/// Current record schema version.
pub const RECORD_VERSION: u8 = 1;

/// Errors from decoding a log record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// Record ended before all fields were read.
    #[error("Record truncated at offset {0}")]
    Truncated(usize),

    /// Version byte is not understood.
    #[error("Unsupported record version {0}")]
    UnsupportedVersion(u8),

    /// A string field is not valid UTF-8.
    #[error("Invalid UTF-8 in field '{0}'")]
    InvalidUtf8(&'static str),

    /// A tag byte is out of range.
    #[error("Invalid tag {tag} for {field}")]
    InvalidTag {
        /// Field name.
        field: &'static str,
        /// Offending byte.
        tag: u8,
    },
}

/// Appends a u32-LE length prefix followed by `bytes`.
#[allow(clippy::cast_possible_truncation)] // Wire format uses u32 lengths
pub(crate) fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

/// Cursor over an encoded record.
pub(crate) struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], RecordError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(RecordError::Truncated(self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, RecordError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn i32(&mut self) -> Result<i32, RecordError> {
        let raw = self.take(4)?;
        Ok(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub(crate) fn bytes(&mut self) -> Result<&'a [u8], RecordError> {
        let raw = self.take(4)?;
        let len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        self.take(len)
    }

    pub(crate) fn string(&mut self, field: &'static str) -> Result<String, RecordError> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| RecordError::InvalidUtf8(field))
    }
}

/// Everything needed to rebuild a prepared participant after a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryRecord {
    /// Commit priority.
    pub priority: i32,
    /// Resource key, unique within a transaction.
    pub name: String,
    /// Factory filter used to look up the resource factory.
    pub filter: String,
    /// Opaque key handed to the factory.
    pub recovery_key: Vec<u8>,
    /// Branch identifier the resource was prepared under.
    pub xid: Xid,
}

impl RecoveryRecord {
    /// Encodes the record.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            32 + self.name.len() + self.filter.len() + self.recovery_key.len(),
        );
        buf.push(RECORD_VERSION);
        buf.extend_from_slice(&self.priority.to_le_bytes());
        put_bytes(&mut buf, self.name.as_bytes());
        put_bytes(&mut buf, self.filter.as_bytes());
        put_bytes(&mut buf, &self.recovery_key);
        self.xid.encode_into(&mut buf);
        buf
    }

    /// Decodes a record.
    ///
    /// # Errors
    ///
    /// Returns a [`RecordError`] describing the first malformed field.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RecordError> {
        let mut reader = ByteReader::new(bytes);
        let version = reader.u8()?;
        if version != RECORD_VERSION {
            return Err(RecordError::UnsupportedVersion(version));
        }
        Ok(Self {
            priority: reader.i32()?,
            name: reader.string("name")?,
            filter: reader.string("filter")?,
            recovery_key: reader.bytes()?.to_vec(),
            xid: Xid::decode_from(&mut reader)?,
        })
    }
}

/// Logged reference to a superior coordinator, for subordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorRecord {
    /// Factory filter used to restore the coordinator handle.
    pub filter: String,
    /// Opaque handle data.
    pub data: Vec<u8>,
}

impl CoordinatorRecord {
    /// Encodes the record.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(9 + self.filter.len() + self.data.len());
        buf.push(RECORD_VERSION);
        put_bytes(&mut buf, self.filter.as_bytes());
        put_bytes(&mut buf, &self.data);
        buf
    }

    /// Decodes the record.
    ///
    /// # Errors
    ///
    /// Returns a [`RecordError`] describing the first malformed field.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RecordError> {
        let mut reader = ByteReader::new(bytes);
        let version = reader.u8()?;
        if version != RECORD_VERSION {
            return Err(RecordError::UnsupportedVersion(version));
        }
        Ok(Self {
            filter: reader.string("filter")?,
            data: reader.bytes()?.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RecoveryRecord {
        RecoveryRecord {
            priority: -3,
            name: "orders-db".into(),
            filter: "jdbc".into(),
            recovery_key: vec![1, 2, 3, 4],
            xid: Xid::new(1, vec![0xaa; 8], vec![0, 0, 0, 2]),
        }
    }

    #[test]
    fn test_record_bytes() {
        let record = sample();
        let bytes = record.to_bytes();
        assert_eq!(bytes[0], RECORD_VERSION);
        assert_eq!(RecoveryRecord::from_bytes(&bytes).unwrap(), record);
    }

    #[test]
    fn test_every_truncation_is_rejected() {
        let bytes = sample().to_bytes();
        for len in 0..bytes.len() {
            assert!(
                RecoveryRecord::from_bytes(&bytes[..len]).is_err(),
                "prefix of {len} bytes decoded"
            );
        }
    }

    #[test]
    fn test_unknown_version() {
        let mut bytes = sample().to_bytes();
        bytes[0] = 9;
        assert_eq!(
            RecoveryRecord::from_bytes(&bytes),
            Err(RecordError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn test_huge_length_prefix() {
        let mut bytes = vec![RECORD_VERSION, 0, 0, 0, 0];
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            RecoveryRecord::from_bytes(&bytes),
            Err(RecordError::Truncated(_))
        ));
    }

    #[test]
    fn test_bad_utf8() {
        let mut bytes = vec![RECORD_VERSION];
        bytes.extend_from_slice(&0i32.to_le_bytes());
        put_bytes(&mut bytes, &[0xff, 0xfe]);
        assert_eq!(
            RecoveryRecord::from_bytes(&bytes),
            Err(RecordError::InvalidUtf8("name"))
        );
    }

    #[test]
    fn test_coordinator_record() {
        let record = CoordinatorRecord {
            filter: "wsat".into(),
            data: b"http://superior/tx/1".to_vec(),
        };
        assert_eq!(CoordinatorRecord::from_bytes(&record.to_bytes()).unwrap(), record);
        assert!(CoordinatorRecord::from_bytes(&[RECORD_VERSION, 1]).is_err());
    }
}

use xact_core::LogError;

/// Errors from the file-backed recovery log.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// IO error while reading or writing unit files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error when writing a record.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error when reading a record.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Checksum mismatch in the middle of a unit file.
    #[error("Corrupted record in unit {unit} at position {position}")]
    Corrupted {
        /// Unit whose file is damaged.
        unit: u64,
        /// Byte offset of the bad record.
        position: u64,
    },

    /// Unknown unit.
    #[error("Recoverable unit {0} not found")]
    UnitNotFound(u64),
}

impl From<StorageError> for LogError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::UnitNotFound(id) => LogError::UnitNotFound(id),
            StorageError::Corrupted { .. } | StorageError::Deserialization(_) => {
                LogError::Corrupted(err.to_string())
            }
            StorageError::Io(_) | StorageError::Serialization(_) => LogError::Io(err.to_string()),
        }
    }
}

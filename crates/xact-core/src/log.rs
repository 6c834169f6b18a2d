//! Recovery log abstraction.
//!
//! The log is a set of recoverable units, one per transaction that reached
//! the prepared stage. Each unit holds numbered sections of opaque records.
//! Storage is external: [`InMemoryRecoveryLog`] is provided for tests and
//! embedded use; `xact-storage` provides a file-backed implementation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// Section number within a recoverable unit.
pub type SectionId = u32;

/// Transaction state, one byte per record; the last record wins.
pub const STATE_SECTION: SectionId = 1;
/// One record per prepared XA resource.
pub const XA_RESOURCE_SECTION: SectionId = 2;
/// One record per prepared remote participant.
pub const ASYNC_RESOURCE_SECTION: SectionId = 3;
/// Superior coordinator reference; present only for subordinates.
pub const RECOVERY_COORDINATOR_SECTION: SectionId = 4;
/// Heuristic outcome byte; the last record wins.
pub const HEURISTIC_OUTCOME_SECTION: SectionId = 5;
/// Global transaction id.
pub const GLOBAL_ID_SECTION: SectionId = 6;

/// Errors from the recovery log.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// I/O failure in the backing store.
    #[error("Log I/O error: {0}")]
    Io(String),

    /// Unknown unit.
    #[error("Recoverable unit {0} not found")]
    UnitNotFound(u64),

    /// Stored data failed validation.
    #[error("Corrupted log data: {0}")]
    Corrupted(String),
}

/// One transaction's persistent records.
pub trait RecoverableUnit: Send + Sync {
    /// Unit identifier.
    fn id(&self) -> u64;

    /// Appends a record to a section, creating the section if needed.
    /// Data is durable only after [`RecoverableUnit::force`].
    ///
    /// # Errors
    ///
    /// Returns `LogError` if the write fails.
    fn add_data(&self, section: SectionId, data: &[u8]) -> Result<(), LogError>;

    /// Replaces the contents of a single-valued section.
    ///
    /// # Errors
    ///
    /// Returns `LogError` if the write fails.
    fn replace_data(&self, section: SectionId, data: &[u8]) -> Result<(), LogError>;

    /// Removes the record at `index` of a section. Returns whether a
    /// record was removed.
    ///
    /// # Errors
    ///
    /// Returns `LogError` if the write fails.
    fn remove_data(&self, section: SectionId, index: usize) -> Result<bool, LogError>;

    /// Every record in a section, oldest first. Empty if the section does
    /// not exist.
    fn section_data(&self, section: SectionId) -> Vec<Vec<u8>>;

    /// Whether a section exists.
    fn has_section(&self, section: SectionId) -> bool {
        !self.section_data(section).is_empty()
    }

    /// Last record of a section.
    fn last_data(&self, section: SectionId) -> Option<Vec<u8>> {
        self.section_data(section).pop()
    }

    /// Makes every write so far durable.
    ///
    /// # Errors
    ///
    /// Returns `LogError` if the flush fails.
    fn force(&self) -> Result<(), LogError>;
}

/// Collection of recoverable units.
pub trait RecoveryLog: Send + Sync {
    /// Creates an empty unit.
    ///
    /// # Errors
    ///
    /// Returns `LogError` if the unit cannot be created.
    fn create_unit(&self) -> Result<Arc<dyn RecoverableUnit>, LogError>;

    /// Every unit currently in the log.
    ///
    /// # Errors
    ///
    /// Returns `LogError` if the log cannot be read.
    fn units(&self) -> Result<Vec<Arc<dyn RecoverableUnit>>, LogError>;

    /// Deletes a unit.
    ///
    /// # Errors
    ///
    /// Returns `LogError::UnitNotFound` for unknown ids.
    fn remove_unit(&self, id: u64) -> Result<(), LogError>;
}

/// Handle to one section of a unit.
pub struct Section {
    unit: Arc<dyn RecoverableUnit>,
    id: SectionId,
}

impl Section {
    /// Opens section `id` of `unit`.
    #[must_use]
    pub fn new(unit: Arc<dyn RecoverableUnit>, id: SectionId) -> Self {
        Self { unit, id }
    }

    /// Appends a record.
    ///
    /// # Errors
    ///
    /// Returns `LogError` if the write fails.
    pub fn add_data(&self, data: &[u8]) -> Result<(), LogError> {
        self.unit.add_data(self.id, data)
    }

    /// Records in the section.
    #[must_use]
    pub fn data(&self) -> Vec<Vec<u8>> {
        self.unit.section_data(self.id)
    }

    /// Last record.
    #[must_use]
    pub fn last_data(&self) -> Option<Vec<u8>> {
        self.unit.last_data(self.id)
    }

    /// Walks the records present now, oldest first.
    #[must_use]
    pub fn cursor(&self) -> SectionCursor<'_> {
        SectionCursor {
            section: self,
            records: self.data(),
            next: 0,
            removed: 0,
            current_removed: false,
        }
    }
}

/// Iterator over a snapshot of one section that can remove the record it
/// last returned.
pub struct SectionCursor<'a> {
    section: &'a Section,
    records: Vec<Vec<u8>>,
    next: usize,
    removed: usize,
    current_removed: bool,
}

impl SectionCursor<'_> {
    /// Removes the record last returned by [`Iterator::next`]. Returns
    /// `false` if there is none or it was already removed.
    ///
    /// # Errors
    ///
    /// Returns `LogError` if the write fails.
    pub fn remove(&mut self) -> Result<bool, LogError> {
        if self.next == 0 || self.current_removed {
            return Ok(false);
        }
        // Earlier removals shift the live position of later records.
        let index = self.next - 1 - self.removed;
        let removed = self.section.unit.remove_data(self.section.id, index)?;
        if removed {
            self.removed += 1;
            self.current_removed = true;
        }
        Ok(removed)
    }
}

impl Iterator for SectionCursor<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        let record = self.records.get(self.next).cloned()?;
        self.next += 1;
        self.current_removed = false;
        Some(record)
    }
}

#[derive(Default)]
struct MemoryUnit {
    id: u64,
    sections: Mutex<BTreeMap<SectionId, Vec<Vec<u8>>>>,
    forces: AtomicUsize,
}

impl RecoverableUnit for MemoryUnit {
    fn id(&self) -> u64 {
        self.id
    }

    fn add_data(&self, section: SectionId, data: &[u8]) -> Result<(), LogError> {
        self.sections
            .lock()
            .entry(section)
            .or_default()
            .push(data.to_vec());
        Ok(())
    }

    fn replace_data(&self, section: SectionId, data: &[u8]) -> Result<(), LogError> {
        self.sections.lock().insert(section, vec![data.to_vec()]);
        Ok(())
    }

    fn remove_data(&self, section: SectionId, index: usize) -> Result<bool, LogError> {
        let mut sections = self.sections.lock();
        let Some(records) = sections.get_mut(&section) else {
            return Ok(false);
        };
        if index >= records.len() {
            return Ok(false);
        }
        records.remove(index);
        if records.is_empty() {
            sections.remove(&section);
        }
        Ok(true)
    }

    fn section_data(&self, section: SectionId) -> Vec<Vec<u8>> {
        self.sections
            .lock()
            .get(&section)
            .cloned()
            .unwrap_or_default()
    }

    fn force(&self) -> Result<(), LogError> {
        self.forces.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Recovery log kept in memory. Clones share the same units, so a second
/// transaction manager built over a clone sees what the first one wrote.
#[derive(Clone, Default)]
pub struct InMemoryRecoveryLog {
    units: Arc<RwLock<BTreeMap<u64, Arc<MemoryUnit>>>>,
    next_id: Arc<AtomicU64>,
}

impl InMemoryRecoveryLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of units.
    #[must_use]
    pub fn unit_count(&self) -> usize {
        self.units.read().len()
    }

    /// How often a unit has been forced.
    #[must_use]
    pub fn force_count(&self, id: u64) -> usize {
        self.units
            .read()
            .get(&id)
            .map_or(0, |u| u.forces.load(Ordering::Relaxed))
    }
}

impl RecoveryLog for InMemoryRecoveryLog {
    fn create_unit(&self) -> Result<Arc<dyn RecoverableUnit>, LogError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let unit = Arc::new(MemoryUnit {
            id,
            ..MemoryUnit::default()
        });
        self.units.write().insert(id, Arc::clone(&unit));
        Ok(unit)
    }

    fn units(&self) -> Result<Vec<Arc<dyn RecoverableUnit>>, LogError> {
        Ok(self
            .units
            .read()
            .values()
            .map(|u| Arc::clone(u) as Arc<dyn RecoverableUnit>)
            .collect())
    }

    fn remove_unit(&self, id: u64) -> Result<(), LogError> {
        self.units
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(LogError::UnitNotFound(id))
    }
}

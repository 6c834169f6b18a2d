//! Directory of unit files.
//!
//! Each recoverable unit lives in `unit_{id:020}.log`. Writes are buffered
//! and become durable on [`RecoverableUnit::force`], which flushes and
//! fsyncs the file. Creating and removing unit files also syncs the
//! directory so the entry itself survives a crash.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use xact_core::{LogError, RecoverableUnit, RecoveryLog, SectionId};

use crate::error::StorageError;
use crate::record::{LogRecord, RecordReadResult, RecordReader};

const UNIT_PREFIX: &str = "unit_";
const UNIT_EXTENSION: &str = "log";

/// Fsync a directory to make created and removed entries durable.
#[allow(clippy::unnecessary_wraps)] // Returns Result on Unix, no-op elsewhere
fn sync_dir(path: &Path) -> Result<(), std::io::Error> {
    #[cfg(unix)]
    {
        let f = File::open(path)?;
        f.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

fn unit_file_name(id: u64) -> String {
    format!("{UNIT_PREFIX}{id:020}.{UNIT_EXTENSION}")
}

fn parse_unit_id(path: &Path) -> Option<u64> {
    if path.extension()? != UNIT_EXTENSION {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(UNIT_PREFIX)?
        .parse()
        .ok()
}

struct UnitState {
    writer: BufWriter<File>,
    sections: BTreeMap<SectionId, Vec<Vec<u8>>>,
    position: u64,
}

fn apply(sections: &mut BTreeMap<SectionId, Vec<Vec<u8>>>, record: LogRecord) {
    match record {
        LogRecord::Add { section, data } => sections.entry(section).or_default().push(data),
        LogRecord::Replace { section, data } => {
            sections.insert(section, vec![data]);
        }
        LogRecord::Remove { section, index } => {
            let Some(records) = sections.get_mut(&section) else {
                return;
            };
            let index = index as usize;
            if index < records.len() {
                records.remove(index);
            }
            if records.is_empty() {
                sections.remove(&section);
            }
        }
    }
}

/// One unit file.
pub struct FileRecoverableUnit {
    id: u64,
    path: PathBuf,
    state: Mutex<UnitState>,
}

impl FileRecoverableUnit {
    fn create(dir: &Path, id: u64) -> Result<Self, StorageError> {
        let path = dir.join(unit_file_name(id));
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;
        sync_dir(dir)?;

        Ok(Self {
            id,
            path,
            state: Mutex::new(UnitState {
                writer: BufWriter::new(file),
                sections: BTreeMap::new(),
                position: 0,
            }),
        })
    }

    /// Replays an existing unit file. A torn record at the tail is cut off;
    /// a checksum failure anywhere else is corruption.
    fn open(path: PathBuf, id: u64) -> Result<Self, StorageError> {
        let len = std::fs::metadata(&path)?.len();
        let mut reader = RecordReader::new(BufReader::new(File::open(&path)?), len);
        let mut sections: BTreeMap<SectionId, Vec<Vec<u8>>> = BTreeMap::new();
        let mut records = 0usize;

        let valid_len = loop {
            match reader.read_next()? {
                RecordReadResult::Record(record) => {
                    records += 1;
                    apply(&mut sections, record);
                }
                RecordReadResult::Eof => break len,
                RecordReadResult::TornWrite { position, reason } => {
                    warn!(unit = id, position, %reason, "Truncating torn record");
                    break position;
                }
                RecordReadResult::ChecksumMismatch { position } => {
                    if reader.position() < len {
                        return Err(StorageError::Corrupted { unit: id, position });
                    }
                    warn!(unit = id, position, "Truncating record with bad checksum at tail");
                    break position;
                }
            }
        };

        let file = OpenOptions::new().append(true).open(&path)?;
        if valid_len < len {
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        debug!(unit = id, records, sections = sections.len(), "Replayed unit file");

        Ok(Self {
            id,
            path,
            state: Mutex::new(UnitState {
                writer: BufWriter::new(file),
                sections,
                position: valid_len,
            }),
        })
    }

    /// Path of the unit file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written to the unit file, including unflushed ones.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.state.lock().position
    }

    fn write(&self, record: LogRecord) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        let written = record.write_to(&mut state.writer)?;
        state.position += written;
        apply(&mut state.sections, record);
        Ok(())
    }

    fn sync(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.writer.flush()?;
        state.writer.get_ref().sync_all()?;
        Ok(())
    }
}

impl RecoverableUnit for FileRecoverableUnit {
    fn id(&self) -> u64 {
        self.id
    }

    fn add_data(&self, section: SectionId, data: &[u8]) -> Result<(), LogError> {
        self.write(LogRecord::Add {
            section,
            data: data.to_vec(),
        })
        .map_err(LogError::from)
    }

    fn replace_data(&self, section: SectionId, data: &[u8]) -> Result<(), LogError> {
        self.write(LogRecord::Replace {
            section,
            data: data.to_vec(),
        })
        .map_err(LogError::from)
    }

    fn remove_data(&self, section: SectionId, index: usize) -> Result<bool, LogError> {
        let present = self
            .state
            .lock()
            .sections
            .get(&section)
            .is_some_and(|records| index < records.len());
        let Ok(index) = u32::try_from(index) else {
            return Ok(false);
        };
        if !present {
            return Ok(false);
        }
        self.write(LogRecord::Remove { section, index })
            .map_err(LogError::from)?;
        Ok(true)
    }

    fn section_data(&self, section: SectionId) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .sections
            .get(&section)
            .cloned()
            .unwrap_or_default()
    }

    fn force(&self) -> Result<(), LogError> {
        self.sync().map_err(LogError::from)
    }
}

/// Recovery log stored as one file per unit under a directory.
pub struct FileRecoveryLog {
    dir: PathBuf,
    units: RwLock<BTreeMap<u64, Arc<FileRecoverableUnit>>>,
    next_id: AtomicU64,
}

impl FileRecoveryLog {
    /// Opens the log in `dir`, creating the directory if needed, and
    /// replays every unit file found there.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the directory cannot be read or a unit
    /// file is corrupted.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut units = BTreeMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(id) = parse_unit_id(&path) else {
                continue;
            };
            let unit = FileRecoverableUnit::open(path, id)?;
            units.insert(id, Arc::new(unit));
        }

        let next_id = units.keys().next_back().copied().unwrap_or(0);
        info!(dir = %dir.display(), units = units.len(), "Opened recovery log");

        Ok(Self {
            dir,
            units: RwLock::new(units),
            next_id: AtomicU64::new(next_id),
        })
    }

    /// Directory holding the unit files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of units.
    #[must_use]
    pub fn unit_count(&self) -> usize {
        self.units.read().len()
    }

    /// Looks up a unit by id.
    #[must_use]
    pub fn unit(&self, id: u64) -> Option<Arc<FileRecoverableUnit>> {
        self.units.read().get(&id).cloned()
    }
}

impl RecoveryLog for FileRecoveryLog {
    fn create_unit(&self) -> Result<Arc<dyn RecoverableUnit>, LogError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let unit = Arc::new(FileRecoverableUnit::create(&self.dir, id)?);
        self.units.write().insert(id, Arc::clone(&unit));
        debug!(unit = id, "Created unit file");
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
        let unit = self
            .units
            .write()
            .remove(&id)
            .ok_or(StorageError::UnitNotFound(id))?;
        std::fs::remove_file(unit.path()).map_err(StorageError::from)?;
        sync_dir(&self.dir).map_err(StorageError::from)?;
        debug!(unit = id, "Removed unit file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use xact_core::log::{Section, STATE_SECTION, XA_RESOURCE_SECTION};

    #[test]
    fn test_unit_file_names_round_trip() {
        let name = unit_file_name(42);
        assert_eq!(name, "unit_00000000000000000042.log");
        assert_eq!(parse_unit_id(Path::new(&name)), Some(42));
        assert_eq!(parse_unit_id(Path::new("unit_7.tmp")), None);
        assert_eq!(parse_unit_id(Path::new("notes.log")), None);
    }

    #[test]
    fn test_sections_visible_before_force() {
        let dir = TempDir::new().unwrap();
        let log = FileRecoveryLog::open(dir.path()).unwrap();
        let unit = log.create_unit().unwrap();

        unit.add_data(XA_RESOURCE_SECTION, b"db1").unwrap();
        unit.replace_data(STATE_SECTION, &[1]).unwrap();
        unit.replace_data(STATE_SECTION, &[2]).unwrap();

        assert_eq!(unit.section_data(XA_RESOURCE_SECTION), vec![b"db1".to_vec()]);
        assert_eq!(unit.last_data(STATE_SECTION), Some(vec![2]));
    }

    #[test]
    fn test_removed_records_stay_removed_after_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let log = FileRecoveryLog::open(dir.path()).unwrap();
            let unit = log.create_unit().unwrap();
            let section = Section::new(Arc::clone(&unit), XA_RESOURCE_SECTION);
            section.add_data(b"db1").unwrap();
            section.add_data(b"db2").unwrap();
            section.add_data(b"db3").unwrap();

            let mut cursor = section.cursor();
            while let Some(record) = cursor.next() {
                if record == b"db2" {
                    assert!(cursor.remove().unwrap());
                }
            }
            assert!(!unit.remove_data(XA_RESOURCE_SECTION, 5).unwrap());
            unit.force().unwrap();
        }

        let log = FileRecoveryLog::open(dir.path()).unwrap();
        assert_eq!(
            log.units().unwrap()[0].section_data(XA_RESOURCE_SECTION),
            vec![b"db1".to_vec(), b"db3".to_vec()]
        );
    }

    #[test]
    fn test_remove_deletes_file() {
        let dir = TempDir::new().unwrap();
        let log = FileRecoveryLog::open(dir.path()).unwrap();
        let unit = log.create_unit().unwrap();
        let path = log.unit(unit.id()).unwrap().path().to_path_buf();
        assert!(path.exists());

        log.remove_unit(unit.id()).unwrap();
        assert!(!path.exists());
        assert!(matches!(
            log.remove_unit(unit.id()),
            Err(LogError::UnitNotFound(_))
        ));
    }

    #[test]
    fn test_ids_continue_after_reopen() {
        let dir = TempDir::new().unwrap();
        let first_id = {
            let log = FileRecoveryLog::open(dir.path()).unwrap();
            log.create_unit().unwrap();
            log.create_unit().unwrap().id()
        };

        let log = FileRecoveryLog::open(dir.path()).unwrap();
        let next = log.create_unit().unwrap();
        assert!(next.id() > first_id);
    }
}

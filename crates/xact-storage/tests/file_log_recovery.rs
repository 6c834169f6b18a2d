use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;

use tempfile::TempDir;
use xact_core::log::{GLOBAL_ID_SECTION, STATE_SECTION, XA_RESOURCE_SECTION};
use xact_core::testing::{CallJournal, MockXaFactory, MockXaResource};
use xact_core::{
    HeuristicDirection, LogError, RecoveryLog, ResourceDescriptor, ResourceError, ServiceRegistry,
    TransactionConfig, TransactionManager, TransactionState,
};
use xact_storage::{FileRecoveryLog, StorageError};

#[test]
fn test_forced_units_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let id = {
        let log = FileRecoveryLog::open(dir.path()).unwrap();
        let unit = log.create_unit().unwrap();
        unit.add_data(GLOBAL_ID_SECTION, b"gtrid-1").unwrap();
        unit.add_data(XA_RESOURCE_SECTION, b"db1").unwrap();
        unit.add_data(XA_RESOURCE_SECTION, b"db2").unwrap();
        unit.replace_data(STATE_SECTION, &[3]).unwrap();
        unit.replace_data(STATE_SECTION, &[5]).unwrap();
        unit.force().unwrap();
        unit.id()
    };

    let log = FileRecoveryLog::open(dir.path()).unwrap();
    let units = log.units().unwrap();
    assert_eq!(units.len(), 1);
    let unit = &units[0];
    assert_eq!(unit.id(), id);
    assert_eq!(unit.last_data(GLOBAL_ID_SECTION), Some(b"gtrid-1".to_vec()));
    assert_eq!(
        unit.section_data(XA_RESOURCE_SECTION),
        vec![b"db1".to_vec(), b"db2".to_vec()]
    );
    assert_eq!(unit.section_data(STATE_SECTION), vec![vec![5]]);
}

#[test]
fn test_removed_units_stay_removed() {
    let dir = TempDir::new().unwrap();
    {
        let log = FileRecoveryLog::open(dir.path()).unwrap();
        let keep = log.create_unit().unwrap();
        keep.replace_data(STATE_SECTION, &[3]).unwrap();
        keep.force().unwrap();
        let gone = log.create_unit().unwrap();
        gone.replace_data(STATE_SECTION, &[3]).unwrap();
        gone.force().unwrap();
        log.remove_unit(gone.id()).unwrap();
    }

    let log = FileRecoveryLog::open(dir.path()).unwrap();
    assert_eq!(log.unit_count(), 1);
}

#[test]
fn test_torn_tail_is_truncated_on_reopen() {
    let dir = TempDir::new().unwrap();
    let path = {
        let log = FileRecoveryLog::open(dir.path()).unwrap();
        let unit = log.create_unit().unwrap();
        unit.add_data(XA_RESOURCE_SECTION, b"db1").unwrap();
        unit.force().unwrap();
        log.unit(unit.id()).unwrap().path().to_path_buf()
    };
    let good_len = std::fs::metadata(&path).unwrap().len();

    // Half a header from a write that never completed.
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[9, 0, 0]).unwrap();
    drop(file);

    let log = FileRecoveryLog::open(dir.path()).unwrap();
    let unit = &log.units().unwrap()[0];
    assert_eq!(unit.section_data(XA_RESOURCE_SECTION), vec![b"db1".to_vec()]);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);

    unit.add_data(XA_RESOURCE_SECTION, b"db2").unwrap();
    unit.force().unwrap();
    drop(log);

    let log = FileRecoveryLog::open(dir.path()).unwrap();
    assert_eq!(
        log.units().unwrap()[0].section_data(XA_RESOURCE_SECTION),
        vec![b"db1".to_vec(), b"db2".to_vec()]
    );
}

#[test]
fn test_corrupted_record_fails_open() {
    let dir = TempDir::new().unwrap();
    let path = {
        let log = FileRecoveryLog::open(dir.path()).unwrap();
        let unit = log.create_unit().unwrap();
        unit.add_data(XA_RESOURCE_SECTION, b"db1").unwrap();
        unit.add_data(XA_RESOURCE_SECTION, b"db2").unwrap();
        unit.force().unwrap();
        log.unit(unit.id()).unwrap().path().to_path_buf()
    };

    // Flip a payload byte of the first record; the second stays intact.
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[10] ^= 0xff;
    std::fs::write(&path, bytes).unwrap();

    match FileRecoveryLog::open(dir.path()) {
        Err(err @ StorageError::Corrupted { position: 0, .. }) => {
            assert!(matches!(LogError::from(err), LogError::Corrupted(_)));
        }
        Err(other) => panic!("expected corruption, got {other}"),
        Ok(_) => panic!("expected corruption"),
    }
}

#[test]
fn test_restarted_manager_finishes_commit_from_disk() {
    let dir = TempDir::new().unwrap();
    let journal = CallJournal::new();
    let config = TransactionConfig::builder()
        .direction(HeuristicDirection::Rollback)
        .retry_interval(3600)
        .build()
        .unwrap();

    {
        let log = Arc::new(FileRecoveryLog::open(dir.path()).unwrap());
        let tm = TransactionManager::new(config.clone(), log.clone(), ServiceRegistry::new()).unwrap();
        let tx = tm.begin().unwrap();
        tm.enlist_resource(
            Box::new(MockXaResource::new("db1", &journal).fail_commit(ResourceError::rm_failed("down"))),
            ResourceDescriptor::new("db1", "mock").with_recovery_key(b"db1".to_vec()),
        )
        .unwrap();
        tm.enlist_resource(
            Box::new(MockXaResource::new("db2", &journal)),
            ResourceDescriptor::new("db2", "mock").with_recovery_key(b"db2".to_vec()),
        )
        .unwrap();
        let _ = tm.commit();
        assert_eq!(tx.state(), TransactionState::Committing);
        assert_eq!(log.unit_count(), 1);
        tm.context().shutdown();
    }

    let restarted = CallJournal::new();
    let services = ServiceRegistry::new();
    services.register_xa_factory("mock", Arc::new(MockXaFactory::new(&restarted)));
    let log = Arc::new(FileRecoveryLog::open(dir.path()).unwrap());
    assert_eq!(log.unit_count(), 1);

    let tm = TransactionManager::new(config, log.clone(), services).unwrap();
    let summary = tm.recover().unwrap();

    assert_eq!(summary.recovered, 1);
    assert_eq!(summary.committed, 1);
    assert!(!summary.has_errors());
    assert_eq!(restarted.calls_for("db1"), vec!["recover", "commit"]);
    assert_eq!(log.unit_count(), 0);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

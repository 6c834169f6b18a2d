use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use xact_core::testing::{
    CallJournal, Latch, MockOnePhaseResource, MockRecoveryCoordinator, MockRemoteParticipant,
    MockXaResource, RecordingSynchronization,
};
use xact_core::{
    HeuristicDirection, InMemoryRecoveryLog, ResourceDescriptor, ResourceError, ResourceStatus,
    ServiceRegistry, Status, TransactionConfig, TransactionError, TransactionManager,
    TransactionState, Vote, Xid,
};

fn manager(config: TransactionConfig, log: &InMemoryRecoveryLog) -> TransactionManager {
    TransactionManager::new(config, Arc::new(log.clone()), ServiceRegistry::new()).unwrap()
}

fn descriptor(name: &str, priority: i32) -> ResourceDescriptor {
    ResourceDescriptor::new(name, "mock")
        .with_priority(priority)
        .with_recovery_key(name.as_bytes().to_vec())
}

fn enlist(tm: &TransactionManager, resource: MockXaResource, name: &str, priority: i32) {
    tm.enlist_resource(Box::new(resource), descriptor(name, priority))
        .unwrap();
}

#[test]
fn test_three_participants_commit_in_priority_order() {
    let journal = CallJournal::new();
    let log = InMemoryRecoveryLog::new();
    let tm = manager(TransactionConfig::default(), &log);

    let tx = tm.begin().unwrap();
    enlist(&tm, MockXaResource::new("orders", &journal), "orders", 3);
    enlist(&tm, MockXaResource::new("ledger", &journal), "ledger", 1);
    enlist(&tm, MockXaResource::new("audit", &journal), "audit", 2);
    let sync = Arc::new(RecordingSynchronization::new("cache", &journal));
    tm.register_synchronization(Arc::clone(&sync) as _).unwrap();

    tm.commit().unwrap();

    assert_eq!(journal.names_for("prepare"), vec!["orders", "ledger", "audit"]);
    assert_eq!(journal.names_for("commit"), vec!["ledger", "audit", "orders"]);
    assert!(tx
        .resource_statuses()
        .iter()
        .all(|(_, s)| *s == ResourceStatus::Committed));
    assert_eq!(tx.state(), TransactionState::Committed);
    assert_eq!(sync.statuses(), vec![Status::Committed]);
    assert_eq!(tm.status(), Status::NoTransaction);
    assert_eq!(log.unit_count(), 0);
}

#[test]
fn test_rollback_vote_rolls_back_everyone() {
    let journal = CallJournal::new();
    let log = InMemoryRecoveryLog::new();
    let tm = manager(TransactionConfig::default(), &log);

    let tx = tm.begin().unwrap();
    enlist(&tm, MockXaResource::new("first", &journal), "first", 0);
    enlist(
        &tm,
        MockXaResource::new("second", &journal).fail_prepare(ResourceError::rollback("deadlock")),
        "second",
        0,
    );

    let err = tm.commit().unwrap_err();
    assert!(matches!(err, TransactionError::Rollback(_)), "{err}");
    assert!(journal.names_for("commit").is_empty());
    assert!(journal.names_for("commit_one_phase").is_empty());
    assert_eq!(journal.calls_for("first"), vec!["prepare", "rollback"]);
    assert!(tx
        .resource_statuses()
        .iter()
        .all(|(_, s)| *s == ResourceStatus::RolledBack));
    assert_eq!(tx.status(), Status::RolledBack);
}

#[test]
fn test_outcome_is_atomic() {
    // Every participant ends committed, or every participant ends rolled
    // back, wherever the rollback vote comes from.
    for failing in [None, Some(0), Some(1), Some(2), Some(3)] {
        let journal = CallJournal::new();
        let tm = manager(TransactionConfig::default(), &InMemoryRecoveryLog::new());
        let tx = tm.begin().unwrap();
        for i in 0..4 {
            let name = format!("rm{i}");
            let mut resource = MockXaResource::new(&name, &journal);
            if failing == Some(i) {
                resource = resource.fail_prepare(ResourceError::rollback("no"));
            }
            enlist(&tm, resource, &name, 0);
        }

        let result = tm.commit();
        let expected = if failing.is_some() {
            assert!(result.is_err());
            ResourceStatus::RolledBack
        } else {
            result.unwrap();
            ResourceStatus::Committed
        };
        for (key, status) in tx.resource_statuses() {
            assert_eq!(status, expected, "{key} with failing={failing:?}");
        }
    }
}

#[test]
fn test_single_resource_commits_in_one_phase() {
    let journal = CallJournal::new();
    let log = InMemoryRecoveryLog::new();
    let tm = manager(TransactionConfig::default(), &log);

    tm.begin().unwrap();
    enlist(&tm, MockXaResource::new("only", &journal), "only", 0);
    assert!(tm.transaction().is_some());
    tm.commit().unwrap();

    assert_eq!(journal.calls_for("only"), vec!["commit_one_phase"]);
    assert_eq!(log.unit_count(), 0);
}

#[test]
fn test_single_resource_rollback_skips_prepare() {
    let journal = CallJournal::new();
    let tm = manager(TransactionConfig::default(), &InMemoryRecoveryLog::new());

    tm.begin().unwrap();
    enlist(&tm, MockXaResource::new("only", &journal), "only", 0);
    tm.rollback().unwrap();

    assert_eq!(journal.calls_for("only"), vec!["rollback"]);
}

#[test]
fn test_concurrent_remote_prepare_failure_rolls_back() {
    let journal = CallJournal::new();
    let tm = manager(TransactionConfig::default(), &InMemoryRecoveryLog::new());
    let remote_started = Latch::new();

    let tx = tm.begin().unwrap();
    tm.enlist_async(
        Arc::new(
            MockRemoteParticipant::new("ws", &journal)
                .signal_prepare(Arc::clone(&remote_started))
                .fail_prepare(ResourceError::rm_failed("connection reset")),
        ),
        ResourceDescriptor::new("ws", "remote"),
    )
    .unwrap();
    // The local prepare only proceeds once the remote prepare is in flight.
    enlist(
        &tm,
        MockXaResource::new("db", &journal).gate_prepare(Arc::clone(&remote_started)),
        "db",
        0,
    );

    let err = tm.commit().unwrap_err();
    assert!(matches!(err, TransactionError::Rollback(_)), "{err}");
    assert!(remote_started.is_open());
    assert_eq!(journal.calls_for("db"), vec!["prepare", "rollback"]);
    assert_eq!(journal.count("ws", "commit"), 0);
    assert_eq!(tx.state(), TransactionState::RolledBack);
}

fn commit_remote_and_local(tm: &TransactionManager, journal: &CallJournal) {
    let tx = tm.begin().unwrap();
    tm.enlist_async(
        Arc::new(MockRemoteParticipant::new("ws", journal)),
        ResourceDescriptor::new("ws", "remote"),
    )
    .unwrap();
    enlist(tm, MockXaResource::new("db", journal), "db", 0);

    tm.commit().unwrap();
    assert_eq!(tx.state(), TransactionState::Committed);
    assert_eq!(journal.calls_for("ws"), vec!["prepare", "commit"]);
    assert_eq!(journal.calls_for("db"), vec!["prepare", "commit"]);
}

#[tokio::test]
async fn test_commit_from_current_thread_runtime() {
    let journal = CallJournal::new();
    let tm = manager(TransactionConfig::default(), &InMemoryRecoveryLog::new());
    commit_remote_and_local(&tm, &journal);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_commit_from_multi_thread_runtime() {
    let journal = CallJournal::new();
    let tm = manager(TransactionConfig::default(), &InMemoryRecoveryLog::new());
    commit_remote_and_local(&tm, &journal);
}

#[test]
fn test_remote_and_local_commit_together() {
    let journal = CallJournal::new();
    let tm = manager(TransactionConfig::default(), &InMemoryRecoveryLog::new());
    commit_remote_and_local(&tm, &journal);
}

#[test]
fn test_concurrent_association_is_rejected() {
    let journal = CallJournal::new();
    let tm = manager(TransactionConfig::default(), &InMemoryRecoveryLog::new());
    let tx = tm.begin().unwrap();
    enlist(&tm, MockXaResource::new("db", &journal), "db", 0);

    std::thread::scope(|s| {
        s.spawn(|| {
            let err = tm.resume(&tx).unwrap_err();
            assert!(matches!(err, TransactionError::IllegalState(_)));
            let err = tx.add_association().unwrap_err();
            assert!(matches!(err, TransactionError::Rollback(_)));
        });
    });

    assert_eq!(tx.active_associations(), 1);
    assert!(tx.is_rollback_only());
    assert_eq!(tm.status(), Status::MarkedRollback);
    assert!(matches!(tm.commit(), Err(TransactionError::Rollback(_))));
    assert_eq!(tx.active_associations(), 0);
    assert_eq!(journal.calls_for("db"), vec!["rollback"]);
}

#[test]
fn test_association_counts_never_go_negative() {
    let tm = manager(TransactionConfig::default(), &InMemoryRecoveryLog::new());
    let tx = tm.begin().unwrap();
    let suspended = tm.suspend().unwrap();
    assert!(Arc::ptr_eq(&tx, &suspended));

    tx.remove_association();
    tx.resume_association();
    assert_eq!(tx.active_associations(), 0);
    assert_eq!(tx.suspended_associations(), 0);

    std::thread::scope(|s| {
        s.spawn(|| {
            tm.resume(&tx).unwrap();
            assert!(tm.suspend().is_some());
        });
    });
    tm.resume(&tx).unwrap();
    tm.rollback().unwrap();
}

#[test]
fn test_associations_stay_exclusive_under_contention() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 200;

    let tm = manager(TransactionConfig::default(), &InMemoryRecoveryLog::new());
    let tx = tm.begin().unwrap();
    tm.suspend().unwrap();

    let holders = AtomicU32::new(0);
    let most_holders = AtomicU32::new(0);
    std::thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..ROUNDS {
                    if tm.resume(&tx).is_err() {
                        continue;
                    }
                    let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                    most_holders.fetch_max(now, Ordering::SeqCst);
                    assert!(tx.active_associations() <= 1);
                    holders.fetch_sub(1, Ordering::SeqCst);
                    assert!(tm.suspend().is_some());
                }
            });
        }
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..ROUNDS {
                    if tx.add_association().is_ok() {
                        let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                        most_holders.fetch_max(now, Ordering::SeqCst);
                        holders.fetch_sub(1, Ordering::SeqCst);
                        tx.remove_association();
                    }
                    assert!(tx.active_associations() <= 1);
                }
            });
        }
    });

    assert_eq!(most_holders.load(Ordering::SeqCst), 1);
    assert_eq!(tx.active_associations(), 0);
    assert_eq!(tx.suspended_associations(), 0);
    tm.resume(&tx).unwrap();
    tm.rollback().unwrap();
}

#[test]
fn test_begin_rejects_nested_transaction() {
    let tm = manager(TransactionConfig::default(), &InMemoryRecoveryLog::new());
    tm.begin().unwrap();
    assert!(matches!(tm.begin(), Err(TransactionError::NotSupported(_))));
    tm.rollback().unwrap();

    tm.begin_passthrough().unwrap();
    assert!(matches!(tm.begin(), Err(TransactionError::NotSupported(_))));
    tm.end_passthrough();
    tm.begin().unwrap();
    tm.commit().unwrap();
}

#[test]
fn test_completion_without_transaction_is_illegal() {
    let tm = manager(TransactionConfig::default(), &InMemoryRecoveryLog::new());
    assert!(matches!(tm.commit(), Err(TransactionError::IllegalState(_))));
    assert!(matches!(tm.rollback(), Err(TransactionError::IllegalState(_))));
    assert!(matches!(tm.set_rollback_only(), Err(TransactionError::IllegalState(_))));
}

#[test]
fn test_failing_before_completion_rolls_back() {
    let journal = CallJournal::new();
    let tm = manager(TransactionConfig::default(), &InMemoryRecoveryLog::new());
    tm.begin().unwrap();
    enlist(&tm, MockXaResource::new("a", &journal), "a", 0);
    enlist(&tm, MockXaResource::new("b", &journal), "b", 0);
    let sync = Arc::new(RecordingSynchronization::new("validator", &journal).failing());
    tm.register_synchronization(Arc::clone(&sync) as _).unwrap();

    assert!(matches!(tm.commit(), Err(TransactionError::Rollback(_))));
    assert!(journal.names_for("prepare").is_empty());
    assert_eq!(journal.names_for("rollback"), vec!["a", "b"]);
    assert_eq!(sync.statuses(), vec![Status::RolledBack]);
}

#[test]
fn test_timeout_is_bounded_by_maximum() {
    let config = TransactionConfig::builder()
        .default_timeout(0)
        .maximum_timeout(300)
        .build()
        .unwrap();
    let tm = manager(config, &InMemoryRecoveryLog::new());

    let tx = tm.begin_with_timeout(900).unwrap();
    assert_eq!(tx.timeout(), 300);
    tm.rollback().unwrap();

    tm.set_transaction_timeout(60);
    let tx = tm.begin().unwrap();
    assert_eq!(tx.timeout(), 60);
    tm.rollback().unwrap();

    tm.set_transaction_timeout(0);
    let tx = tm.begin().unwrap();
    assert_eq!(tx.timeout(), 300);
    tm.rollback().unwrap();
}

#[test]
fn test_last_participant_commits_between_phases() {
    let journal = CallJournal::new();
    let tm = manager(TransactionConfig::default(), &InMemoryRecoveryLog::new());

    let tx = tm.begin().unwrap();
    enlist(&tm, MockXaResource::new("db", &journal), "db", 0);
    tm.enlist_one_phase(Box::new(MockOnePhaseResource::new("local", &journal)), "local", 0)
        .unwrap();
    tm.commit().unwrap();

    let calls: Vec<_> = journal
        .calls()
        .into_iter()
        .map(|(name, op)| format!("{name}:{op}"))
        .collect();
    assert_eq!(calls, vec!["db:prepare", "local:commit_one_phase", "db:commit"]);
    assert_eq!(tx.state(), TransactionState::Committed);
}

#[test]
fn test_last_participant_rollback_rolls_back_the_rest() {
    let journal = CallJournal::new();
    let tm = manager(TransactionConfig::default(), &InMemoryRecoveryLog::new());

    tm.begin().unwrap();
    enlist(&tm, MockXaResource::new("db", &journal), "db", 0);
    tm.enlist_one_phase(
        Box::new(MockOnePhaseResource::new("local", &journal).fail_commit(ResourceError::rollback("constraint"))),
        "local",
        0,
    )
    .unwrap();

    assert!(matches!(tm.commit(), Err(TransactionError::Rollback(_))));
    assert_eq!(journal.calls_for("db"), vec!["prepare", "rollback"]);
}

#[test]
fn test_unknown_last_participant_follows_commit_direction() {
    let journal = CallJournal::new();
    let config = TransactionConfig::builder()
        .direction(HeuristicDirection::Commit)
        .build()
        .unwrap();
    let log = InMemoryRecoveryLog::new();
    let tm = manager(config, &log);

    let tx = tm.begin().unwrap();
    enlist(&tm, MockXaResource::new("db", &journal), "db", 0);
    tm.enlist_one_phase(
        Box::new(MockOnePhaseResource::new("local", &journal).fail_commit(ResourceError::rm_failed("lost"))),
        "local",
        0,
    )
    .unwrap();

    assert!(matches!(tm.commit(), Err(TransactionError::HeuristicHazard(_))));
    assert_eq!(journal.calls_for("db"), vec!["prepare", "commit"]);
    assert!(tx.is_finished());
    assert_eq!(log.unit_count(), 0);
}

#[test]
fn test_second_one_phase_resource_is_rejected() {
    let journal = CallJournal::new();
    let tm = manager(TransactionConfig::default(), &InMemoryRecoveryLog::new());
    tm.begin().unwrap();
    tm.enlist_one_phase(Box::new(MockOnePhaseResource::new("a", &journal)), "a", 0)
        .unwrap();
    let err = tm
        .enlist_one_phase(Box::new(MockOnePhaseResource::new("b", &journal)), "b", 0)
        .unwrap_err();
    assert!(matches!(err, TransactionError::IllegalState(_)));
    tm.rollback().unwrap();
}

#[test]
fn test_duplicate_enlistment_is_rejected() {
    let journal = CallJournal::new();
    let tm = manager(TransactionConfig::default(), &InMemoryRecoveryLog::new());
    tm.begin().unwrap();
    enlist(&tm, MockXaResource::new("db", &journal), "db", 0);
    let err = tm
        .enlist_resource(Box::new(MockXaResource::new("db", &journal)), descriptor("db", 0))
        .unwrap_err();
    assert!(matches!(err, TransactionError::DuplicateEnlistment(_)));
    tm.rollback().unwrap();
}

#[test]
fn test_subordinate_prepares_and_commits_for_superior() {
    let journal = CallJournal::new();
    let log = InMemoryRecoveryLog::new();
    let tm = manager(TransactionConfig::default(), &log);
    let superior = MockRecoveryCoordinator::new(&journal);
    let xid = Xid::new(0x57_53, b"remote-gtrid".to_vec(), b"branch".to_vec());

    let tx = tm.import_transaction(xid.clone(), 0, "wsat", superior).unwrap();
    assert!(tx.is_subordinate());
    enlist(&tm, MockXaResource::new("a", &journal), "a", 0);
    enlist(&tm, MockXaResource::new("b", &journal), "b", 0);
    assert!(matches!(tm.commit(), Err(TransactionError::Security(_))));

    assert_eq!(tm.prepare_subordinate(&xid).unwrap(), Vote::Ok);
    assert_eq!(tx.state(), TransactionState::Prepared);
    assert_eq!(tm.status(), Status::NoTransaction);
    assert_eq!(log.unit_count(), 1);
    assert!(journal.names_for("commit").is_empty());

    tm.commit_subordinate(&xid, false).unwrap();
    assert_eq!(journal.names_for("commit"), vec!["a", "b"]);
    assert_eq!(tx.state(), TransactionState::Committed);
    assert_eq!(log.unit_count(), 0);
    assert!(matches!(
        tm.commit_subordinate(&xid, false),
        Err(TransactionError::IllegalState(_))
    ));
}

#[test]
fn test_subordinate_cannot_be_completed_directly() {
    let journal = CallJournal::new();
    let log = InMemoryRecoveryLog::new();
    let tm = manager(TransactionConfig::default(), &log);
    let xid = Xid::new(0x57_53, b"held-by-superior".to_vec(), Vec::new());

    let tx = tm
        .import_transaction(xid.clone(), 0, "wsat", MockRecoveryCoordinator::new(&journal))
        .unwrap();
    enlist(&tm, MockXaResource::new("a", &journal), "a", 0);
    enlist(&tm, MockXaResource::new("b", &journal), "b", 0);

    assert!(matches!(tx.commit(), Err(TransactionError::Security(_))));
    assert!(matches!(tx.rollback(), Err(TransactionError::Security(_))));
    assert_eq!(tx.state(), TransactionState::Active);
    assert!(journal.names_for("commit").is_empty());
    assert!(journal.names_for("rollback").is_empty());

    tm.rollback_subordinate(&xid).unwrap();
    assert_eq!(journal.names_for("rollback"), vec!["a", "b"]);
}

#[test]
fn test_outstanding_suspension_blocks_direct_completion() {
    let journal = CallJournal::new();
    let tm = manager(TransactionConfig::default(), &InMemoryRecoveryLog::new());
    let tx = tm.begin().unwrap();
    enlist(&tm, MockXaResource::new("db", &journal), "db", 0);

    tx.suspend_association();
    assert!(matches!(tx.commit(), Err(TransactionError::Security(_))));
    assert!(matches!(tx.rollback(), Err(TransactionError::Security(_))));
    assert_eq!(tx.state(), TransactionState::Active);

    tx.resume_association();
    tx.commit().unwrap();
    assert_eq!(tx.state(), TransactionState::Committed);
    assert_eq!(journal.calls_for("db"), vec!["commit_one_phase"]);
}

#[test]
fn test_read_only_subordinate_finishes_at_prepare() {
    let journal = CallJournal::new();
    let tm = manager(TransactionConfig::default(), &InMemoryRecoveryLog::new());
    let xid = Xid::new(1, b"ro".to_vec(), Vec::new());
    let tx = tm
        .import_transaction(xid.clone(), 0, "wsat", MockRecoveryCoordinator::new(&journal))
        .unwrap();
    enlist(&tm, MockXaResource::new("a", &journal).vote(Vote::ReadOnly), "a", 0);
    enlist(&tm, MockXaResource::new("b", &journal).vote(Vote::ReadOnly), "b", 0);

    assert_eq!(tm.prepare_subordinate(&xid).unwrap(), Vote::ReadOnly);
    assert!(tx.is_finished());
}

#[test]
fn test_subordinate_rollback_after_prepare() {
    let journal = CallJournal::new();
    let log = InMemoryRecoveryLog::new();
    let tm = manager(TransactionConfig::default(), &log);
    let xid = Xid::new(1, b"rb".to_vec(), Vec::new());
    tm.import_transaction(xid.clone(), 0, "wsat", MockRecoveryCoordinator::new(&journal))
        .unwrap();
    enlist(&tm, MockXaResource::new("a", &journal), "a", 0);
    enlist(&tm, MockXaResource::new("b", &journal), "b", 0);

    tm.prepare_subordinate(&xid).unwrap();
    tm.rollback_subordinate(&xid).unwrap();
    assert_eq!(journal.names_for("rollback"), vec!["a", "b"]);
    assert_eq!(log.unit_count(), 0);
}

#[test]
fn test_subordinate_forgets_heuristic_on_request() {
    let journal = CallJournal::new();
    let tm = manager(TransactionConfig::default(), &InMemoryRecoveryLog::new());
    let xid = Xid::new(1, b"heur".to_vec(), Vec::new());
    let tx = tm
        .import_transaction(xid.clone(), 0, "wsat", MockRecoveryCoordinator::new(&journal))
        .unwrap();
    enlist(
        &tm,
        MockXaResource::new("a", &journal).fail_commit(ResourceError::new(
            xact_core::XaErrorCode::HeuristicCommit,
            "committed early",
        )),
        "a",
        0,
    );
    enlist(&tm, MockXaResource::new("b", &journal), "b", 0);

    tm.prepare_subordinate(&xid).unwrap();
    tm.commit_subordinate(&xid, false).unwrap();
    assert_eq!(tx.state(), TransactionState::HeuristicOnCommit);
    assert_eq!(journal.count("a", "forget"), 0);

    tm.forget_subordinate(&xid).unwrap();
    assert_eq!(journal.count("a", "forget"), 1);
    assert_eq!(tx.state(), TransactionState::Committed);
}

#[test]
fn test_unknown_subordinate_is_illegal() {
    let tm = manager(TransactionConfig::default(), &InMemoryRecoveryLog::new());
    let xid = Xid::new(1, b"nobody".to_vec(), Vec::new());
    assert!(matches!(
        tm.prepare_subordinate(&xid),
        Err(TransactionError::IllegalState(_))
    ));
}

#[test]
fn test_after_completion_runs_once() {
    let journal = CallJournal::new();
    let tm = manager(TransactionConfig::default(), &InMemoryRecoveryLog::new());
    let tx = tm.begin().unwrap();
    let sync = Arc::new(RecordingSynchronization::new("s", &journal));
    tx.register_synchronization(Arc::clone(&sync) as _).unwrap();
    tm.rollback().unwrap();
    assert!(tx.rollback().is_err());

    assert_eq!(sync.statuses(), vec![Status::RolledBack]);
    assert_eq!(journal.count("s", "before_completion"), 0);
}

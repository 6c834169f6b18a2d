//! Restart recovery.
//!
//! Every unit left in the recovery log belongs to a transaction that was
//! interrupted after it logged its prepared participants. Recovery rebuilds
//! each one and drives it to the outcome its logged state implies:
//!
//! 1. `log.units()`
//! 2. Units with neither a state nor participant records are removed
//! 3. `Transaction::reconstruct` (participants come back through the
//!    registered factories, in PREPARED status)
//! 4. Completed by state: commit decisions are re-delivered, anything
//!    earlier is presumed aborted, subordinates ask their superior
//!
//! Transactions whose completion still needs retries stay in the context
//! and are listed by `TransactionManager::in_doubt`.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::context::TxContext;
use crate::error::TransactionError;
use crate::log::{
    RecoverableUnit, ASYNC_RESOURCE_SECTION, GLOBAL_ID_SECTION, STATE_SECTION,
    XA_RESOURCE_SECTION,
};
use crate::state::TransactionState;
use crate::transaction::Transaction;
use crate::xid::Xid;

/// What a recovery pass did.
#[derive(Debug, Default)]
pub struct RecoverySummary {
    /// Units rebuilt into transactions.
    pub recovered: usize,
    /// Recovered transactions that committed.
    pub committed: usize,
    /// Recovered transactions that rolled back.
    pub rolled_back: usize,
    /// Recovered transactions still retrying completion.
    pub in_doubt: usize,
    /// Recovered transactions waiting for an operator.
    pub manual: usize,
    /// Units removed without being recovered.
    pub dropped: usize,
    /// Units that could not be rebuilt (unit id → error message).
    pub errors: HashMap<u64, String>,
}

impl RecoverySummary {
    /// Whether any unit failed to rebuild.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Whether recovery left work outstanding.
    #[must_use]
    pub fn has_outstanding(&self) -> bool {
        self.in_doubt > 0 || self.manual > 0
    }
}

/// Rebuilds and completes the transactions found in the recovery log.
pub struct RecoveryManager<'a> {
    ctx: &'a Arc<TxContext>,
}

impl<'a> RecoveryManager<'a> {
    /// Creates a recovery manager over `ctx`.
    #[must_use]
    pub fn new(ctx: &'a Arc<TxContext>) -> Self {
        Self { ctx }
    }

    /// Runs one recovery pass.
    ///
    /// Recovery is best-effort: a unit that cannot be rebuilt is removed
    /// and reported in [`RecoverySummary::errors`] without stopping the
    /// pass. Units of transactions this context is still running are left
    /// alone.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::Log` only if the log cannot list its
    /// units.
    pub fn recover(&self) -> Result<RecoverySummary, TransactionError> {
        let units = self.ctx.log().units()?;
        info!(units = units.len(), "recovery started");

        let mut summary = RecoverySummary::default();
        for unit in units {
            if self.is_live(unit.as_ref()) {
                debug!(unit = unit.id(), "unit belongs to a running transaction; skipped");
                continue;
            }
            if !has_recoverable_data(unit.as_ref()) {
                debug!(unit = unit.id(), "unit holds nothing to recover; removing");
                self.remove(unit.id());
                summary.dropped += 1;
                continue;
            }
            self.recover_unit(unit, &mut summary);
        }

        info!(
            recovered = summary.recovered,
            committed = summary.committed,
            rolled_back = summary.rolled_back,
            in_doubt = summary.in_doubt,
            manual = summary.manual,
            dropped = summary.dropped,
            "recovery finished"
        );
        Ok(summary)
    }

    fn recover_unit(&self, unit: Arc<dyn RecoverableUnit>, summary: &mut RecoverySummary) {
        let id = unit.id();
        let tx = match Transaction::reconstruct(self.ctx, unit) {
            Ok(tx) => tx,
            Err(e) => {
                warn!(unit = id, error = %e, "cannot rebuild transaction; dropping unit");
                self.remove(id);
                summary.errors.insert(id, e.to_string());
                summary.dropped += 1;
                return;
            }
        };
        summary.recovered += 1;

        self.ctx.retain(&tx);
        tx.recover();

        if tx.is_finished() {
            match tx.state() {
                TransactionState::Committed => summary.committed += 1,
                _ => summary.rolled_back += 1,
            }
        } else if tx.needs_manual_completion() {
            summary.manual += 1;
        } else {
            summary.in_doubt += 1;
        }
    }

    fn is_live(&self, unit: &dyn RecoverableUnit) -> bool {
        unit.last_data(GLOBAL_ID_SECTION)
            .and_then(|bytes| Xid::from_bytes(&bytes).ok())
            .is_some_and(|xid| self.ctx.find(xid.gtrid()).is_some())
    }

    fn remove(&self, id: u64) {
        if let Err(e) = self.ctx.log().remove_unit(id) {
            warn!(unit = id, error = %e, "cannot remove log unit");
        }
    }
}

fn has_recoverable_data(unit: &dyn RecoverableUnit) -> bool {
    unit.has_section(STATE_SECTION)
        || unit.has_section(XA_RESOURCE_SECTION)
        || unit.has_section(ASYNC_RESOURCE_SECTION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeuristicDirection, TransactionConfig};
    use crate::log::{InMemoryRecoveryLog, RecoveryLog, RECOVERY_COORDINATOR_SECTION};
    use crate::resource::{CoordinatorRecord, RecoveryRecord};
    use crate::services::{ReplayOutcome, ServiceRegistry};
    use crate::testing::{
        CallJournal, MockCoordinatorFactory, MockRecoveryCoordinator, MockXaFactory,
    };

    struct Fixture {
        log: InMemoryRecoveryLog,
        journal: CallJournal,
        services: ServiceRegistry,
        coordinator: Arc<MockRecoveryCoordinator>,
    }

    impl Fixture {
        fn new() -> Self {
            let journal = CallJournal::new();
            let services = ServiceRegistry::new();
            services.register_xa_factory("mock", Arc::new(MockXaFactory::new(&journal)));
            let coordinator = MockRecoveryCoordinator::new(&journal);
            services.register_coordinator_factory(
                "wsat",
                Arc::new(MockCoordinatorFactory::new(&coordinator)),
            );
            Self {
                log: InMemoryRecoveryLog::new(),
                journal,
                services,
                coordinator,
            }
        }

        fn context(&self, config: TransactionConfig) -> Arc<TxContext> {
            TxContext::new(config, Arc::new(self.log.clone()), self.services.clone()).unwrap()
        }

        /// Writes a unit the way a transaction with `names` prepared would.
        fn unit(&self, gtrid: &[u8], state: Option<TransactionState>, names: &[&str]) -> u64 {
            let xid = Xid::new(0x5854, gtrid.to_vec(), Vec::new());
            let unit = self.log.create_unit().unwrap();
            unit.replace_data(GLOBAL_ID_SECTION, &xid.to_bytes()).unwrap();
            for (branch, name) in (1u32..).zip(names) {
                let record = RecoveryRecord {
                    priority: 0,
                    name: (*name).to_owned(),
                    filter: "mock".into(),
                    recovery_key: name.as_bytes().to_vec(),
                    xid: xid.branch(branch),
                };
                unit.add_data(XA_RESOURCE_SECTION, &record.to_bytes()).unwrap();
            }
            if let Some(state) = state {
                unit.replace_data(STATE_SECTION, &[state.to_byte()]).unwrap();
            }
            unit.force().unwrap();
            unit.id()
        }

        fn subordinate_unit(&self, gtrid: &[u8], names: &[&str]) -> u64 {
            let id = self.unit(gtrid, Some(TransactionState::Prepared), names);
            let record = CoordinatorRecord {
                filter: "wsat".into(),
                data: MockRecoveryCoordinator::NAME.as_bytes().to_vec(),
            };
            let unit = self
                .log
                .units()
                .unwrap()
                .into_iter()
                .find(|u| u.id() == id)
                .unwrap();
            unit.replace_data(RECOVERY_COORDINATOR_SECTION, &record.to_bytes())
                .unwrap();
            id
        }
    }

    fn config(direction: HeuristicDirection) -> TransactionConfig {
        TransactionConfig::builder()
            .direction(direction)
            .retry_interval(3600)
            .build()
            .unwrap()
    }

    #[test]
    fn test_committing_unit_is_committed() {
        let fx = Fixture::new();
        fx.unit(b"gt-1", Some(TransactionState::Committing), &["db1", "db2"]);
        let ctx = fx.context(TransactionConfig::default());

        let summary = RecoveryManager::new(&ctx).recover().unwrap();
        assert_eq!(summary.recovered, 1);
        assert_eq!(summary.committed, 1);
        assert_eq!(fx.journal.calls_for("db1"), vec!["recover", "commit"]);
        assert_eq!(fx.journal.calls_for("db2"), vec!["recover", "commit"]);
        assert_eq!(fx.log.unit_count(), 0);
        assert!(ctx.live_transactions().is_empty());
    }

    #[test]
    fn test_unit_without_state_is_presumed_aborted() {
        let fx = Fixture::new();
        fx.unit(b"gt-2", None, &["db1"]);
        let ctx = fx.context(TransactionConfig::default());

        let summary = RecoveryManager::new(&ctx).recover().unwrap();
        assert_eq!(summary.rolled_back, 1);
        assert_eq!(fx.journal.calls_for("db1"), vec!["recover", "rollback"]);
        assert_eq!(fx.log.unit_count(), 0);
    }

    #[test]
    fn test_empty_unit_is_dropped() {
        let fx = Fixture::new();
        let unit = fx.log.create_unit().unwrap();
        unit.replace_data(GLOBAL_ID_SECTION, &Xid::new(1, b"gt".to_vec(), Vec::new()).to_bytes())
            .unwrap();
        let ctx = fx.context(TransactionConfig::default());

        let summary = RecoveryManager::new(&ctx).recover().unwrap();
        assert_eq!(summary.dropped, 1);
        assert_eq!(summary.recovered, 0);
        assert_eq!(fx.log.unit_count(), 0);
    }

    #[test]
    fn test_unrebuildable_unit_is_dropped_with_error() {
        let fx = Fixture::new();
        let id = fx.unit(b"gt-3", Some(TransactionState::Committing), &["db1"]);
        let ctx = TxContext::new(
            TransactionConfig::default(),
            Arc::new(fx.log.clone()),
            ServiceRegistry::new(),
        )
        .unwrap();

        let summary = RecoveryManager::new(&ctx).recover().unwrap();
        assert_eq!(summary.dropped, 1);
        assert!(summary.has_errors());
        assert!(summary.errors.contains_key(&id));
        assert_eq!(fx.log.unit_count(), 0);
    }

    #[test]
    fn test_last_participant_follows_direction() {
        let fx = Fixture::new();
        fx.unit(b"gt-4", Some(TransactionState::LastParticipant), &["db1"]);
        let ctx = fx.context(config(HeuristicDirection::Commit));

        let summary = RecoveryManager::new(&ctx).recover().unwrap();
        assert_eq!(summary.committed, 1);
        assert_eq!(fx.journal.calls_for("db1"), vec!["recover", "commit"]);
    }

    #[test]
    fn test_manual_direction_waits_for_operator() {
        let fx = Fixture::new();
        fx.unit(b"gt-5", Some(TransactionState::LastParticipant), &["db1"]);
        let ctx = fx.context(config(HeuristicDirection::Manual));

        let summary = RecoveryManager::new(&ctx).recover().unwrap();
        assert_eq!(summary.manual, 1);
        assert!(summary.has_outstanding());
        assert_eq!(fx.log.unit_count(), 1);

        let tx = ctx.find(b"gt-5").unwrap();
        assert!(tx.needs_manual_completion());
        tx.resolve_manually(false).unwrap();
        assert!(tx.is_finished());
        assert_eq!(fx.journal.calls_for("db1"), vec!["recover", "rollback"]);
        assert_eq!(fx.log.unit_count(), 0);
    }

    #[test]
    fn test_subordinate_replays_superior_decision() {
        let fx = Fixture::new();
        fx.subordinate_unit(b"gt-6", &["db1"]);
        fx.coordinator.answer(ReplayOutcome::Committed);
        let ctx = fx.context(TransactionConfig::default());

        let summary = RecoveryManager::new(&ctx).recover().unwrap();
        assert_eq!(summary.committed, 1);
        assert_eq!(
            fx.journal.count(MockRecoveryCoordinator::NAME, "replay_completion"),
            1
        );
        assert_eq!(fx.journal.calls_for("db1"), vec!["recover", "commit"]);
    }

    #[test]
    fn test_subordinate_without_answer_stays_in_doubt() {
        let fx = Fixture::new();
        fx.subordinate_unit(b"gt-7", &["db1"]);
        let ctx = fx.context(config(HeuristicDirection::Rollback));

        let summary = RecoveryManager::new(&ctx).recover().unwrap();
        assert_eq!(summary.in_doubt, 1);
        let tx = ctx.find(b"gt-7").unwrap();
        assert!(ctx
            .timeouts()
            .is_pending(tx.id().local(), crate::timeout::TimeoutKind::InDoubt));

        fx.coordinator.answer(ReplayOutcome::RolledBack);
        tx.retry_completion();
        assert!(tx.is_finished());
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert_eq!(fx.journal.calls_for("db1"), vec!["recover", "rollback"]);
    }

    #[test]
    fn test_running_transactions_are_skipped() {
        let journal = CallJournal::new();
        let factory = MockXaFactory::new(&journal);
        factory.fail_commit_for(b"db1", crate::error::ResourceError::rm_failed("down"));
        let services = ServiceRegistry::new();
        services.register_xa_factory("mock", Arc::new(factory));
        let fx = Fixture {
            journal,
            services,
            ..Fixture::new()
        };
        fx.unit(b"gt-8", Some(TransactionState::Committing), &["db1"]);
        let ctx = fx.context(config(HeuristicDirection::Rollback));

        let first = RecoveryManager::new(&ctx).recover().unwrap();
        assert_eq!(first.in_doubt, 1);
        assert_eq!(fx.log.unit_count(), 1);

        let second = RecoveryManager::new(&ctx).recover().unwrap();
        assert_eq!(second.recovered, 0);
        assert_eq!(fx.journal.count("db1", "recover"), 1);

        ctx.find(b"gt-8").unwrap().retry_completion();
        assert_eq!(fx.journal.count("db1", "commit"), 2);
        assert_eq!(fx.log.unit_count(), 0);
    }
}

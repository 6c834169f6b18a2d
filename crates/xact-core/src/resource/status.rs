//! Participant status values and the transition table for remote votes.

use std::fmt;

use crate::resource::RecordError;

/// Status of an enlisted resource as tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceStatus {
    /// Enlisted, not yet prepared.
    Registered,
    /// Voted OK; awaiting the outcome.
    Prepared,
    /// Two-phase completion in progress.
    Completing,
    /// Selected for one-phase commit.
    CompletingOnePhase,
    /// Finished without a definite commit/rollback (read-only, forgotten).
    Completed,
    /// Committed.
    Committed,
    /// Rolled back.
    RolledBack,
    /// Heuristically committed.
    HeuristicCommit,
    /// Heuristically rolled back.
    HeuristicRollback,
    /// Heuristically mixed.
    HeuristicMixed,
    /// Outcome possibly heuristic.
    HeuristicHazard,
}

impl ResourceStatus {
    /// No further protocol messages are sent to a resource in this status,
    /// other than `forget` for heuristic ones.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Committed
                | Self::RolledBack
                | Self::HeuristicCommit
                | Self::HeuristicRollback
                | Self::HeuristicMixed
                | Self::HeuristicHazard
        )
    }

    /// Returns true for the heuristic statuses.
    #[must_use]
    pub fn is_heuristic(self) -> bool {
        matches!(
            self,
            Self::HeuristicCommit
                | Self::HeuristicRollback
                | Self::HeuristicMixed
                | Self::HeuristicHazard
        )
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Registered => "REGISTERED",
            Self::Prepared => "PREPARED",
            Self::Completing => "COMPLETING",
            Self::CompletingOnePhase => "COMPLETING_ONE_PHASE",
            Self::Completed => "COMPLETED",
            Self::Committed => "COMMITTED",
            Self::RolledBack => "ROLLEDBACK",
            Self::HeuristicCommit => "HEURISTIC_COMMIT",
            Self::HeuristicRollback => "HEURISTIC_ROLLBACK",
            Self::HeuristicMixed => "HEURISTIC_MIXED",
            Self::HeuristicHazard => "HEURISTIC_HAZARD",
        };
        f.write_str(name)
    }
}

/// Status of a remote participant, advanced by the responses it sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ParticipantStatus {
    /// Enlisted, no vote yet.
    Active = 0,
    /// Voted to commit.
    Prepared = 1,
    /// Voted read-only.
    ReadOnly = 2,
    /// Rolled back.
    Aborted = 3,
    /// Committed.
    Committed = 4,
    /// Heuristic mixed.
    HeurMixed = 5,
    /// Heuristic hazard.
    HeurHazard = 6,
    /// Heuristic commit.
    HeurCommit = 7,
    /// Heuristic rollback.
    HeurRollback = 8,
}

const T: bool = true;
const F: bool = false;

/// Legal moves, indexed `[from][to]` in declaration order.
const TRANSITIONS: [[bool; 9]; 9] = [
    //          Act Prep  RO  Abrt Cmt  HMix HHaz HCmt HRb
    /* Act  */ [F, T, F, T, T, T, F, T, F],
    /* Prep */ [F, F, T, T, T, T, T, T, T],
    /* RO   */ [F, F, F, F, F, F, F, F, F],
    /* Abrt */ [F, F, F, F, F, F, F, F, F],
    /* Cmt  */ [F, F, F, F, F, F, F, F, F],
    /* HMix */ [F, F, F, F, F, F, F, F, F],
    /* HHaz */ [F, F, F, F, F, F, F, F, F],
    /* HCmt */ [F, F, F, F, F, F, F, F, F],
    /* HRb  */ [F, F, F, F, F, F, F, F, F],
];

impl ParticipantStatus {
    /// Every status, in table order.
    pub const ALL: [ParticipantStatus; 9] = [
        Self::Active,
        Self::Prepared,
        Self::ReadOnly,
        Self::Aborted,
        Self::Committed,
        Self::HeurMixed,
        Self::HeurHazard,
        Self::HeurCommit,
        Self::HeurRollback,
    ];

    /// Whether a response moving the participant to `next` is accepted.
    #[must_use]
    pub fn can_transition_to(self, next: ParticipantStatus) -> bool {
        TRANSITIONS[self as usize][next as usize]
    }

    /// No transition leaves this status.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active | Self::Prepared)
    }
}

/// Aggregate heuristic outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeuristicOutcome {
    /// No heuristic decision was taken.
    #[default]
    None,
    /// Resources committed heuristically.
    Commit,
    /// Resources rolled back heuristically.
    Rollback,
    /// Some committed, some rolled back.
    Mixed,
    /// Outcome of some resources is unknown.
    Hazard,
}

impl HeuristicOutcome {
    /// Merges two outcomes. Contradictory definite outcomes become
    /// `Mixed`, which absorbs everything.
    #[must_use]
    pub fn combine(self, other: HeuristicOutcome) -> HeuristicOutcome {
        use HeuristicOutcome::{Commit, Hazard, Mixed, None, Rollback};
        match (self, other) {
            (None, x) | (x, None) => x,
            (Mixed, _) | (_, Mixed) | (Commit, Rollback) | (Rollback, Commit) => Mixed,
            (Hazard, _) | (_, Hazard) => Hazard,
            (Commit, Commit) => Commit,
            (Rollback, Rollback) => Rollback,
        }
    }

    /// Derives the outcome from per-resource statuses. Only meaningful if at
    /// least one status is heuristic; otherwise `None`.
    #[must_use]
    pub fn from_statuses(statuses: impl IntoIterator<Item = ResourceStatus>) -> HeuristicOutcome {
        let mut committed = false;
        let mut rolled_back = false;
        let mut mixed = false;
        let mut hazard = false;
        let mut heuristic = false;
        for status in statuses {
            match status {
                ResourceStatus::Committed => committed = true,
                ResourceStatus::RolledBack => rolled_back = true,
                ResourceStatus::HeuristicCommit => {
                    heuristic = true;
                    committed = true;
                }
                ResourceStatus::HeuristicRollback => {
                    heuristic = true;
                    rolled_back = true;
                }
                ResourceStatus::HeuristicMixed => {
                    heuristic = true;
                    mixed = true;
                }
                ResourceStatus::HeuristicHazard => {
                    heuristic = true;
                    hazard = true;
                }
                _ => {}
            }
        }
        if !heuristic {
            HeuristicOutcome::None
        } else if mixed || (committed && rolled_back) {
            HeuristicOutcome::Mixed
        } else if hazard {
            HeuristicOutcome::Hazard
        } else if rolled_back {
            HeuristicOutcome::Rollback
        } else {
            HeuristicOutcome::Commit
        }
    }

    /// Log byte.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Commit => 1,
            Self::Rollback => 2,
            Self::Mixed => 3,
            Self::Hazard => 4,
        }
    }

    /// Parses a log byte.
    ///
    /// # Errors
    ///
    /// Returns `RecordError::InvalidTag` for unknown bytes.
    pub fn from_byte(byte: u8) -> Result<Self, RecordError> {
        match byte {
            0 => Ok(Self::None),
            1 => Ok(Self::Commit),
            2 => Ok(Self::Rollback),
            3 => Ok(Self::Mixed),
            4 => Ok(Self::Hazard),
            tag => Err(RecordError::InvalidTag {
                field: "heuristic outcome",
                tag,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ParticipantStatus as P;

    fn expected(from: P, to: P) -> bool {
        match from {
            P::Active => matches!(
                to,
                P::Prepared | P::Aborted | P::Committed | P::HeurMixed | P::HeurCommit
            ),
            P::Prepared => !matches!(to, P::Active | P::Prepared),
            _ => false,
        }
    }

    #[test]
    fn test_transition_matrix_exhaustive() {
        for from in P::ALL {
            for to in P::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    expected(from, to),
                    "{from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn test_read_only_only_after_prepared() {
        assert!(!P::Active.can_transition_to(P::ReadOnly));
        assert!(P::Prepared.can_transition_to(P::ReadOnly));
    }

    #[test]
    fn test_terminal_statuses_never_move() {
        for from in P::ALL.into_iter().filter(|s| s.is_terminal()) {
            assert!(P::ALL.iter().all(|to| !from.can_transition_to(*to)));
        }
        assert!(!P::Active.is_terminal());
        assert!(!P::Prepared.is_terminal());
    }

    #[test]
    fn test_no_regression_to_active() {
        for from in P::ALL {
            assert!(!from.can_transition_to(P::Active));
        }
    }

    #[test]
    fn test_combine() {
        use HeuristicOutcome as H;
        assert_eq!(H::None.combine(H::Commit), H::Commit);
        assert_eq!(H::Commit.combine(H::Rollback), H::Mixed);
        assert_eq!(H::Hazard.combine(H::Commit), H::Hazard);
        assert_eq!(H::Hazard.combine(H::Mixed), H::Mixed);
        assert_eq!(H::Rollback.combine(H::Rollback), H::Rollback);
        assert_eq!(H::Rollback.combine(H::None), H::Rollback);
    }

    #[test]
    fn test_from_statuses() {
        use HeuristicOutcome as H;
        use ResourceStatus as R;
        assert_eq!(H::from_statuses([R::Committed, R::RolledBack]), H::None);
        assert_eq!(H::from_statuses([R::Committed, R::HeuristicRollback]), H::Mixed);
        assert_eq!(H::from_statuses([R::HeuristicRollback, R::RolledBack]), H::Rollback);
        assert_eq!(H::from_statuses([R::Committed, R::HeuristicCommit]), H::Commit);
        assert_eq!(H::from_statuses([R::Committed, R::HeuristicHazard]), H::Hazard);
        assert_eq!(H::from_statuses([R::HeuristicMixed]), H::Mixed);
    }

    #[test]
    fn test_outcome_byte() {
        for outcome in [
            HeuristicOutcome::None,
            HeuristicOutcome::Commit,
            HeuristicOutcome::Rollback,
            HeuristicOutcome::Mixed,
            HeuristicOutcome::Hazard,
        ] {
            assert_eq!(HeuristicOutcome::from_byte(outcome.to_byte()).unwrap(), outcome);
        }
        assert!(HeuristicOutcome::from_byte(42).is_err());
    }
}

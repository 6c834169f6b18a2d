//! Transaction lifecycle states.

use std::fmt;

use crate::resource::RecordError;

/// Internal lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransactionState {
    /// Not started, or rebuilt from the log before its state is restored.
    None = 0,
    /// Running.
    Active = 1,
    /// Resources are being prepared.
    Preparing = 2,
    /// Prepared; a subordinate waiting for its superior's decision.
    Prepared = 3,
    /// Decision is commit.
    Committing = 4,
    /// Decision is rollback.
    RollingBack = 5,
    /// Committed.
    Committed = 6,
    /// Rolled back.
    RolledBack = 7,
    /// A one-phase last participant is being committed.
    LastParticipant = 8,
    /// Committed with heuristic damage; waiting for forget.
    HeuristicOnCommit = 9,
    /// Rolled back with heuristic damage; waiting for forget.
    HeuristicOnRollback = 10,
}

const T: bool = true;
const F: bool = false;

/// Legal moves, indexed `[from][to]` in declaration order.
const STATE_TRANSITIONS: [[bool; 11]; 11] = [
    //           None Act  Prep Prpd Cmtg RBk  Cmtd RBd  LPS  HoC  HoR
    /* None */ [F, T, F, F, F, F, F, F, F, F, F],
    /* Act  */ [F, F, T, F, T, T, F, F, F, F, F],
    /* Prep */ [F, F, F, T, T, T, T, F, T, F, F],
    /* Prpd */ [F, F, F, F, T, T, F, F, F, F, F],
    /* Cmtg */ [F, F, F, F, F, F, T, F, F, T, F],
    /* RBk  */ [F, F, F, F, F, F, F, T, F, F, T],
    /* Cmtd */ [F, F, F, F, F, F, F, F, F, F, F],
    /* RBd  */ [F, F, F, F, F, F, F, F, F, F, F],
    /* LPS  */ [F, F, F, F, T, T, F, F, F, F, F],
    /* HoC  */ [F, F, F, F, F, F, T, F, F, F, F],
    /* HoR  */ [F, F, F, F, F, F, F, T, F, F, F],
];

impl TransactionState {
    /// Every state, in table order.
    pub const ALL: [TransactionState; 11] = [
        Self::None,
        Self::Active,
        Self::Preparing,
        Self::Prepared,
        Self::Committing,
        Self::RollingBack,
        Self::Committed,
        Self::RolledBack,
        Self::LastParticipant,
        Self::HeuristicOnCommit,
        Self::HeuristicOnRollback,
    ];

    /// Whether the state machine allows `self -> next`.
    #[must_use]
    pub fn can_transition_to(self, next: TransactionState) -> bool {
        STATE_TRANSITIONS[self as usize][next as usize]
    }

    /// Committed or rolled back.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }

    /// States that must be in the log for recovery to act correctly.
    #[must_use]
    pub fn is_logged(self) -> bool {
        matches!(
            self,
            Self::Prepared
                | Self::Committing
                | Self::RollingBack
                | Self::LastParticipant
                | Self::HeuristicOnCommit
                | Self::HeuristicOnRollback
        )
    }

    /// Log byte.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Parses a log byte.
    ///
    /// # Errors
    ///
    /// Returns `RecordError::InvalidTag` for unknown bytes.
    pub fn from_byte(byte: u8) -> Result<Self, RecordError> {
        Self::ALL
            .get(byte as usize)
            .copied()
            .ok_or(RecordError::InvalidTag {
                field: "transaction state",
                tag: byte,
            })
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::Active => "ACTIVE",
            Self::Preparing => "PREPARING",
            Self::Prepared => "PREPARED",
            Self::Committing => "COMMITTING",
            Self::RollingBack => "ROLLING_BACK",
            Self::Committed => "COMMITTED",
            Self::RolledBack => "ROLLED_BACK",
            Self::LastParticipant => "LAST_PARTICIPANT",
            Self::HeuristicOnCommit => "HEURISTIC_ON_COMMIT",
            Self::HeuristicOnRollback => "HEURISTIC_ON_ROLLBACK",
        };
        f.write_str(name)
    }
}

/// Status reported to applications and synchronizations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Running.
    Active,
    /// Running but can only roll back.
    MarkedRollback,
    /// Preparing.
    Preparing,
    /// Prepared.
    Prepared,
    /// Committing.
    Committing,
    /// Committed.
    Committed,
    /// Rolling back.
    RollingBack,
    /// Rolled back.
    RolledBack,
    /// Outcome not determinable.
    Unknown,
    /// No transaction on this thread.
    NoTransaction,
}

impl Status {
    /// Maps an internal state to the reported status.
    #[must_use]
    pub fn from_state(state: TransactionState, rollback_only: bool) -> Self {
        match state {
            TransactionState::None => Self::NoTransaction,
            TransactionState::Active if rollback_only => Self::MarkedRollback,
            TransactionState::Active => Self::Active,
            TransactionState::Preparing => Self::Preparing,
            TransactionState::Prepared => Self::Prepared,
            TransactionState::Committing | TransactionState::LastParticipant => Self::Committing,
            TransactionState::RollingBack => Self::RollingBack,
            TransactionState::Committed => Self::Committed,
            TransactionState::RolledBack => Self::RolledBack,
            TransactionState::HeuristicOnCommit | TransactionState::HeuristicOnRollback => {
                Self::Unknown
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TransactionState as S;

    #[test]
    fn test_happy_paths_are_legal() {
        let commit = [S::None, S::Active, S::Preparing, S::Committing, S::Committed];
        let rollback = [S::Active, S::Preparing, S::RollingBack, S::RolledBack];
        let subordinate = [S::Preparing, S::Prepared, S::Committing, S::HeuristicOnCommit, S::Committed];
        for path in [&commit[..], &rollback[..], &subordinate[..]] {
            for pair in path.windows(2) {
                assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
            }
        }
    }

    #[test]
    fn test_full_transition_matrix() {
        let legal = [
            (S::None, S::Active),
            (S::Active, S::Preparing),
            (S::Active, S::Committing),
            (S::Active, S::RollingBack),
            (S::Preparing, S::Prepared),
            (S::Preparing, S::Committing),
            (S::Preparing, S::RollingBack),
            (S::Preparing, S::Committed),
            (S::Preparing, S::LastParticipant),
            (S::Prepared, S::Committing),
            (S::Prepared, S::RollingBack),
            (S::Committing, S::Committed),
            (S::Committing, S::HeuristicOnCommit),
            (S::RollingBack, S::RolledBack),
            (S::RollingBack, S::HeuristicOnRollback),
            (S::LastParticipant, S::Committing),
            (S::LastParticipant, S::RollingBack),
            (S::HeuristicOnCommit, S::Committed),
            (S::HeuristicOnRollback, S::RolledBack),
        ];
        for from in S::ALL {
            for to in S::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_terminal_states_never_move() {
        for from in S::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in S::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_never_back_to_active() {
        for from in S::ALL.into_iter().filter(|s| *s != S::None) {
            assert!(!from.can_transition_to(S::Active));
        }
    }

    #[test]
    fn test_state_byte() {
        for state in S::ALL {
            assert_eq!(S::from_byte(state.to_byte()).unwrap(), state);
        }
        assert!(S::from_byte(200).is_err());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(Status::from_state(S::Active, false), Status::Active);
        assert_eq!(Status::from_state(S::Active, true), Status::MarkedRollback);
        assert_eq!(Status::from_state(S::LastParticipant, false), Status::Committing);
        assert_eq!(Status::from_state(S::HeuristicOnRollback, false), Status::Unknown);
    }
}

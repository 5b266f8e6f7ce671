//! Transaction states and lock modes shared across the coordinator.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a coordinated transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    /// Begun, no operation outstanding.
    Idle,
    /// Parked on a wait edge in the allocation graph.
    WaitingForResource,
    /// Holds the lock for its head command, awaiting the branch reply.
    WaitingForExecution,
    /// Abort broadcast in progress.
    Aborting,
    /// Aborted and released.
    Aborted,
    /// Commit votes being collected.
    Committing,
    /// Committed and released.
    Committed,
}

impl TransactionState {
    /// Check if the transaction can still accept client operations.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            TransactionState::Idle
                | TransactionState::WaitingForResource
                | TransactionState::WaitingForExecution
        )
    }

    /// Check if this is a final state.
    pub fn is_final(&self) -> bool {
        matches!(self, TransactionState::Aborted | TransactionState::Committed)
    }

    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[TransactionState] {
        match self {
            TransactionState::Idle => &[
                TransactionState::WaitingForResource,
                TransactionState::WaitingForExecution,
                TransactionState::Committing,
                TransactionState::Aborting,
            ],
            TransactionState::WaitingForResource => &[
                TransactionState::WaitingForExecution,
                TransactionState::Aborting,
            ],
            TransactionState::WaitingForExecution => {
                &[TransactionState::Idle, TransactionState::Aborting]
            }
            // A participant abort supersedes a pending commit.
            TransactionState::Committing => {
                &[TransactionState::Committed, TransactionState::Aborting]
            }
            TransactionState::Aborting => &[TransactionState::Aborted],
            TransactionState::Aborted => &[],
            TransactionState::Committed => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: TransactionState) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Idle => "idle",
            TransactionState::WaitingForResource => "waiting_for_resource",
            TransactionState::WaitingForExecution => "waiting_for_execution",
            TransactionState::Aborting => "aborting",
            TransactionState::Aborted => "aborted",
            TransactionState::Committing => "committing",
            TransactionState::Committed => "committed",
        };
        f.write_str(name)
    }
}

/// Lock mode requested on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Shared lock, any number of readers.
    Read,
    /// Exclusive lock, single writer and no readers.
    Write,
}

impl LockMode {
    /// Check if a lock held in this mode satisfies a request for `wanted`.
    pub fn covers(&self, wanted: LockMode) -> bool {
        matches!((self, wanted), (LockMode::Write, _) | (LockMode::Read, LockMode::Read))
    }

    pub fn is_write(&self) -> bool {
        matches!(self, LockMode::Write)
    }
}

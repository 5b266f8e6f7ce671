//! Live transaction state shared between a client session, the lock manager
//! and the participant reply router.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use bankcoord_common::{
    epoch_seconds, now, BankCoordError, ClientId, Result, Timestamp, TransactionId,
    TransactionState,
};
use bankcoord_protocol::{Operation, Reply};

/// Outcome of collecting commit votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitVote {
    /// Every participant answered `COMMIT OK`.
    Committed,
    /// At least one participant answered `ABORTED`, or the abort path started.
    Aborted,
}

#[derive(Debug)]
struct TransactionInner {
    state: TransactionState,
    commands: VecDeque<Operation>,
    replies: VecDeque<Reply>,
    acks_committed: usize,
    acks_aborted: usize,
}

/// A coordinated transaction.
///
/// All mutable fields sit behind one mutex that is independent of the lock
/// manager's. Every mutation wakes the tasks parked in the `wait_*` methods.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    client: ClientId,
    created_at: Timestamp,
    inner: Mutex<TransactionInner>,
    changed: Notify,
}

impl Transaction {
    /// Begin a new transaction for a client.
    pub fn begin(client: ClientId) -> Self {
        let created_at = now();
        let id = TransactionId::new(&client, &epoch_seconds(created_at));
        Self::with_id(id, client, created_at)
    }

    /// Create a transaction with an explicit id.
    pub fn with_id(id: TransactionId, client: ClientId, created_at: Timestamp) -> Self {
        Self {
            id,
            client,
            created_at,
            inner: Mutex::new(TransactionInner {
                state: TransactionState::Idle,
                commands: VecDeque::new(),
                replies: VecDeque::new(),
                acks_committed: 0,
                acks_aborted: 0,
            }),
            changed: Notify::new(),
        }
    }

    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn client(&self) -> &ClientId {
        &self.client
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    pub fn is_in_progress(&self) -> bool {
        self.state().is_in_progress()
    }

    /// Move to `next`, failing if the state machine forbids it.
    pub fn transition(&self, next: TransactionState) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if !inner.state.can_transition_to(next) {
                return Err(BankCoordError::InvalidTransition {
                    from: inner.state,
                    to: next,
                });
            }
            inner.state = next;
        }
        self.changed.notify_waiters();
        Ok(())
    }

    /// Enter `Aborting`. Returns false if the transaction is already aborting
    /// or finished, which makes repeated abort signals no-ops.
    pub fn begin_abort(&self) -> bool {
        self.transition(TransactionState::Aborting).is_ok()
    }

    /// Park on a wait edge. Only an idle transaction parks; one that is
    /// concurrently aborting keeps its state and is released by the abort.
    pub(crate) fn park(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != TransactionState::Idle {
            return false;
        }
        inner.state = TransactionState::WaitingForResource;
        true
    }

    /// Hand over a lock this transaction was waiting for.
    pub(crate) fn promote(&self) -> bool {
        let promoted = {
            let mut inner = self.inner.lock();
            if inner.state == TransactionState::WaitingForResource {
                inner.state = TransactionState::WaitingForExecution;
                true
            } else {
                false
            }
        };
        if promoted {
            self.changed.notify_waiters();
        }
        promoted
    }

    /// Append a client operation to the command queue.
    pub fn push_command(&self, op: Operation) {
        self.inner.lock().commands.push_back(op);
    }

    /// The operation at the head of the command queue.
    pub fn head_command(&self) -> Option<Operation> {
        self.inner.lock().commands.front().cloned()
    }

    /// Drop the head of the command queue once it has been answered.
    pub fn pop_command(&self) -> Option<Operation> {
        self.inner.lock().commands.pop_front()
    }

    pub fn pending_commands(&self) -> usize {
        self.inner.lock().commands.len()
    }

    /// Queue a participant reply for the session to relay.
    pub fn push_reply(&self, reply: Reply) {
        self.inner.lock().replies.push_back(reply);
        self.changed.notify_waiters();
    }

    /// Record a `COMMIT OK` vote, returning the number collected so far.
    pub fn record_commit_ack(&self) -> usize {
        let count = {
            let mut inner = self.inner.lock();
            inner.acks_committed += 1;
            inner.acks_committed
        };
        self.changed.notify_waiters();
        count
    }

    /// Record an `ABORTED` vote, returning the number collected so far.
    pub fn record_abort_ack(&self) -> usize {
        let count = {
            let mut inner = self.inner.lock();
            inner.acks_aborted += 1;
            inner.acks_aborted
        };
        self.changed.notify_waiters();
        count
    }

    /// `(acks_committed, acks_aborted)`.
    pub fn acks(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.acks_committed, inner.acks_aborted)
    }

    /// Wait for the next participant reply. Returns `None` once the
    /// transaction stops being in progress with no reply queued.
    pub async fn next_reply(&self) -> Option<Reply> {
        loop {
            let notified = self.changed.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(reply) = inner.replies.pop_front() {
                    return Some(reply);
                }
                if !inner.state.is_in_progress() {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Wait until a parked transaction is promoted. Returns false if it
    /// stopped being in progress instead.
    pub async fn wait_for_execution(&self) -> bool {
        loop {
            let notified = self.changed.notified();
            {
                let inner = self.inner.lock();
                match inner.state {
                    TransactionState::WaitingForExecution => return true,
                    state if !state.is_in_progress() => return false,
                    _ => {}
                }
            }
            notified.await;
        }
    }

    /// Wait until `expected` commit votes arrived, or any abort vote, or the
    /// abort path took over.
    pub async fn wait_for_votes(&self, expected: usize) -> CommitVote {
        loop {
            let notified = self.changed.notified();
            {
                let inner = self.inner.lock();
                if inner.acks_aborted > 0
                    || matches!(
                        inner.state,
                        TransactionState::Aborting | TransactionState::Aborted
                    )
                {
                    return CommitVote::Aborted;
                }
                if inner.acks_committed >= expected {
                    return CommitVote::Committed;
                }
            }
            notified.await;
        }
    }
}

//! Two-phase commit and abort.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use bankcoord_common::{Result, TransactionState};
use bankcoord_protocol::{BranchCommand, BranchRequest, Reply};

use crate::config::CommitConfig;
use crate::lock_manager::{LockManager, ReleaseSummary};
use crate::metrics::SharedMetrics;
use crate::participant_manager::ParticipantManager;
use crate::session::SessionRegistry;
use crate::transaction::{CommitVote, Transaction};

/// Drives commit and abort across every participant.
pub struct CommitProcessor {
    lock_manager: Arc<LockManager>,
    participants: Arc<ParticipantManager>,
    sessions: Arc<SessionRegistry>,
    metrics: SharedMetrics,
    config: CommitConfig,
}

impl CommitProcessor {
    pub fn new(
        lock_manager: Arc<LockManager>,
        participants: Arc<ParticipantManager>,
        sessions: Arc<SessionRegistry>,
        metrics: SharedMetrics,
        config: CommitConfig,
    ) -> Self {
        Self {
            lock_manager,
            participants,
            sessions,
            metrics,
            config,
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn participants(&self) -> &Arc<ParticipantManager> {
        &self.participants
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    /// Run two-phase commit for an idle transaction.
    ///
    /// Every participant must vote `COMMIT OK`. Any `ABORTED` vote, an
    /// undeliverable `COMMIT`, or an expired commit timeout hands the
    /// transaction to [`abort`](Self::abort), which replies to the client.
    #[instrument(skip_all, fields(txn_id = %txn.id()))]
    pub async fn commit(&self, txn: &Arc<Transaction>) -> Result<()> {
        txn.transition(TransactionState::Committing)?;

        let expected = self.participants.count();
        let request = BranchRequest::new(txn.id().clone(), BranchCommand::Commit);
        let delivered = self.participants.broadcast(&request).await;
        if delivered < expected {
            warn!(delivered, expected, "Commit could not reach every branch");
            self.abort(txn).await;
            return Ok(());
        }

        let vote = match self.config.commit_timeout {
            Some(limit) => match tokio::time::timeout(limit, txn.wait_for_votes(expected)).await {
                Ok(vote) => vote,
                Err(_) => {
                    warn!(timeout_ms = limit.as_millis() as u64, "Commit votes timed out");
                    CommitVote::Aborted
                }
            },
            None => txn.wait_for_votes(expected).await,
        };

        match vote {
            CommitVote::Committed => {
                if let Err(e) = txn.transition(TransactionState::Committed) {
                    debug!(error = %e, "Abort overtook commit");
                    return Ok(());
                }
                self.sessions.reply(txn.client(), &Reply::CommitOk).await;
                let summary = self.lock_manager.release(txn.id());
                self.record_release(&summary);
                self.metrics.transaction_committed();
                info!(released = summary.released.len(), "Transaction committed");
            }
            CommitVote::Aborted => self.abort(txn).await,
        }
        Ok(())
    }

    /// Abort a transaction. Repeated calls are no-ops.
    #[instrument(skip_all, fields(txn_id = %txn.id()))]
    pub async fn abort(&self, txn: &Arc<Transaction>) {
        if !txn.begin_abort() {
            return;
        }

        let request = BranchRequest::new(txn.id().clone(), BranchCommand::Abort);
        let delivered = self.participants.broadcast(&request).await;
        if delivered < self.participants.count() {
            warn!(delivered, "Abort could not reach every branch");
        }

        self.sessions.reply(txn.client(), &Reply::Aborted).await;
        let summary = self.lock_manager.release(txn.id());
        self.record_release(&summary);

        if let Err(e) = txn.transition(TransactionState::Aborted) {
            warn!(error = %e, "Unexpected state after abort");
        }
        self.metrics.transaction_aborted();
        info!(released = summary.released.len(), "Transaction aborted");
    }

    fn record_release(&self, summary: &ReleaseSummary) {
        if !summary.promoted.is_empty() {
            self.metrics.locks_promoted(summary.promoted.len() as u64);
        }
    }
}

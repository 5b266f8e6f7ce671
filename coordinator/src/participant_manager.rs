//! Participant (branch) connection management.
//!
//! Each branch link is split into a writer guarded by an async mutex, so
//! request lines never interleave, and a reader task that routes replies to
//! the transaction named in each line.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

use bankcoord_common::{BankCoordError, BranchId, Result, TransactionState};
use bankcoord_protocol::{BranchReply, BranchRequest, Reply};

use crate::commit_processor::CommitProcessor;
use crate::config::{BranchEndpoint, ParticipantConfig};
use crate::metrics::SharedMetrics;

/// Participant link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantState {
    /// Link is up.
    Connected,
    /// The branch closed the link or a write failed. Never retried.
    Disconnected,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One outbound branch link.
pub struct ParticipantHandle {
    id: BranchId,
    writer: tokio::sync::Mutex<BoxedWriter>,
    state: RwLock<ParticipantState>,
}

impl ParticipantHandle {
    fn new(id: BranchId, writer: BoxedWriter) -> Self {
        Self {
            id,
            writer: tokio::sync::Mutex::new(writer),
            state: RwLock::new(ParticipantState::Connected),
        }
    }

    pub fn id(&self) -> &BranchId {
        &self.id
    }

    pub fn state(&self) -> ParticipantState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ParticipantState::Connected
    }

    fn mark_disconnected(&self) {
        *self.state.write() = ParticipantState::Disconnected;
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(BankCoordError::BranchDisconnected(self.id.clone()));
        }

        let mut writer = self.writer.lock().await;
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            self.mark_disconnected();
            warn!(branch = %self.id, error = %e, "Write to branch failed");
            return Err(BankCoordError::BranchDisconnected(self.id.clone()));
        }
        Ok(())
    }
}

/// Manager for participant connections.
pub struct ParticipantManager {
    /// Links by branch name.
    participants: DashMap<BranchId, Arc<ParticipantHandle>>,
    metrics: SharedMetrics,
}

impl ParticipantManager {
    /// Create a new participant manager.
    pub fn new(metrics: SharedMetrics) -> Self {
        Self {
            participants: DashMap::new(),
            metrics,
        }
    }

    /// Dial every configured branch, retrying with exponential backoff.
    #[instrument(skip_all, fields(branches = config.branches.len()))]
    pub async fn connect_all(
        &self,
        config: &ParticipantConfig,
        processor: Arc<CommitProcessor>,
    ) -> Result<()> {
        for endpoint in &config.branches {
            let stream = Self::dial(endpoint, config).await?;
            self.attach(endpoint.id.clone(), stream, processor.clone());
        }
        info!(count = self.count(), "All branches connected");
        Ok(())
    }

    async fn dial(endpoint: &BranchEndpoint, config: &ParticipantConfig) -> Result<TcpStream> {
        let mut backoff = config.reconnect_backoff_base;

        for attempt in 1..=config.max_connect_attempts {
            match TcpStream::connect(&endpoint.addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    info!(branch = %endpoint.id, addr = %endpoint.addr, "Connected to branch");
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(
                        branch = %endpoint.id,
                        addr = %endpoint.addr,
                        attempt,
                        error = %e,
                        "Branch connection failed"
                    );
                    if attempt < config.max_connect_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(Duration::from_secs(10));
                    }
                }
            }
        }

        Err(BankCoordError::NetworkError(format!(
            "could not connect to branch {} at {}",
            endpoint.id, endpoint.addr
        )))
    }

    /// Attach an established link to `id`, replacing any previous one, and
    /// spawn its reply reader.
    pub fn attach<S>(&self, id: BranchId, stream: S, processor: Arc<CommitProcessor>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let handle = Arc::new(ParticipantHandle::new(id.clone(), Box::new(writer)));
        self.participants.insert(id.clone(), handle.clone());
        self.metrics
            .set_participants_active(self.connected_count() as u64);

        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        metrics.message_received();
                        route_reply(&processor, &id, &line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(branch = %id, error = %e, "Branch read failed");
                        break;
                    }
                }
            }
            handle.mark_disconnected();
            metrics.participant_disconnected();
            warn!(branch = %id, "Branch disconnected");
        });
    }

    /// Send a request to one branch.
    pub async fn send(&self, branch: &BranchId, request: &BranchRequest) -> Result<()> {
        let handle = self
            .participants
            .get(branch)
            .map(|h| h.clone())
            .ok_or_else(|| BankCoordError::UnknownBranch(branch.clone()))?;

        handle.write_line(&request.to_string()).await?;
        self.metrics.message_sent();
        debug!(branch = %branch, request = %request, "Sent to branch");
        Ok(())
    }

    /// Send a request to every branch. Returns how many received it.
    pub async fn broadcast(&self, request: &BranchRequest) -> usize {
        let handles: Vec<Arc<ParticipantHandle>> =
            self.participants.iter().map(|e| e.value().clone()).collect();
        let line = request.to_string();

        let results = join_all(handles.iter().map(|h| h.write_line(&line))).await;
        let delivered = results.iter().filter(|r| r.is_ok()).count();
        for _ in 0..delivered {
            self.metrics.message_sent();
        }
        debug!(request = %request, delivered, total = handles.len(), "Broadcast to branches");
        delivered
    }

    /// Whether a branch is known.
    pub fn contains(&self, branch: &BranchId) -> bool {
        self.participants.contains_key(branch)
    }

    pub fn state(&self, branch: &BranchId) -> Option<ParticipantState> {
        self.participants.get(branch).map(|h| h.state())
    }

    /// Number of attached branches, connected or not.
    pub fn count(&self) -> usize {
        self.participants.len()
    }

    pub fn connected_count(&self) -> usize {
        self.participants
            .iter()
            .filter(|e| e.value().is_connected())
            .count()
    }
}

fn route_reply(processor: &Arc<CommitProcessor>, branch: &BranchId, line: &str) {
    let reply: BranchReply = match line.parse() {
        Ok(reply) => reply,
        Err(e) => {
            warn!(branch = %branch, line, error = %e, "Malformed branch reply");
            return;
        }
    };

    let Some(txn) = processor.lock_manager().get(&reply.txn_id) else {
        debug!(branch = %branch, txn_id = %reply.txn_id, "Reply for unknown transaction");
        return;
    };

    match reply.reply {
        Reply::CommitOk => {
            let votes = txn.record_commit_ack();
            debug!(branch = %branch, txn_id = %reply.txn_id, votes, "Commit vote");
        }
        Reply::Aborted => {
            txn.record_abort_ack();
            debug!(branch = %branch, txn_id = %reply.txn_id, "Abort vote");
            if txn.state() != TransactionState::Aborting {
                let processor = processor.clone();
                tokio::spawn(async move { processor.abort(&txn).await });
            }
        }
        other => txn.push_reply(other),
    }
}

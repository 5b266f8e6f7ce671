//! Core coordinator implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

use bankcoord_common::{BankCoordError, BranchId, ClientId, Result};

use crate::commit_processor::CommitProcessor;
use crate::config::CoordinatorConfig;
use crate::lock_manager::LockManager;
use crate::metrics::{Metrics, MetricsSnapshot, SharedMetrics};
use crate::participant_manager::ParticipantManager;
use crate::session::{self, SessionRegistry};
use crate::state::CoordinatorState;

/// The transaction coordinator: owns the lock manager, the branch links and
/// the client sessions.
pub struct Coordinator {
    /// Configuration.
    config: CoordinatorConfig,
    /// Node ID for this coordinator instance.
    node_id: String,
    /// Current coordinator state.
    state: Arc<RwLock<CoordinatorState>>,
    /// Lock manager and transaction registry.
    lock_manager: Arc<LockManager>,
    /// Branch links.
    participant_manager: Arc<ParticipantManager>,
    /// Connected clients.
    sessions: Arc<SessionRegistry>,
    /// Commit and abort.
    processor: Arc<CommitProcessor>,
    metrics: SharedMetrics,
    /// Bound client listener, taken by `serve`.
    listener: Mutex<Option<TcpListener>>,
    /// Shutdown signal sender.
    shutdown_tx: mpsc::Sender<()>,
    /// Shutdown signal receiver.
    shutdown_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Coordinator {
    /// Create a new coordinator instance.
    pub fn new(config: CoordinatorConfig, node_id: String) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let metrics = Arc::new(Metrics::new());
        let lock_manager = Arc::new(LockManager::new());
        let participant_manager = Arc::new(ParticipantManager::new(metrics.clone()));
        let sessions = Arc::new(SessionRegistry::new(metrics.clone()));
        let processor = Arc::new(CommitProcessor::new(
            lock_manager.clone(),
            participant_manager.clone(),
            sessions.clone(),
            metrics.clone(),
            config.commit_config.clone(),
        ));

        Self {
            config,
            node_id,
            state: Arc::new(RwLock::new(CoordinatorState::Starting)),
            lock_manager,
            participant_manager,
            sessions,
            processor,
            metrics,
            listener: Mutex::new(None),
            shutdown_tx,
            shutdown_rx: Mutex::new(Some(shutdown_rx)),
        }
    }

    /// Dial every configured branch.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn connect_participants(&self) -> Result<()> {
        self.participant_manager
            .connect_all(&self.config.participant_config, self.processor.clone())
            .await
    }

    /// Attach an already established branch link.
    pub fn attach_participant<S>(&self, id: BranchId, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.participant_manager
            .attach(id, stream, self.processor.clone());
    }

    /// Bind the client listener and start accepting. Branches must already
    /// be attached. Returns the bound address.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn start(&self) -> Result<SocketAddr> {
        info!("Starting coordinator");

        if self.participant_manager.count() == 0 {
            return Err(BankCoordError::ConfigurationError(
                "no branches attached".to_string(),
            ));
        }

        let addr = format!("{}:{}", self.config.listen_addr, self.config.listen_port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        *self.listener.lock() = Some(listener);

        *self.state.write() = CoordinatorState::Running;

        info!(
            addr = %local_addr,
            granularity = ?self.config.lock_config.granularity,
            branches = self.participant_manager.count(),
            "Coordinator started successfully"
        );
        Ok(local_addr)
    }

    /// Accept clients until `stop` is called.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or(BankCoordError::NotRunning)?;
        let mut shutdown_rx = self
            .shutdown_rx
            .lock()
            .take()
            .ok_or(BankCoordError::NotRunning)?;

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    if !self.state().accepts_clients() {
                        warn!(peer = %peer, "Refusing client, coordinator not running");
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    let processor = self.processor.clone();
                    let granularity = self.config.lock_config.granularity;
                    tokio::spawn(session::serve(
                        stream,
                        ClientId::new(peer.to_string()),
                        processor,
                        granularity,
                    ));
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        info!(node_id = %self.node_id, "Accept loop stopped");
        Ok(())
    }

    /// Start and serve: the binary's main loop.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.connect_participants().await?;
        self.start().await?;
        self.serve().await
    }

    /// Stop accepting clients.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn stop(&self) -> Result<()> {
        if self.state().is_terminal() {
            return Ok(());
        }
        info!("Stopping coordinator");

        *self.state.write() = CoordinatorState::ShuttingDown;

        // Signal shutdown to the accept loop
        let _ = self.shutdown_tx.send(()).await;

        if self.config.metrics_enabled {
            info!(metrics = %self.metrics.snapshot().to_json(), "Final metrics");
        }

        *self.state.write() = CoordinatorState::Stopped;

        info!("Coordinator stopped");
        Ok(())
    }

    /// Get the current coordinator state.
    pub fn state(&self) -> CoordinatorState {
        *self.state.read()
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn participant_manager(&self) -> &Arc<ParticipantManager> {
        &self.participant_manager
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.sessions.count()
    }

    /// Number of transactions in the registry.
    pub fn active_transaction_count(&self) -> usize {
        self.lock_manager.active_transaction_count()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Metrics in Prometheus text format.
    pub fn metrics_prometheus(&self) -> String {
        self.metrics.to_prometheus()
    }
}

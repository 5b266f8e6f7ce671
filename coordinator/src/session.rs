//! Client sessions.
//!
//! A session is a reader task that parses client lines into a queue and a
//! dispatcher that drains the queue one command at a time. `ABORT` and
//! end-of-stream skip the queue so a client blocked on a lock can still
//! give up.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use bankcoord_common::{ClientId, Result, TransactionState};
use bankcoord_protocol::{BranchRequest, ClientCommand, Operation, Reply};

use crate::commit_processor::CommitProcessor;
use crate::config::LockGranularity;
use crate::lock_manager::LockOutcome;
use crate::metrics::SharedMetrics;
use crate::transaction::Transaction;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of a client connection.
pub struct ClientHandle {
    id: ClientId,
    writer: tokio::sync::Mutex<BoxedWriter>,
    metrics: SharedMetrics,
}

impl ClientHandle {
    fn new(id: ClientId, writer: BoxedWriter, metrics: SharedMetrics) -> Self {
        Self {
            id,
            writer: tokio::sync::Mutex::new(writer),
            metrics,
        }
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Write one reply line.
    pub async fn send(&self, reply: &Reply) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(format!("{}\n", reply).as_bytes()).await?;
        writer.flush().await?;
        self.metrics.message_sent();
        debug!(client = %self.id, reply = %reply, "Replied to client");
        Ok(())
    }
}

/// Connected clients, for replies that originate outside a session.
pub struct SessionRegistry {
    clients: DashMap<ClientId, Arc<ClientHandle>>,
    metrics: SharedMetrics,
}

impl SessionRegistry {
    pub fn new(metrics: SharedMetrics) -> Self {
        Self {
            clients: DashMap::new(),
            metrics,
        }
    }

    /// Register the write side of a client connection.
    pub fn register_writer(&self, id: ClientId, writer: BoxedWriter) -> Arc<ClientHandle> {
        let handle = Arc::new(ClientHandle::new(id.clone(), writer, self.metrics.clone()));
        self.clients.insert(id, handle.clone());
        handle
    }

    pub fn unregister(&self, id: &ClientId) {
        self.clients.remove(id);
    }

    pub fn get(&self, id: &ClientId) -> Option<Arc<ClientHandle>> {
        self.clients.get(id).map(|h| h.clone())
    }

    /// Send a reply to a client if it is still connected.
    pub async fn reply(&self, id: &ClientId, reply: &Reply) {
        let Some(handle) = self.get(id) else {
            debug!(client = %id, reply = %reply, "Client gone, reply dropped");
            return;
        };
        if let Err(e) = handle.send(reply).await {
            debug!(client = %id, error = %e, "Reply to client failed");
        }
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }
}

/// Per-connection command state.
struct Session {
    client: ClientId,
    handle: Arc<ClientHandle>,
    processor: Arc<CommitProcessor>,
    granularity: LockGranularity,
    current: Mutex<Option<Arc<Transaction>>>,
    queue: Mutex<VecDeque<ClientCommand>>,
    queued: Notify,
    closed: AtomicBool,
}

/// Serve one client connection until it closes.
#[instrument(skip_all, fields(client = %client))]
pub async fn serve<S>(
    stream: S,
    client: ClientId,
    processor: Arc<CommitProcessor>,
    granularity: LockGranularity,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let handle = processor
        .sessions()
        .register_writer(client.clone(), Box::new(writer));
    processor.metrics().client_connected();
    info!("Client connected");

    let session = Arc::new(Session {
        client: client.clone(),
        handle,
        processor: processor.clone(),
        granularity,
        current: Mutex::new(None),
        queue: Mutex::new(VecDeque::new()),
        queued: Notify::new(),
        closed: AtomicBool::new(false),
    });

    let dispatcher = {
        let session = session.clone();
        tokio::spawn(async move { session.dispatch_loop().await })
    };

    session.read_loop(reader).await;
    session.close();
    if let Err(e) = dispatcher.await {
        warn!(error = %e, "Dispatcher task failed");
    }

    processor.sessions().unregister(&client);
    processor.metrics().client_disconnected();
    info!("Client disconnected");
}

impl Session {
    async fn read_loop<R>(&self, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Client read failed");
                    break;
                }
            };
            self.processor.metrics().message_received();

            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<ClientCommand>() {
                Ok(ClientCommand::Abort) => self.on_abort(),
                Ok(command) => self.enqueue(command),
                Err(e) => warn!(line = %line, error = %e, "Ignoring malformed command"),
            }
        }

        // A vanished client gives up whatever it was doing.
        self.queue.lock().clear();
        self.abort_current();
    }

    fn enqueue(&self, command: ClientCommand) {
        self.queue.lock().push_back(command);
        self.queued.notify_waiters();
    }

    /// `ABORT` from the client. An in-progress transaction is aborted right
    /// away, dropping the commands queued before the next `BEGIN`. With
    /// nothing in progress the abort belongs to a queued `BEGIN`, if any, and
    /// waits its turn behind it.
    fn on_abort(&self) {
        let mut queue = self.queue.lock();
        if self.active_transaction().is_some() {
            let next_begin = queue
                .iter()
                .position(|c| matches!(c, ClientCommand::Begin))
                .unwrap_or(queue.len());
            let dropped = queue.drain(..next_begin).count();
            drop(queue);
            debug!(dropped, "Queued commands dropped by ABORT");
            self.abort_current();
        } else if queue.iter().any(|c| matches!(c, ClientCommand::Begin)) {
            queue.push_back(ClientCommand::Abort);
            drop(queue);
            self.queued.notify_waiters();
        } else {
            debug!("ABORT without a transaction in progress");
        }
    }

    fn abort_current(&self) {
        let Some(txn) = self.active_transaction() else {
            debug!("ABORT without a transaction in progress");
            return;
        };
        let processor = self.processor.clone();
        tokio::spawn(async move { processor.abort(&txn).await });
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.queued.notify_waiters();
    }

    fn active_transaction(&self) -> Option<Arc<Transaction>> {
        self.current
            .lock()
            .as_ref()
            .filter(|txn| txn.is_in_progress())
            .cloned()
    }

    async fn next_command(&self) -> Option<ClientCommand> {
        loop {
            let notified = self.queued.notified();
            let command = self.queue.lock().pop_front();
            if command.is_some() {
                return command;
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    async fn dispatch_loop(&self) {
        while let Some(command) = self.next_command().await {
            match command {
                ClientCommand::Begin => self.begin(),
                ClientCommand::Commit => self.commit().await,
                ClientCommand::Abort => {
                    if let Some(txn) = self.active_transaction() {
                        self.processor.abort(&txn).await;
                    }
                }
                ClientCommand::Operation(op) => self.execute(op).await,
            }
        }

        // A transaction begun after the reader gave up has nobody to finish it.
        if let Some(txn) = self.active_transaction() {
            self.processor.abort(&txn).await;
        }
    }

    fn begin(&self) {
        let mut current = self.current.lock();
        if let Some(txn) = current.as_ref().filter(|txn| txn.is_in_progress()) {
            warn!(txn_id = %txn.id(), "BEGIN ignored, transaction already in progress");
            return;
        }

        let txn = Arc::new(Transaction::begin(self.client.clone()));
        self.processor.lock_manager().register(txn.clone());
        self.processor.metrics().transaction_begun();
        info!(txn_id = %txn.id(), "Transaction begun");
        *current = Some(txn);
    }

    async fn commit(&self) {
        let Some(txn) = self.active_transaction() else {
            debug!("COMMIT without a transaction in progress");
            return;
        };
        if txn.state() != TransactionState::Idle {
            return;
        }
        if let Err(e) = self.processor.commit(&txn).await {
            debug!(txn_id = %txn.id(), error = %e, "Commit did not start");
        }
    }

    /// Lock, dispatch and relay one operation.
    async fn execute(&self, op: Operation) {
        let Some(txn) = self.active_transaction() else {
            debug!(operation = %op, "Operation without a transaction, dropped");
            return;
        };
        let processor = &self.processor;
        let metrics = processor.metrics();

        txn.push_command(op);
        debug!(txn_id = %txn.id(), pending = txn.pending_commands(), "Operation queued");
        let Some(op) = txn.head_command() else {
            return;
        };
        let resource = self.granularity.resource_for(op.account());

        match processor
            .lock_manager()
            .try_lock(&txn, &resource, op.lock_mode())
        {
            Ok(LockOutcome::Granted) => {
                metrics.lock_granted();
                if txn.transition(TransactionState::WaitingForExecution).is_err() {
                    return;
                }
            }
            Ok(LockOutcome::Waiting) => {
                metrics.lock_waited();
                if !txn.wait_for_execution().await {
                    return;
                }
            }
            Ok(LockOutcome::Deadlock) => {
                metrics.deadlock_detected();
                warn!(txn_id = %txn.id(), resource = %resource, "Deadlock, aborting requester");
                processor.abort(&txn).await;
                return;
            }
            Err(e) => {
                debug!(txn_id = %txn.id(), error = %e, "Transaction released before locking");
                return;
            }
        }

        let branch = &op.account().branch;
        let request = BranchRequest::operation(txn.id().clone(), op.clone());
        if let Err(e) = processor.participants().send(branch, &request).await {
            warn!(txn_id = %txn.id(), branch = %branch, error = %e, "Dispatch failed, aborting");
            processor.abort(&txn).await;
            return;
        }

        let Some(reply) = txn.next_reply().await else {
            return;
        };
        if let Err(e) = self.handle.send(&reply).await {
            debug!(error = %e, "Reply to client failed");
        }
        txn.pop_command();
        let _ = txn.transition(TransactionState::Idle);
    }
}

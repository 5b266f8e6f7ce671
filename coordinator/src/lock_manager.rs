//! Read/write locking with online deadlock detection.
//!
//! The allocation graph, the per-resource counters and the transaction
//! registry live in one table behind one mutex. Every `try_lock` and
//! `release` is a single critical section; the only lock taken while it is
//! held is a transaction's own mutex.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use bankcoord_common::{BankCoordError, LockMode, ResourceId, Result, TransactionId};

use crate::rag::{NodeKey, ResourceAllocationGraph};
use crate::transaction::Transaction;

/// Result of a lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The lock is held; the operation may run.
    Granted,
    /// A wait edge was added; the transaction is parked.
    Waiting,
    /// Waiting would close a cycle. Nothing was recorded.
    Deadlock,
}

/// Holder counters of one resource.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResourceCounters {
    pub active_readers: usize,
    pub active_writers: usize,
}

impl ResourceCounters {
    fn grant(&mut self, mode: LockMode) {
        match mode {
            LockMode::Read => self.active_readers += 1,
            LockMode::Write => self.active_writers += 1,
        }
    }

    fn revoke(&mut self, mode: LockMode) {
        match mode {
            LockMode::Read => self.active_readers = self.active_readers.saturating_sub(1),
            LockMode::Write => self.active_writers = self.active_writers.saturating_sub(1),
        }
    }
}

/// What a release did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReleaseSummary {
    /// Resources the transaction held.
    pub released: Vec<ResourceId>,
    /// Wait edges dropped.
    pub abandoned_waits: usize,
    /// Transactions granted a lock as a result, in grant order.
    pub promoted: Vec<TransactionId>,
}

#[derive(Debug, Default)]
struct LockTable {
    graph: ResourceAllocationGraph,
    resources: HashMap<ResourceId, ResourceCounters>,
    transactions: HashMap<TransactionId, Arc<Transaction>>,
}

impl LockTable {
    fn ensure_resource(&mut self, resource: &ResourceId) {
        if !self.resources.contains_key(resource) {
            self.resources.insert(resource.clone(), ResourceCounters::default());
            self.graph.add_resource(resource);
        }
    }

    fn counters(&mut self, resource: &ResourceId) -> &mut ResourceCounters {
        self.resources.entry(resource.clone()).or_default()
    }

    /// Hand a free resource to its next waiter: a single writer, or every
    /// queued reader at once. Writers queued behind readers keep waiting.
    fn promote_waiters(&mut self, resource: &ResourceId, promoted: &mut Vec<TransactionId>) {
        let waiters = self.graph.waiters(resource);
        let Some(first) = waiters.first() else {
            return;
        };

        let grants: Vec<(TransactionId, LockMode)> = if first.mode.is_write() {
            waiters.iter().take(1).filter_map(edge_txn).collect()
        } else {
            waiters
                .iter()
                .filter(|e| !e.mode.is_write())
                .filter_map(edge_txn)
                .collect()
        };

        let resource_key = NodeKey::Resource(resource.clone());
        for (txn_id, mode) in grants {
            self.graph
                .remove_edge(&NodeKey::Transaction(txn_id.clone()), &resource_key);
            self.graph.add_grant_edge(resource, &txn_id, mode);
            self.counters(resource).grant(mode);

            if let Some(txn) = self.transactions.get(&txn_id) {
                txn.promote();
            }
            debug!(txn_id = %txn_id, resource = %resource, mode = ?mode, "Lock promoted");
            promoted.push(txn_id);
        }
    }
}

fn edge_txn(edge: &crate::rag::Edge) -> Option<(TransactionId, LockMode)> {
    match &edge.node {
        NodeKey::Transaction(id) => Some((id.clone(), edge.mode)),
        NodeKey::Resource(_) => None,
    }
}

/// Lock manager and transaction registry.
#[derive(Debug, Default)]
pub struct LockManager {
    table: Mutex<LockTable>,
}

impl LockManager {
    /// Create a new lock manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live transaction.
    pub fn register(&self, txn: Arc<Transaction>) {
        let mut table = self.table.lock();
        table.graph.add_transaction(txn.id());
        table.transactions.insert(txn.id().clone(), txn);
    }

    /// Look up a registered transaction.
    pub fn get(&self, id: &TransactionId) -> Option<Arc<Transaction>> {
        self.table.lock().transactions.get(id).cloned()
    }

    pub fn is_registered(&self, id: &TransactionId) -> bool {
        self.table.lock().transactions.contains_key(id)
    }

    pub fn active_transaction_count(&self) -> usize {
        self.table.lock().transactions.len()
    }

    /// Try to lock `resource` in `mode` for `txn`.
    ///
    /// A transaction holding a read lock that asks for write first gives up
    /// its read lock and then queues like any other writer, so a writer that
    /// was already waiting may be served first.
    pub fn try_lock(
        &self,
        txn: &Transaction,
        resource: &ResourceId,
        mode: LockMode,
    ) -> Result<LockOutcome> {
        let mut guard = self.table.lock();
        let table = &mut *guard;
        let txn_id = txn.id();

        if !table.transactions.contains_key(txn_id) {
            return Err(BankCoordError::TransactionNotFound(txn_id.clone()));
        }
        table.ensure_resource(resource);

        let txn_key = NodeKey::Transaction(txn_id.clone());
        let resource_key = NodeKey::Resource(resource.clone());

        match table.graph.held_mode(txn_id, resource) {
            Some(held) if held.covers(mode) => return Ok(LockOutcome::Granted),
            Some(held) => {
                table.graph.remove_edge(&resource_key, &txn_key);
                table.counters(resource).revoke(held);
                debug!(txn_id = %txn_id, resource = %resource, "Upgrading read lock");
            }
            None => {}
        }

        let free = match mode {
            LockMode::Read => table.counters(resource).active_writers == 0,
            LockMode::Write => table.graph.holders(resource).is_empty(),
        };

        if free {
            table.graph.add_grant_edge(resource, txn_id, mode);
            table.counters(resource).grant(mode);
            debug!(txn_id = %txn_id, resource = %resource, mode = ?mode, "Lock granted");
            return Ok(LockOutcome::Granted);
        }

        table.graph.add_wait_edge(txn_id, resource, mode);
        if table.graph.has_cycle(&txn_key, &resource_key) {
            table.graph.remove_edge(&txn_key, &resource_key);
            info!(txn_id = %txn_id, resource = %resource, "Deadlock detected");
            return Ok(LockOutcome::Deadlock);
        }

        txn.park();
        debug!(txn_id = %txn_id, resource = %resource, mode = ?mode, "Waiting for lock");
        Ok(LockOutcome::Waiting)
    }

    /// Release everything `txn_id` holds or waits for, promote waiters on the
    /// freed resources, and forget the transaction. Unknown ids are a no-op.
    pub fn release(&self, txn_id: &TransactionId) -> ReleaseSummary {
        let mut guard = self.table.lock();
        let table = &mut *guard;
        let mut summary = ReleaseSummary::default();

        if table.transactions.remove(txn_id).is_none() {
            return summary;
        }
        let txn_key = NodeKey::Transaction(txn_id.clone());

        let waits: Vec<NodeKey> = table
            .graph
            .waiting_on(txn_id)
            .iter()
            .map(|e| e.node.clone())
            .collect();
        for resource_key in waits {
            table.graph.remove_edge(&txn_key, &resource_key);
            summary.abandoned_waits += 1;
        }

        let held: Vec<(ResourceId, LockMode)> = table
            .graph
            .held_by(txn_id)
            .iter()
            .filter_map(|e| match &e.node {
                NodeKey::Resource(r) => Some((r.clone(), e.mode)),
                NodeKey::Transaction(_) => None,
            })
            .collect();

        for (resource, mode) in held {
            table
                .graph
                .remove_edge(&NodeKey::Resource(resource.clone()), &txn_key);
            table.counters(&resource).revoke(mode);

            if table.graph.holders(&resource).is_empty() {
                table.promote_waiters(&resource, &mut summary.promoted);
            }
            summary.released.push(resource);
        }

        table.graph.remove_transaction(txn_id);

        debug!(
            txn_id = %txn_id,
            released = summary.released.len(),
            promoted = summary.promoted.len(),
            "Transaction released"
        );
        summary
    }

    /// Current holders of a resource.
    pub fn holders(&self, resource: &ResourceId) -> Vec<(TransactionId, LockMode)> {
        let table = self.table.lock();
        table
            .graph
            .holders(resource)
            .iter()
            .filter_map(edge_txn)
            .collect()
    }

    /// Transactions queued on a resource, oldest first.
    pub fn waiters(&self, resource: &ResourceId) -> Vec<(TransactionId, LockMode)> {
        let table = self.table.lock();
        table
            .graph
            .waiters(resource)
            .iter()
            .filter_map(edge_txn)
            .collect()
    }

    /// Resources held by a transaction.
    pub fn held_resources(&self, txn_id: &TransactionId) -> Vec<ResourceId> {
        let table = self.table.lock();
        table
            .graph
            .held_by(txn_id)
            .iter()
            .filter_map(|e| match &e.node {
                NodeKey::Resource(r) => Some(r.clone()),
                NodeKey::Transaction(_) => None,
            })
            .collect()
    }

    pub fn resource_counters(&self, resource: &ResourceId) -> Option<ResourceCounters> {
        self.table.lock().resources.get(resource).copied()
    }

    pub fn resource_count(&self) -> usize {
        self.table.lock().resources.len()
    }

    /// `(nodes, edges)` of the allocation graph.
    pub fn graph_size(&self) -> (usize, usize) {
        let table = self.table.lock();
        (table.graph.node_count(), table.graph.edge_count())
    }
}

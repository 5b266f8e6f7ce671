//! In-memory account ledger with per-transaction undo.
//!
//! Operations apply to balances immediately. Each transaction keeps the
//! operations it applied, newest last, and the accounts it touched, so an
//! abort or a failed commit can replay them in reverse.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, info};

use bankcoord_common::{AccountId, TransactionId};
use bankcoord_protocol::{BranchCommand, BranchRequest, Operation, Reply};

#[derive(Debug, Default)]
struct PendingTransaction {
    undo: Vec<Operation>,
    touched: HashSet<AccountId>,
}

#[derive(Debug, Default)]
struct LedgerInner {
    balances: HashMap<AccountId, Decimal>,
    pending: HashMap<TransactionId, PendingTransaction>,
}

impl LedgerInner {
    fn adjust(&mut self, account: &AccountId, delta: Decimal) {
        *self.balances.entry(account.clone()).or_default() += delta;
    }

    fn roll_back(&mut self, txn_id: &TransactionId) -> usize {
        let Some(pending) = self.pending.remove(txn_id) else {
            return 0;
        };
        for op in pending.undo.iter().rev() {
            match op {
                Operation::Deposit { account, amount } => self.adjust(account, -*amount),
                Operation::Withdraw { account, amount } => self.adjust(account, *amount),
                Operation::Balance { .. } => {}
            }
        }
        pending.undo.len()
    }
}

/// Account balances of one branch.
#[derive(Debug, Default)]
pub struct Ledger {
    inner: Mutex<LedgerInner>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Execute one request and produce its reply.
    pub fn apply(&self, request: &BranchRequest) -> Reply {
        let txn_id = &request.txn_id;
        match &request.command {
            BranchCommand::Operation(op) => self.execute(txn_id, op),
            BranchCommand::Commit => self.commit(txn_id),
            BranchCommand::Abort => self.abort(txn_id),
        }
    }

    fn execute(&self, txn_id: &TransactionId, op: &Operation) -> Reply {
        let mut inner = self.inner.lock();
        match op {
            Operation::Balance { account } => Reply::Balance {
                account: account.clone(),
                value: inner.balances.get(account).copied().unwrap_or_default(),
            },
            Operation::Deposit { account, amount } | Operation::Withdraw { account, amount } => {
                let delta = match op {
                    Operation::Withdraw { .. } => -*amount,
                    _ => *amount,
                };
                inner.adjust(account, delta);

                let pending = inner.pending.entry(txn_id.clone()).or_default();
                pending.touched.insert(account.clone());
                pending.undo.push(op.clone());
                debug!(txn_id = %txn_id, operation = %op, "Applied");
                Reply::Ok
            }
        }
    }

    /// Vote on a transaction: `COMMIT OK` if no account it touched is
    /// negative, otherwise roll it back and vote `ABORTED`.
    fn commit(&self, txn_id: &TransactionId) -> Reply {
        let mut inner = self.inner.lock();
        let overdrawn = inner.pending.get(txn_id).and_then(|pending| {
            pending
                .touched
                .iter()
                .find(|account| {
                    inner.balances.get(*account).copied().unwrap_or_default() < Decimal::ZERO
                })
                .cloned()
        });

        match overdrawn {
            Some(account) => {
                let undone = inner.roll_back(txn_id);
                info!(txn_id = %txn_id, account = %account, undone, "Commit refused, balance negative");
                Reply::Aborted
            }
            None => {
                inner.pending.remove(txn_id);
                debug!(txn_id = %txn_id, "Committed");
                Reply::CommitOk
            }
        }
    }

    fn abort(&self, txn_id: &TransactionId) -> Reply {
        let undone = self.inner.lock().roll_back(txn_id);
        debug!(txn_id = %txn_id, undone, "Rolled back");
        Reply::Aborted
    }

    /// Current balance; unknown accounts read as zero.
    pub fn balance(&self, account: &AccountId) -> Decimal {
        self.inner
            .lock()
            .balances
            .get(account)
            .copied()
            .unwrap_or_default()
    }

    /// Transactions with uncommitted changes.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(line: &str) -> BranchRequest {
        line.parse().unwrap()
    }

    fn account(s: &str) -> AccountId {
        AccountId::parse(s).unwrap()
    }

    #[test]
    fn test_deposit_then_commit() {
        let ledger = Ledger::new();
        assert_eq!(ledger.apply(&request("t1 DEPOSIT A.foo 100")), Reply::Ok);
        assert_eq!(ledger.apply(&request("t1 COMMIT")), Reply::CommitOk);
        assert_eq!(ledger.balance(&account("A.foo")), Decimal::from(100));
        assert_eq!(ledger.pending_count(), 0);
    }

    #[test]
    fn test_unknown_account_reads_zero() {
        let ledger = Ledger::new();
        assert_eq!(
            ledger.apply(&request("t1 BALANCE A.nobody")),
            Reply::Balance {
                account: account("A.nobody"),
                value: Decimal::ZERO
            }
        );
    }

    #[test]
    fn test_negative_balance_refuses_commit() {
        let ledger = Ledger::new();
        ledger.apply(&request("t0 DEPOSIT A.foo 10"));
        ledger.apply(&request("t0 COMMIT"));

        assert_eq!(ledger.apply(&request("t1 WITHDRAW A.foo 50")), Reply::Ok);
        assert_eq!(ledger.balance(&account("A.foo")), Decimal::from(-40));
        assert_eq!(ledger.apply(&request("t1 COMMIT")), Reply::Aborted);
        assert_eq!(ledger.balance(&account("A.foo")), Decimal::from(10));
    }

    #[test]
    fn test_abort_rolls_back_in_reverse() {
        let ledger = Ledger::new();
        ledger.apply(&request("t1 DEPOSIT A.foo 5"));
        ledger.apply(&request("t1 WITHDRAW A.foo 2"));
        ledger.apply(&request("t1 DEPOSIT A.bar 1.5"));
        assert_eq!(ledger.apply(&request("t1 ABORT")), Reply::Aborted);
        assert_eq!(ledger.balance(&account("A.foo")), Decimal::ZERO);
        assert_eq!(ledger.balance(&account("A.bar")), Decimal::ZERO);

        // Nothing left to undo.
        assert_eq!(ledger.apply(&request("t1 ABORT")), Reply::Aborted);
    }

    #[test]
    fn test_commit_of_untouched_transaction() {
        let ledger = Ledger::new();
        assert_eq!(ledger.apply(&request("t9 COMMIT")), Reply::CommitOk);
    }

    #[test]
    fn test_other_transactions_unaffected() {
        let ledger = Ledger::new();
        ledger.apply(&request("t1 DEPOSIT A.foo 7"));
        ledger.apply(&request("t2 DEPOSIT A.bar 3"));
        ledger.apply(&request("t2 ABORT"));
        ledger.apply(&request("t1 COMMIT"));
        assert_eq!(ledger.balance(&account("A.foo")), Decimal::from(7));
        assert_eq!(ledger.balance(&account("A.bar")), Decimal::ZERO);
    }
}

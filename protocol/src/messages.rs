//! Protocol message types.
//!
//! Every message is a single line of whitespace-separated tokens. Parsing is
//! strict about token counts and amounts; callers decide whether a malformed
//! line is dropped or fatal.

use std::fmt;
use std::str::FromStr;

use bankcoord_common::{AccountId, BankCoordError, LockMode, Result, TransactionId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

fn invalid(message: impl Into<String>, field: &str) -> BankCoordError {
    BankCoordError::InvalidMessage {
        message: message.into(),
        field: Some(field.to_string()),
    }
}

fn parse_amount(token: &str) -> Result<Decimal> {
    let amount = Decimal::from_str(token)
        .map_err(|_| invalid(format!("amount {:?} is not a number", token), "amount"))?;
    if amount.is_sign_negative() {
        return Err(invalid(format!("amount {} is negative", amount), "amount"));
    }
    Ok(amount)
}

/// An account operation executed at the owning branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Deposit { account: AccountId, amount: Decimal },
    Withdraw { account: AccountId, amount: Decimal },
    Balance { account: AccountId },
}

impl Operation {
    /// The account the operation touches.
    pub fn account(&self) -> &AccountId {
        match self {
            Operation::Deposit { account, .. }
            | Operation::Withdraw { account, .. }
            | Operation::Balance { account } => account,
        }
    }

    /// Lock mode the coordinator must hold before dispatching.
    pub fn lock_mode(&self) -> LockMode {
        match self {
            Operation::Balance { .. } => LockMode::Read,
            Operation::Deposit { .. } | Operation::Withdraw { .. } => LockMode::Write,
        }
    }

    /// Parse an operation from its tokens, or `Ok(None)` if the verb is not an
    /// operation verb.
    fn from_tokens(verb: &str, args: &[&str]) -> Result<Option<Self>> {
        let op = match (verb, args) {
            ("DEPOSIT", [account, amount]) => Operation::Deposit {
                account: AccountId::parse(account)?,
                amount: parse_amount(amount)?,
            },
            ("WITHDRAW", [account, amount]) => Operation::Withdraw {
                account: AccountId::parse(account)?,
                amount: parse_amount(amount)?,
            },
            ("BALANCE", [account]) => Operation::Balance {
                account: AccountId::parse(account)?,
            },
            ("DEPOSIT" | "WITHDRAW" | "BALANCE", _) => {
                return Err(invalid(
                    format!("{} takes the wrong number of arguments", verb),
                    "arguments",
                ))
            }
            _ => return Ok(None),
        };
        Ok(Some(op))
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Deposit { account, amount } => write!(f, "DEPOSIT {} {}", account, amount),
            Operation::Withdraw { account, amount } => write!(f, "WITHDRAW {} {}", account, amount),
            Operation::Balance { account } => write!(f, "BALANCE {}", account),
        }
    }
}

/// Command sent by a client to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientCommand {
    Begin,
    Commit,
    Abort,
    Operation(Operation),
}

impl FromStr for ClientCommand {
    type Err = BankCoordError;

    fn from_str(line: &str) -> Result<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let (verb, args) = tokens
            .split_first()
            .ok_or_else(|| invalid("empty command", "verb"))?;

        match (*verb, args) {
            ("BEGIN", []) => Ok(ClientCommand::Begin),
            ("COMMIT", []) => Ok(ClientCommand::Commit),
            ("ABORT", []) => Ok(ClientCommand::Abort),
            (verb, args) => Operation::from_tokens(verb, args)?
                .map(ClientCommand::Operation)
                .ok_or_else(|| invalid(format!("unrecognised command {:?}", line), "verb")),
        }
    }
}

impl fmt::Display for ClientCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientCommand::Begin => f.write_str("BEGIN"),
            ClientCommand::Commit => f.write_str("COMMIT"),
            ClientCommand::Abort => f.write_str("ABORT"),
            ClientCommand::Operation(op) => op.fmt(f),
        }
    }
}

/// Reply line. Branches send it prefixed by a transaction id; the
/// coordinator relays it to clients without the prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Ok,
    CommitOk,
    Aborted,
    Balance { account: AccountId, value: Decimal },
}

impl FromStr for Reply {
    type Err = BankCoordError;

    fn from_str(line: &str) -> Result<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["OK"] => Ok(Reply::Ok),
            ["COMMIT", "OK"] => Ok(Reply::CommitOk),
            ["ABORTED"] => Ok(Reply::Aborted),
            [account, "=", value] => Ok(Reply::Balance {
                account: AccountId::parse(account)?,
                value: Decimal::from_str(value)
                    .map_err(|_| invalid(format!("balance {:?} is not a number", value), "value"))?,
            }),
            _ => Err(invalid(format!("unrecognised reply {:?}", line), "reply")),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok => f.write_str("OK"),
            Reply::CommitOk => f.write_str("COMMIT OK"),
            Reply::Aborted => f.write_str("ABORTED"),
            Reply::Balance { account, value } => write!(f, "{} = {}", account, value),
        }
    }
}

/// Instruction body sent from the coordinator to a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchCommand {
    Operation(Operation),
    Commit,
    Abort,
}

/// `<txnId> <command>` sent from the coordinator to a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRequest {
    pub txn_id: TransactionId,
    pub command: BranchCommand,
}

impl BranchRequest {
    pub fn new(txn_id: TransactionId, command: BranchCommand) -> Self {
        Self { txn_id, command }
    }

    pub fn operation(txn_id: TransactionId, op: Operation) -> Self {
        Self::new(txn_id, BranchCommand::Operation(op))
    }
}

impl FromStr for BranchRequest {
    type Err = BankCoordError;

    fn from_str(line: &str) -> Result<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let (id, rest) = tokens
            .split_first()
            .ok_or_else(|| invalid("empty request", "transaction_id"))?;
        let txn_id = TransactionId::parse(id)?;

        let command = match rest {
            ["COMMIT"] => BranchCommand::Commit,
            ["ABORT"] => BranchCommand::Abort,
            [verb, args @ ..] => Operation::from_tokens(verb, args)?
                .map(BranchCommand::Operation)
                .ok_or_else(|| invalid(format!("unrecognised request {:?}", line), "verb"))?,
            [] => return Err(invalid("request has no command", "verb")),
        };

        Ok(Self { txn_id, command })
    }
}

impl fmt::Display for BranchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.command {
            BranchCommand::Operation(op) => write!(f, "{} {}", self.txn_id, op),
            BranchCommand::Commit => write!(f, "{} COMMIT", self.txn_id),
            BranchCommand::Abort => write!(f, "{} ABORT", self.txn_id),
        }
    }
}

/// `<txnId> <reply>` sent from a branch to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchReply {
    pub txn_id: TransactionId,
    pub reply: Reply,
}

impl BranchReply {
    pub fn new(txn_id: TransactionId, reply: Reply) -> Self {
        Self { txn_id, reply }
    }
}

impl FromStr for BranchReply {
    type Err = BankCoordError;

    fn from_str(line: &str) -> Result<Self> {
        let (id, rest) = line
            .trim()
            .split_once(' ')
            .ok_or_else(|| invalid(format!("reply {:?} has no body", line), "reply"))?;
        Ok(Self {
            txn_id: TransactionId::parse(id)?,
            reply: rest.parse()?,
        })
    }
}

impl fmt::Display for BranchReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.txn_id, self.reply)
    }
}

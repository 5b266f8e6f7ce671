//! Identifier types for coordinator entities.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BankCoordError, Result};

/// Identifier of a connected client.
///
/// The coordinator derives it from the peer address of the client connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    /// Create a new client ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of a transaction: `<clientId>-<creationTimestamp>`.
///
/// Transaction ids prefix every coordinator/branch message, so they never
/// contain whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(String);

impl TransactionId {
    /// Create a transaction ID for a client at the given creation timestamp.
    pub fn new(client: &ClientId, created_at: &str) -> Self {
        Self(format!("{}-{}", client, created_at))
    }

    /// Parse a transaction ID received on the wire.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() || s.chars().any(char::is_whitespace) {
            return Err(BankCoordError::InvalidMessage {
                message: format!("malformed transaction id {:?}", s),
                field: Some("transaction_id".to_string()),
            });
        }
        Ok(Self(s.to_string()))
    }

    /// Get the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a branch (participant) owning a disjoint set of accounts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchId(String);

impl BranchId {
    /// Create a new branch ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validate the branch ID format.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= 64
            && self.0.chars().all(|c| c.is_alphanumeric() || c == '_')
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BranchId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// An account name of the form `<branch>.<local>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId {
    /// The branch that owns this account.
    pub branch: BranchId,
    /// Account name within the branch.
    pub local: String,
}

impl AccountId {
    /// Create a new account ID.
    pub fn new(branch: BranchId, local: impl Into<String>) -> Self {
        Self {
            branch,
            local: local.into(),
        }
    }

    /// Parse `<branch>.<local>`.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = |message: String| BankCoordError::InvalidMessage {
            message,
            field: Some("account".to_string()),
        };

        let (branch, local) = s
            .split_once('.')
            .ok_or_else(|| invalid(format!("account {:?} has no branch prefix", s)))?;

        let branch = BranchId::new(branch);
        if !branch.is_valid() {
            return Err(invalid(format!("account {:?} has an invalid branch prefix", s)));
        }
        if local.is_empty() || local.chars().any(char::is_whitespace) {
            return Err(invalid(format!("account {:?} has an invalid local name", s)));
        }

        Ok(Self::new(branch, local))
    }

    /// Create a canonical string representation.
    pub fn canonical(&self) -> String {
        format!("{}.{}", self.branch, self.local)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.branch, self.local)
    }
}

/// Key of a lockable resource in the allocation graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(String);

impl ResourceId {
    /// Create a resource ID from a raw key.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Resource covering every account of a branch.
    pub fn branch(branch: &BranchId) -> Self {
        Self(branch.as_str().to_string())
    }

    /// Resource covering a single account.
    pub fn account(account: &AccountId) -> Self {
        Self(account.canonical())
    }

    /// Get the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

//! Coordinator configuration.

use std::time::Duration;

use bankcoord_common::{AccountId, BranchId, ResourceId};

/// What a lock in the allocation graph covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockGranularity {
    /// One resource per branch: every account of `A` maps to resource `A`.
    #[default]
    Branch,
    /// One resource per account: `A.foo` and `A.bar` lock independently.
    Account,
}

impl LockGranularity {
    /// Resource key guarding an account.
    pub fn resource_for(&self, account: &AccountId) -> ResourceId {
        match self {
            LockGranularity::Branch => ResourceId::branch(&account.branch),
            LockGranularity::Account => ResourceId::account(account),
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "branch" => Some(LockGranularity::Branch),
            "account" => Some(LockGranularity::Account),
            _ => None,
        }
    }
}

/// Lock configuration.
#[derive(Debug, Clone, Default)]
pub struct LockConfig {
    /// Resource granularity.
    pub granularity: LockGranularity,
}

/// Address of one branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchEndpoint {
    /// Branch name, the account namespace prefix.
    pub id: BranchId,
    /// `host:port` to dial.
    pub addr: String,
}

impl BranchEndpoint {
    pub fn new(id: impl Into<BranchId>, addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
        }
    }
}

/// Parse `A=host:port,B=host:port`.
pub fn parse_branches(spec: &str) -> Result<Vec<BranchEndpoint>, String> {
    spec.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, addr) = entry
                .split_once('=')
                .ok_or_else(|| format!("Branch entry {:?} is not NAME=ADDR", entry))?;
            Ok(BranchEndpoint::new(BranchId::new(id.trim()), addr.trim()))
        })
        .collect()
}

/// Participant (branch) link configuration.
#[derive(Debug, Clone)]
pub struct ParticipantConfig {
    /// Branches to connect to at startup.
    pub branches: Vec<BranchEndpoint>,
    /// Maximum connection attempts per branch.
    pub max_connect_attempts: usize,
    /// Connection backoff base, doubled on each attempt.
    pub reconnect_backoff_base: Duration,
}

impl Default for ParticipantConfig {
    fn default() -> Self {
        let branches = ["A", "B", "C", "D", "E"]
            .iter()
            .zip(5001u16..)
            .map(|(id, port)| BranchEndpoint::new(*id, format!("127.0.0.1:{}", port)))
            .collect();

        Self {
            branches,
            max_connect_attempts: 10,
            reconnect_backoff_base: Duration::from_millis(200),
        }
    }
}

/// Two-phase commit configuration.
#[derive(Debug, Clone, Default)]
pub struct CommitConfig {
    /// Abort a commit whose votes are not all in after this long.
    /// `None` waits indefinitely.
    pub commit_timeout: Option<Duration>,
}

/// Main coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Node ID used in logs.
    pub node_id: Option<String>,
    /// Listen address for clients.
    pub listen_addr: String,
    /// Listen port for clients. `0` picks an ephemeral port.
    pub listen_port: u16,
    /// Lock configuration.
    pub lock_config: LockConfig,
    /// Participant configuration.
    pub participant_config: ParticipantConfig,
    /// Commit configuration.
    pub commit_config: CommitConfig,
    /// Log metrics snapshots on shutdown.
    pub metrics_enabled: bool,
    /// Log level.
    pub log_level: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            listen_addr: "0.0.0.0".to_string(),
            listen_port: 4999,
            lock_config: LockConfig::default(),
            participant_config: ParticipantConfig::default(),
            commit_config: CommitConfig::default(),
            metrics_enabled: true,
            log_level: "info".to_string(),
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default();

        if let Ok(id) = std::env::var("COORDINATOR_NODE_ID") {
            config.node_id = Some(id);
        }

        if let Ok(addr) = std::env::var("COORDINATOR_LISTEN_ADDR") {
            config.listen_addr = addr;
        }

        if let Ok(port) = std::env::var("COORDINATOR_LISTEN_PORT") {
            if let Ok(port) = port.parse() {
                config.listen_port = port;
            }
        }

        if let Ok(branches) = std::env::var("COORDINATOR_BRANCHES") {
            config.participant_config.branches = parse_branches(&branches)?;
        }

        if let Ok(granularity) = std::env::var("COORDINATOR_LOCK_GRANULARITY") {
            config.lock_config.granularity = LockGranularity::parse(&granularity)
                .ok_or_else(|| format!("Unknown lock granularity {:?}", granularity))?;
        }

        if let Ok(ms) = std::env::var("COORDINATOR_COMMIT_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                config.commit_config.commit_timeout = Some(Duration::from_millis(ms));
            }
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.listen_addr.is_empty() {
            return Err("Listen address cannot be empty".to_string());
        }

        let branches = &self.participant_config.branches;
        if branches.is_empty() {
            return Err("At least one branch must be configured".to_string());
        }

        for (i, branch) in branches.iter().enumerate() {
            if !branch.id.is_valid() {
                return Err(format!("Invalid branch name {:?}", branch.id.as_str()));
            }
            if branches[..i].iter().any(|b| b.id == branch.id) {
                return Err(format!("Branch {} configured twice", branch.id));
            }
        }

        if self.participant_config.max_connect_attempts == 0 {
            return Err("Max connect attempts cannot be 0".to_string());
        }

        if self.commit_config.commit_timeout == Some(Duration::ZERO) {
            return Err("Commit timeout cannot be zero".to_string());
        }

        Ok(())
    }
}

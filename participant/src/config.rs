//! Branch configuration.

use bankcoord_common::BranchId;

/// Configuration for a branch server.
#[derive(Debug, Clone)]
pub struct BranchConfig {
    /// Branch name, used in logs.
    pub branch_id: BranchId,
    /// Listen address for the coordinator.
    pub listen_addr: String,
    /// Listen port. `0` picks an ephemeral port.
    pub listen_port: u16,
    /// Log level.
    pub log_level: String,
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            branch_id: BranchId::new("A"),
            listen_addr: "0.0.0.0".to_string(),
            listen_port: 5001,
            log_level: "info".to_string(),
        }
    }
}

impl BranchConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(id) = std::env::var("BRANCH_ID") {
            config.branch_id = BranchId::new(id);
        }

        if let Ok(addr) = std::env::var("BRANCH_LISTEN_ADDR") {
            config.listen_addr = addr;
        }

        if let Ok(port) = std::env::var("BRANCH_LISTEN_PORT") {
            if let Ok(port) = port.parse() {
                config.listen_port = port;
            }
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// `addr:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if !self.branch_id.is_valid() {
            return Err(format!("Invalid branch name {:?}", self.branch_id.as_str()));
        }

        if self.listen_addr.is_empty() {
            return Err("Listen address cannot be empty".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BranchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_addr(), "0.0.0.0:5001");
    }

    #[test]
    fn test_invalid_branch_name() {
        let config = BranchConfig {
            branch_id: BranchId::new("no.dots"),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}

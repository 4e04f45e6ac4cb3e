// config.rs - Configuration management for rust-pppac
//
// This module handles loading, parsing, and validating configuration for the
// access concentrator. All settings are consumed once at startup; there is no
// live reload.

use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// RADIUS client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadiusConfig {
    /// Authentication server as host:port (default: 127.0.0.1:1812)
    #[serde(default = "default_auth_server")]
    pub auth_server: String,

    /// Accounting server as host:port (default: 127.0.0.1:1813)
    #[serde(default = "default_acct_server")]
    pub acct_server: String,

    /// Shared secret between this NAS and the servers
    pub secret: String,

    /// Maximum datagrams sent per request, including the first (default: 3)
    #[serde(default = "default_max_try")]
    pub max_try: u32,

    /// Seconds to wait for a reply before retransmitting (default: 3)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Log every packet exchanged with the servers (default: false)
    #[serde(default)]
    pub verbose: bool,

    /// Value for the NAS-Identifier attribute, if any
    pub nas_identifier: Option<String>,

    /// Value for the NAS-IP-Address attribute, if any
    pub nas_ip_address: Option<Ipv4Addr>,

    /// Path to the attribute dictionary (default: dictionary)
    #[serde(default = "default_dictionary")]
    pub dictionary: PathBuf,
}

/// IPCP negotiation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcpConfig {
    /// Consecutive Configure-Requests before the layer is declined (default: 10)
    #[serde(default = "default_max_configure")]
    pub max_configure: u32,

    /// Consecutive Configure-Naks before downgrading to Reject (default: 5)
    #[serde(default = "default_max_failure")]
    pub max_failure: u32,

    /// Seconds between restart-timer fires while converging (default: 3)
    #[serde(default = "default_restart")]
    pub restart_secs: u64,
}

/// Address pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Local address assigned to every session on our side of the link
    pub gateway: Ipv4Addr,

    /// First peer address handed out, inclusive
    pub first: Ipv4Addr,

    /// Last peer address handed out, inclusive
    pub last: Ipv4Addr,
}

/// Kernel interface programming policy
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IfaceConfig {
    /// Treat ioctl failures during programming as fatal to the session
    /// (default: false, log and continue)
    #[serde(default)]
    pub fatal_errors: bool,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// RADIUS client settings
    pub radius: RadiusConfig,

    /// IPCP negotiation counters and timers
    #[serde(default)]
    pub ipcp: IpcpConfig,

    /// Peer address pool
    pub pool: PoolConfig,

    /// Interface programming policy
    #[serde(default)]
    pub iface: IfaceConfig,
}

impl Default for IpcpConfig {
    fn default() -> Self {
        Self {
            max_configure: default_max_configure(),
            max_failure: default_max_failure(),
            restart_secs: default_restart(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.radius.secret.is_empty() {
            return Err(Error::Config("radius.secret must not be empty".into()));
        }
        if self.radius.max_try == 0 {
            return Err(Error::Config("radius.max_try must be at least 1".into()));
        }
        if u32::from(self.pool.first) > u32::from(self.pool.last) {
            return Err(Error::Config("pool.first must not exceed pool.last".into()));
        }
        Ok(())
    }
}

fn default_auth_server() -> String {
    "127.0.0.1:1812".to_string()
}

fn default_acct_server() -> String {
    "127.0.0.1:1813".to_string()
}

fn default_max_try() -> u32 {
    3
}

fn default_timeout() -> u64 {
    3
}

fn default_dictionary() -> PathBuf {
    PathBuf::from("dictionary")
}

fn default_max_configure() -> u32 {
    10
}

fn default_max_failure() -> u32 {
    5
}

fn default_restart() -> u64 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [radius]
        secret = "testing123"

        [pool]
        gateway = "10.0.0.1"
        first = "10.0.0.2"
        last = "10.0.0.254"
    "#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.radius.auth_server, "127.0.0.1:1812");
        assert_eq!(config.radius.max_try, 3);
        assert_eq!(config.radius.timeout_secs, 3);
        assert_eq!(config.ipcp.max_configure, 10);
        assert_eq!(config.ipcp.max_failure, 5);
        assert!(!config.iface.fatal_errors);
    }

    #[test]
    fn inverted_pool_range_is_rejected() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.pool.first = Ipv4Addr::new(10, 0, 1, 0);
        config.pool.last = Ipv4Addr::new(10, 0, 0, 9);
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_secret_is_rejected() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.radius.secret.clear();
        assert!(config.validate().is_err());
    }
}

//! Daemon configuration: loaded from a TOML file at startup and reloaded
//! whenever the controller notices the file's mtime change.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LbdError, Result};
use crate::types::Parameters;

/// Threshold above which the master's heartbeat is considered stale and a
/// standby daemon should take over DNS updates. Matches the Go source's
/// hard-coded 600-second window in `shouldUpdateDNS`.
pub const MASTER_TAKEOVER_THRESHOLD_SECS: u64 = 600;

/// Top-level configuration, loaded from `--config`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Hostname of the node considered "master" for heartbeat purposes.
    pub master: String,

    /// URL the master heartbeat is published at and all daemons poll.
    pub heartbeat_url: String,

    /// Path the heartbeat line is appended to before being renamed into
    /// place (mirrors the Go source's temp-file-then-rename pattern).
    #[serde(default = "default_heartbeat_path")]
    pub heartbeat_path: PathBuf,

    /// Final heartbeat file name, atomically replaced on each write.
    #[serde(default = "default_heartbeat_file")]
    pub heartbeat_file: PathBuf,

    /// Host carrying out dynamic DNS updates.
    pub dns_manager: String,

    /// TSIG key used to sign internal-network updates.
    pub tsig_internal_key: TsigKey,

    /// TSIG key used to sign externally-visible updates, when any cluster
    /// has `external = true`.
    #[serde(default)]
    pub tsig_external_key: Option<TsigKey>,

    /// Per-alias cluster definitions, keyed by DNS name.
    pub clusters: HashMap<String, ClusterEntry>,
}

fn default_heartbeat_path() -> PathBuf {
    PathBuf::from("/var/run/lbd")
}

fn default_heartbeat_file() -> PathBuf {
    PathBuf::from("/var/run/lbd/heartbeat")
}

/// One cluster's members and tunables as they appear in the config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterEntry {
    pub hosts: Vec<String>,
    pub load_balancing_username: String,
    pub load_balancing_password: String,
    #[serde(flatten)]
    pub parameters: Parameters,
}

/// A TSIG key name/secret pair, base64-encoded secret as it appears on
/// disk.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TsigKey {
    pub name: String,
    pub secret_base64: String,
}

impl Config {
    /// Parse a config file from disk. Errors are wrapped as
    /// `LbdError::Config` so callers never need to match on `toml::de::Error`
    /// directly.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| LbdError::Config(format!("reading {}: {e}", path.display())))?;
        toml::from_str(&contents)
            .map_err(|e| LbdError::Config(format!("parsing {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml = r#"
            master = "lb01.example.org"
            heartbeat_url = "http://lb01.example.org/heartbeat"
            dns_manager = "dns01.example.org"

            [tsig_internal_key]
            name = "internal-key"
            secret_base64 = "c2VjcmV0"

            [clusters.myalias]
            hosts = ["node1.example.org", "node2.example.org"]
            load_balancing_username = "lbuser"
            load_balancing_password = "lbpass"
            metric = "minimum"
        "#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.master, "lb01.example.org");
        let cluster = &cfg.clusters["myalias"];
        assert_eq!(cluster.hosts.len(), 2);
        assert_eq!(cluster.parameters.best_hosts, -1);
        assert_eq!(cluster.parameters.effective_ttl(), 60);
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let err = Config::load("/nonexistent/path/lbd.toml").unwrap_err();
        assert_eq!(err.kind(), "config");
    }
}

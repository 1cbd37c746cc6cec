//! Daemon-wide error type.

use thiserror::Error;

/// Errors that can occur while running `lbd`.
#[derive(Error, Debug)]
pub enum LbdError {
    #[error("config error: {0}")]
    Config(String),

    #[error("DNS resolution failed for {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("SNMP session error against {ip}: {0}", ip = .ip)]
    Snmp { ip: std::net::IpAddr, message: String },

    #[error("no usable hosts for cluster {cluster}, skipping DNS update")]
    EmptyUsefulSet { cluster: String },

    #[error("unknown metric {0:?} for cluster {1}")]
    UnknownMetric(String, String),

    #[error("DNS read failed for {name}: {source}")]
    DnsRead {
        name: String,
        #[source]
        source: hickory_client::error::ClientError,
    },

    #[error("DNS update failed for {name}: {source}")]
    DnsUpdate {
        name: String,
        #[source]
        source: hickory_client::error::ClientError,
    },

    #[error("heartbeat fetch failed: {0}")]
    HeartbeatFetch(#[from] reqwest::Error),

    #[error("heartbeat write failed: {0}")]
    HeartbeatWrite(#[from] std::io::Error),
}

impl LbdError {
    /// Short tag for metrics labeling.
    pub fn kind(&self) -> &'static str {
        match self {
            LbdError::Config(_) => "config",
            LbdError::Resolve { .. } => "resolve",
            LbdError::Snmp { .. } => "snmp",
            LbdError::EmptyUsefulSet { .. } => "empty_useful_set",
            LbdError::UnknownMetric(..) => "unknown_metric",
            LbdError::DnsRead { .. } => "dns_read",
            LbdError::DnsUpdate { .. } => "dns_update",
            LbdError::HeartbeatFetch(_) => "heartbeat_fetch",
            LbdError::HeartbeatWrite(_) => "heartbeat_write",
        }
    }
}

pub type Result<T> = std::result::Result<T, LbdError>;

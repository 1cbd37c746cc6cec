//! lbd - DNS-based load-balancing daemon.
//!
//! Probes the members of one or more clusters over SNMPv3, selects the
//! healthiest subset per cluster according to its configured metric policy,
//! and republishes that subset as the A/AAAA records of a DNS alias via
//! RFC 2136 dynamic update.
//!
//! # Modules
//!
//! - **config**: on-disk TOML configuration and its typed representation
//! - **types**: core data model (clusters, hosts, transport results)
//! - **host_probe**: hostname resolution and SNMPv3 probing
//! - **evaluator**: metric-driven best-host selection
//! - **dns_updater**: TSIG-signed dynamic DNS update
//! - **master_elector**: heartbeat-based standby/master arbitration
//! - **controller**: the event loop tying the above together
//! - **metrics**: observability facade
//! - **error**: daemon-wide error type

pub mod config;
pub mod controller;
pub mod dns_updater;
pub mod error;
pub mod evaluator;
pub mod host_probe;
pub mod master_elector;
pub mod metrics;
pub mod types;

pub use config::Config;
pub use controller::Controller;
pub use dns_updater::DnsUpdater;
pub use error::{LbdError, Result};
pub use evaluator::ClusterEvaluator;
pub use host_probe::HostProbe;
pub use master_elector::MasterElector;
pub use types::{Cluster, Host, Metric, Parameters};

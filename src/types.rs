//! Core data model: clusters, per-host probe state, and the tagged SNMP
//! response type used in place of the Go source's `interface{}` + runtime
//! type switch.

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Load value returned when a host could not be evaluated at all.
pub const WORST_LOAD: i64 = 99_999;

/// Sentinel stored in a fresh `TransportResult` before an SNMP reply
/// overwrites it; distinguishes "never got a reply" from "replied with 0".
pub const UNSET_RESPONSE: i64 = 100_000;

/// Starting accumulator for `load_for_alias`'s fold; lower than any load a
/// real transport can report, so the first transport to answer always wins.
pub const MISSING_LOAD: i64 = -200;

/// Value of an SNMP GetRequest response, tagged by the shape the agent
/// actually returned. The Go source inspects this with a runtime type
/// switch over `interface{}`; here the tag is static.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    Int(i64),
    Str(String),
    /// The agent replied with a PDU kind this daemon doesn't know how to
    /// fold into a load value (e.g. an SNMP error-status PDU).
    Unexpected(&'static str),
}

/// Outcome of one SNMPv3 GetRequest against one (transport, ip) pair.
#[derive(Debug, Clone)]
pub struct TransportResult {
    pub transport: Transport,
    pub ip: IpAddr,
    /// Folded integer response; `UNSET_RESPONSE` until a reply arrives.
    pub response_int: i64,
    pub response_string: String,
    pub response_error: Option<String>,
}

impl TransportResult {
    pub fn new(transport: Transport, ip: IpAddr) -> Self {
        Self {
            transport,
            ip,
            response_int: UNSET_RESPONSE,
            response_string: String::new(),
            response_error: None,
        }
    }

    pub fn is_working(&self) -> bool {
        self.response_int > 0 && self.response_error.is_none()
    }
}

/// Socket family a probe is carried over. Named per spec.md rather than the
/// Go source's `"udp"`/`"udp6"` strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp4,
    Udp6,
}

impl Transport {
    pub fn for_ip(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Transport::Udp4,
            IpAddr::V6(_) => Transport::Udp6,
        }
    }
}

/// Per-host probe state held by a `Cluster`'s host metric table.
#[derive(Debug, Clone)]
pub struct Host {
    pub hostname: String,
    /// Cluster names this host belongs to, comma-joined when the same
    /// hostname appears under more than one alias in one tick.
    pub cluster_name: String,
    pub load_balancing_username: String,
    pub load_balancing_password: String,
    pub transport_results: Vec<TransportResult>,
}

impl Host {
    pub fn new(hostname: impl Into<String>, cluster_name: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            cluster_name: cluster_name.into(),
            load_balancing_username: String::new(),
            load_balancing_password: String::new(),
            transport_results: Vec::new(),
        }
    }

    /// IPs of transports that answered and reported a usable load.
    pub fn working_ips(&self) -> Vec<IpAddr> {
        self.transport_results
            .iter()
            .filter(|t| t.is_working())
            .map(|t| t.ip)
            .collect()
    }

    /// All resolved IPs regardless of probe outcome.
    pub fn all_ips(&self) -> Vec<IpAddr> {
        self.transport_results.iter().map(|t| t.ip).collect()
    }

    /// Fold every transport's response into one load, preferring a numeric
    /// match embedded in the response string (`clusterName=(\d+)`) over the
    /// raw integer response.
    pub fn load_for_alias(&self, cluster_name_re: &regex::Regex) -> i64 {
        let mut load = MISSING_LOAD;
        for result in &self.transport_results {
            if result.response_error.is_some() {
                continue;
            }
            let mut value = result.response_int;
            if let Some(caps) = cluster_name_re.captures(&result.response_string) {
                if let Some(m) = caps.get(1) {
                    if let Ok(parsed) = m.as_str().parse::<i64>() {
                        value = parsed;
                    }
                }
            }
            if (value > 0 && value < load) || load < 0 {
                load = value;
            }
        }
        load
    }
}

/// One node's load and resolved IPs, as produced by a single evaluation
/// pass. Mirrors `original_source/lbcluster/lbcluster.go::Node`.
#[derive(Debug, Clone)]
pub struct NodeMetric {
    pub hostname: String,
    pub load: i64,
    pub ips: Vec<IpAddr>,
}

/// The load-balancing metric policy for a cluster. `Cmsweb` is accepted as
/// a first-class metric: see DESIGN.md Open Question 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Minimum,
    Cmsfrontier,
    Minino,
    Cmsweb,
}

impl std::str::FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minimum" => Ok(Metric::Minimum),
            "cmsfrontier" => Ok(Metric::Cmsfrontier),
            "minino" => Ok(Metric::Minino),
            "cmsweb" => Ok(Metric::Cmsweb),
            other => Err(format!("unknown metric {other}")),
        }
    }
}

/// Per-alias tunables, parsed from the cluster's config table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Parameters {
    #[serde(default = "default_best_hosts")]
    pub best_hosts: i64,
    #[serde(default)]
    pub external: bool,
    pub metric: Metric,
    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: u64,
    #[serde(default = "default_ttl")]
    pub ttl_secs: u32,
}

fn default_best_hosts() -> i64 {
    -1
}

fn default_polling_interval() -> u64 {
    60
}

fn default_ttl() -> u32 {
    60
}

impl Parameters {
    /// Effective TTL: never below the DNS floor the Go source's
    /// `defaultTTL` constant enforces.
    pub fn effective_ttl(&self) -> u32 {
        self.ttl_secs.max(60)
    }
}

/// One load-balanced DNS alias: its member hosts, tunables, and the state
/// carried between evaluation ticks.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub cluster_name: String,
    pub load_balancing_username: String,
    pub load_balancing_password: String,
    pub parameters: Parameters,
    pub host_metric_table: std::collections::HashMap<String, NodeMetric>,
    pub time_of_last_evaluation: Option<SystemTime>,
    pub current_best_ips: Vec<IpAddr>,
    /// What DNS returned at the start of the most recent publish attempt.
    /// Refreshed from a live query every attempt; never set from
    /// `current_best_ips`, or it would just cache intent instead of state.
    pub previous_best_ips_dns: Vec<IpAddr>,
}

impl Cluster {
    pub fn new(cluster_name: impl Into<String>, parameters: Parameters) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            load_balancing_username: String::new(),
            load_balancing_password: String::new(),
            parameters,
            host_metric_table: std::collections::HashMap::new(),
            time_of_last_evaluation: None,
            current_best_ips: Vec::new(),
            previous_best_ips_dns: Vec::new(),
        }
    }

    pub fn time_to_refresh(&self) -> bool {
        match self.time_of_last_evaluation {
            None => true,
            Some(last) => {
                let elapsed = SystemTime::now()
                    .duration_since(last)
                    .unwrap_or_default()
                    .as_secs();
                elapsed >= self.parameters.polling_interval_secs
            }
        }
    }
}

pub fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn re() -> regex::Regex {
        regex::Regex::new(r"(\d+)$").unwrap()
    }

    #[test]
    fn load_for_alias_prefers_regex_match_over_raw_int() {
        let mut host = Host::new("node1.example.org", "myalias");
        let mut result = TransportResult::new(
            Transport::Udp4,
            "192.0.2.1".parse().unwrap(),
        );
        result.response_int = 999;
        result.response_string = "myalias=5".to_string();
        host.transport_results.push(result);

        assert_eq!(host.load_for_alias(&re()), 5);
    }

    #[test]
    fn load_for_alias_ignores_errored_transports() {
        let mut host = Host::new("node1.example.org", "myalias");
        let mut ok = TransportResult::new(Transport::Udp4, "192.0.2.1".parse().unwrap());
        ok.response_int = 7;
        let mut err = TransportResult::new(Transport::Udp6, "2001:db8::1".parse().unwrap());
        err.response_error = Some("timeout".to_string());
        err.response_int = 1;
        host.transport_results.push(ok);
        host.transport_results.push(err);

        assert_eq!(host.load_for_alias(&re()), 7);
    }

    #[test]
    fn load_for_alias_with_no_transports_is_missing() {
        let host = Host::new("node1.example.org", "myalias");
        assert_eq!(host.load_for_alias(&re()), MISSING_LOAD);
    }

    #[test]
    fn working_ips_filters_by_response() {
        let mut host = Host::new("node1.example.org", "myalias");
        let mut ok = TransportResult::new(Transport::Udp4, "192.0.2.1".parse().unwrap());
        ok.response_int = 3;
        let bad = TransportResult::new(Transport::Udp6, "2001:db8::1".parse().unwrap());
        host.transport_results.push(ok);
        host.transport_results.push(bad);

        assert_eq!(host.working_ips(), vec!["192.0.2.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(host.all_ips().len(), 2);
    }

    #[test]
    fn cluster_time_to_refresh_defaults_true() {
        let params = Parameters {
            best_hosts: -1,
            external: false,
            metric: Metric::Minimum,
            polling_interval_secs: 60,
            ttl_secs: 60,
        };
        let cluster = Cluster::new("myalias", params);
        assert!(cluster.time_to_refresh());
    }
}

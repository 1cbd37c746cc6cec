//! Selects the best hosts for a cluster from its current host metric table.
//!
//! This is the Rust rendering of `original_source/lbcluster/lbcluster.go`'s
//! `FindBestHosts`/`ApplyMetric`: shuffle the measured hosts (so ties break
//! fairly), sort by load, then apply one of four metric policies.

use std::net::IpAddr;

use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::error::{LbdError, Result};
use crate::types::{Cluster, NodeMetric, WORST_LOAD};

/// Two ways of walking a cluster's host metric table, per spec.md's
/// DESIGN NOTES: a normal pass only considers hosts SNMP reported as
/// working, the minimum-fallback pass considers every resolved IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    Working,
    All,
}

/// Stateless evaluator: operates on a `Cluster`'s `host_metric_table` and
/// writes the result back into `current_best_ips`.
pub struct ClusterEvaluator;

impl ClusterEvaluator {
    /// Run one evaluation pass for `cluster`. Returns `Ok(true)` once
    /// `current_best_ips` has been recomputed. Returns
    /// `Err(LbdError::EmptyUsefulSet)` when the `cmsfrontier` metric found no
    /// useful hosts -- callers should treat that as "skip this cluster's DNS
    /// update this tick", not as a fatal error.
    pub fn find_best_hosts(&self, cluster: &mut Cluster) -> Result<bool> {
        debug!(cluster = %cluster.cluster_name, metric = ?cluster.parameters.metric, "evaluating cluster");

        let proceed = self.apply_metric(cluster)?;
        cluster.time_of_last_evaluation = Some(std::time::SystemTime::now());

        let ips_log = cluster
            .current_best_ips
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        info!(
            cluster = %cluster.cluster_name,
            best_hosts = if ips_log.is_empty() { "NONE" } else { &ips_log },
            "best hosts selected"
        );

        Ok(proceed)
    }

    fn apply_metric(&self, cluster: &mut Cluster) -> Result<bool> {
        use crate::types::Metric;

        let mut nodes: Vec<NodeMetric> = cluster.host_metric_table.values().cloned().collect();
        shuffle_then_sort(&mut nodes);

        let useful: Vec<&NodeMetric> = nodes.iter().filter(|n| n.load > 0 && n.load <= WORST_LOAD).collect();
        let list_len = nodes.len();
        let mut max = if cluster.parameters.best_hosts < 0 {
            list_len as i64
        } else {
            cluster.parameters.best_hosts
        };

        if max as usize > list_len {
            warn!(
                cluster = %cluster.cluster_name,
                requested = max,
                available = list_len,
                "impossible to return requested host count, clamping"
            );
            max = list_len as i64;
        }

        cluster.current_best_ips = Vec::new();

        if list_len == 0 {
            warn!(cluster = %cluster.cluster_name, "cluster has no hosts defined, check configuration");
            return Ok(true);
        }

        if useful.is_empty() {
            return match cluster.parameters.metric {
                Metric::Minimum => {
                    warn!(cluster = %cluster.cluster_name, max, "no usable hosts, falling back to all resolved IPs");
                    self.apply_minimum_fallback(cluster, max as usize);
                    Ok(true)
                }
                Metric::Minino | Metric::Cmsweb => {
                    warn!(cluster = %cluster.cluster_name, "no usable hosts, returning no hosts");
                    Ok(true)
                }
                Metric::Cmsfrontier => {
                    warn!(cluster = %cluster.cluster_name, "no usable hosts, skipping DNS update");
                    Err(LbdError::EmptyUsefulSet {
                        cluster: cluster.cluster_name.clone(),
                    })
                }
            };
        }

        let mut take = max as usize;
        if useful.len() < take {
            warn!(cluster = %cluster.cluster_name, useful = useful.len(), "fewer useful hosts than requested");
            take = useful.len();
        }
        for node in useful.into_iter().take(take) {
            cluster.current_best_ips.extend(node.ips.iter().copied());
        }
        Ok(true)
    }

    /// `ReEvaluateHostsForMinimum` equivalent: once the caller has
    /// re-populated `host_metric_table` using `Host::all_ips()` instead of
    /// `working_ips()`, reshuffle and take the first `max` hosts' IPs
    /// unconditionally.
    fn apply_minimum_fallback(&self, cluster: &mut Cluster, max: usize) {
        let mut nodes: Vec<NodeMetric> = cluster.host_metric_table.values().cloned().collect();
        let mut rng = rand::thread_rng();
        nodes.shuffle(&mut rng);
        for node in nodes.into_iter().take(max) {
            cluster.current_best_ips.extend(node.ips.iter().copied());
        }
    }
}

/// Fisher-Yates shuffle (via `rand`'s `SliceRandom`) followed by a stable
/// sort on load. Shuffling first means hosts that tie on load end up in a
/// fresh random relative order every evaluation pass.
fn shuffle_then_sort(nodes: &mut [NodeMetric]) {
    let mut rng = rand::thread_rng();
    nodes.shuffle(&mut rng);
    nodes.sort_by_key(|n| n.load);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Cluster, Metric, Parameters};
    use std::collections::HashMap;

    fn node(hostname: &str, load: i64, ip: &str) -> NodeMetric {
        NodeMetric {
            hostname: hostname.to_string(),
            load,
            ips: vec![ip.parse::<IpAddr>().unwrap()],
        }
    }

    fn cluster_with(metric: Metric, best_hosts: i64, nodes: Vec<NodeMetric>) -> Cluster {
        let params = Parameters {
            best_hosts,
            external: false,
            metric,
            polling_interval_secs: 60,
            ttl_secs: 60,
        };
        let mut cluster = Cluster::new("myalias", params);
        for n in nodes {
            cluster.host_metric_table.insert(n.hostname.clone(), n);
        }
        cluster
    }

    #[test]
    fn minimum_with_useful_hosts_picks_lowest_load() {
        let mut cluster = cluster_with(
            Metric::Minimum,
            1,
            vec![
                node("a", 10, "192.0.2.1"),
                node("b", 5, "192.0.2.2"),
                node("c", 20, "192.0.2.3"),
            ],
        );
        let evaluator = ClusterEvaluator;
        let proceed = evaluator.find_best_hosts(&mut cluster).unwrap();
        assert!(proceed);
        assert_eq!(cluster.current_best_ips, vec!["192.0.2.2".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn cmsfrontier_with_no_useful_hosts_errors_and_skips() {
        let mut cluster = cluster_with(
            Metric::Cmsfrontier,
            -1,
            vec![node("a", WORST_LOAD + 1, "192.0.2.1")],
        );
        let evaluator = ClusterEvaluator;
        let err = evaluator.find_best_hosts(&mut cluster).unwrap_err();
        assert_eq!(err.kind(), "empty_useful_set");
        assert!(cluster.current_best_ips.is_empty());
    }

    #[test]
    fn minino_with_no_useful_hosts_returns_empty_but_proceeds() {
        let mut cluster = cluster_with(Metric::Minino, -1, vec![node("a", -1, "192.0.2.1")]);
        let evaluator = ClusterEvaluator;
        let proceed = evaluator.find_best_hosts(&mut cluster).unwrap();
        assert!(proceed);
        assert!(cluster.current_best_ips.is_empty());
    }

    #[test]
    fn cmsweb_with_no_useful_hosts_returns_empty_but_proceeds() {
        let mut cluster = cluster_with(Metric::Cmsweb, -1, vec![node("a", -1, "192.0.2.1")]);
        let evaluator = ClusterEvaluator;
        let proceed = evaluator.find_best_hosts(&mut cluster).unwrap();
        assert!(proceed);
        assert!(cluster.current_best_ips.is_empty());
    }

    #[test]
    fn empty_cluster_returns_empty_and_proceeds() {
        let mut cluster = cluster_with(Metric::Minimum, -1, vec![]);
        let evaluator = ClusterEvaluator;
        let proceed = evaluator.find_best_hosts(&mut cluster).unwrap();
        assert!(proceed);
        assert!(cluster.current_best_ips.is_empty());
    }

    #[test]
    fn best_hosts_requested_above_available_is_clamped() {
        let mut cluster = cluster_with(
            Metric::Minimum,
            5,
            vec![node("a", 1, "192.0.2.1"), node("b", 2, "192.0.2.2")],
        );
        let evaluator = ClusterEvaluator;
        evaluator.find_best_hosts(&mut cluster).unwrap();
        assert_eq!(cluster.current_best_ips.len(), 2);
    }

    /// Over many trials with tied loads, every host should appear first
    /// roughly equally often -- this is the fairness property from
    /// spec.md's shuffle-then-sort requirement, checked with a manual
    /// high-trial-count loop rather than a property-test generator (the
    /// teacher's own tests never reach for `proptest` despite depending on
    /// it, so a manual loop matches observed texture here too).
    #[test]
    fn tied_loads_shuffle_fairly_over_many_trials() {
        let mut first_counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..2000 {
            let mut cluster = cluster_with(
                Metric::Minimum,
                1,
                vec![
                    node("a", 5, "192.0.2.1"),
                    node("b", 5, "192.0.2.2"),
                    node("c", 5, "192.0.2.3"),
                ],
            );
            let evaluator = ClusterEvaluator;
            evaluator.find_best_hosts(&mut cluster).unwrap();
            let winner = cluster.current_best_ips[0].to_string();
            *first_counts.entry(winner).or_insert(0) += 1;
        }
        assert_eq!(first_counts.len(), 3, "all three hosts should win at least once");
        for count in first_counts.values() {
            assert!(*count > 400, "distribution too skewed: {count} wins out of 2000");
        }
    }
}

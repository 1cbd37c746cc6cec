//! Top-level event loop: watches the config file, ticks every 10 seconds,
//! and on each tick probes due clusters, re-evaluates them, and republishes
//! DNS where needed.
//!
//! Grounded on `health.rs::run_loop`'s interval-driven loop-over-shared-
//! state shape and, more directly, on
//! `original_source/cmd/lbd.go`'s `checkAliases`/`watchFile`/`sleep`: two
//! background producers (a 1s config-file poller, a 10s ticker) feed one
//! event channel that the main loop selects over.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dns_updater::DnsUpdater;
use crate::evaluator::ClusterEvaluator;
use crate::host_probe::HostProbe;
use crate::master_elector::MasterElector;
use crate::types::{Cluster, NodeMetric};

const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(1);
const TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Events fed into the controller's main loop. Named after the Go source's
/// `doneChan` values (1 = config changed, 2 = tick) but given real variants
/// instead of magic integers.
#[derive(Debug)]
enum ControllerEvent {
    ConfigChanged,
    Tick,
}

pub struct Controller {
    config_path: PathBuf,
    config: Config,
    clusters: HashMap<String, Cluster>,
    evaluator: ClusterEvaluator,
    elector: Arc<MasterElector>,
    dns: DnsUpdater,
}

impl Controller {
    pub fn new(config_path: PathBuf, config: Config) -> Self {
        let clusters = build_clusters(&config);
        let elector = Arc::new(MasterElector::new(
            config.master.clone(),
            config.heartbeat_url.clone(),
            config.heartbeat_path.clone(),
            config.heartbeat_file.clone(),
        ));
        let dns = DnsUpdater::new(
            config.dns_manager.clone(),
            config.tsig_internal_key.clone(),
            config.tsig_external_key.clone(),
        );

        Self {
            config_path,
            config,
            clusters,
            evaluator: ClusterEvaluator,
            elector,
            dns,
        }
    }

    /// Run until `shutdown` resolves. Spawns the config watcher and ticker
    /// tasks and drives the main select loop.
    pub async fn run(mut self, shutdown: impl std::future::Future<Output = ()>) {
        let (tx, mut rx) = mpsc::channel::<ControllerEvent>(8);

        let watcher_tx = tx.clone();
        let watch_path = self.config_path.clone();
        tokio::spawn(watch_config_file(watch_path, watcher_tx));

        let ticker_tx = tx;
        tokio::spawn(tick_forever(ticker_tx));

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown signal received, stopping controller");
                    break;
                }
                event = rx.recv() => {
                    match event {
                        Some(ControllerEvent::ConfigChanged) => self.reload_config(),
                        Some(ControllerEvent::Tick) => self.check_aliases().await,
                        None => {
                            warn!("controller event channel closed, stopping");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn reload_config(&mut self) {
        info!(path = %self.config_path.display(), "config changed, reloading");
        match Config::load(&self.config_path) {
            Ok(new_config) => {
                self.clusters = build_clusters(&new_config);
                self.config = new_config;
            }
            Err(e) => {
                error!(error = %e, "failed reloading config, keeping previous clusters");
            }
        }
    }

    /// One orchestration pass: pick due clusters, probe the union of their
    /// hosts once each, re-evaluate every due cluster, and push DNS updates
    /// for the ones whose best hosts changed -- mirroring `checkAliases`.
    async fn check_aliases(&mut self) {
        let due: Vec<String> = self
            .clusters
            .iter()
            .filter(|(_, c)| c.time_to_refresh())
            .map(|(name, _)| name.clone())
            .collect();

        if due.is_empty() {
            debug!("no clusters due for refresh this tick");
            return;
        }

        let hosts_to_check = self.gather_hosts_to_check(&due);
        let probe_results = self.probe_hosts(hosts_to_check).await;

        let should_update = self.elector.should_update_dns().await;

        for cluster_name in &due {
            self.apply_probe_results(cluster_name, &probe_results);

            let cluster = match self.clusters.get_mut(cluster_name) {
                Some(c) => c,
                None => continue,
            };

            let proceed = match self.evaluator.find_best_hosts(cluster) {
                Ok(proceed) => proceed,
                Err(e) => {
                    warn!(cluster = %cluster_name, error = %e, "evaluation skipped this tick");
                    continue;
                }
            };

            if !proceed || !should_update {
                continue;
            }

            let ttl = cluster.parameters.effective_ttl();
            let external = cluster.parameters.external;
            // `refresh` re-reads DNS itself at the start of the attempt and
            // hands back what it saw, so `previous_best_ips_dns` always
            // reflects live state at the start of the most recent publish
            // attempt -- never a cache of what we last intended to publish.
            let result = self.dns.refresh(cluster_name, &cluster.current_best_ips, ttl, external).await;

            match result {
                Ok(observed) => cluster.previous_best_ips_dns = observed,
                Err(e) => error!(cluster = %cluster_name, error = %e, "DNS update failed"),
            }
        }

        if should_update {
            if let Err(e) = self.elector.write_heartbeat() {
                error!(error = %e, "failed writing heartbeat");
            }
        }
    }

    /// Union of every due cluster's hosts, keyed by hostname, with
    /// `cluster_name` comma-joined when the same host serves more than one
    /// alias -- mirrors `GetListHosts`.
    fn gather_hosts_to_check(&self, due: &[String]) -> HashMap<String, (String, String, String)> {
        let mut hosts: HashMap<String, (String, String, String)> = HashMap::new();
        for cluster_name in due {
            let Some(cluster) = self.clusters.get(cluster_name) else {
                continue;
            };
            for hostname in cluster.host_metric_table.keys() {
                hosts
                    .entry(hostname.clone())
                    .and_modify(|(names, _, _)| {
                        names.push(',');
                        names.push_str(cluster_name);
                    })
                    .or_insert_with(|| {
                        (
                            cluster_name.clone(),
                            cluster.load_balancing_username.clone(),
                            cluster.load_balancing_password.clone(),
                        )
                    });
            }
        }
        hosts
    }

    /// Probe every host once, in parallel, joining the results back by
    /// hostname.
    async fn probe_hosts(
        &self,
        hosts: HashMap<String, (String, String, String)>,
    ) -> HashMap<String, Vec<crate::types::TransportResult>> {
        let mut handles = Vec::with_capacity(hosts.len());
        for (hostname, (_, username, password)) in hosts {
            handles.push(tokio::spawn(async move {
                let probe = HostProbe::new(hostname.clone(), username, password);
                let mut host = crate::types::Host::new(hostname.clone(), String::new());
                match probe.resolve_ips().await {
                    Ok(ips) => probe.probe(&mut host, &ips).await,
                    Err(e) => warn!(hostname, error = %e, "resolution failed, host will be treated as unreachable"),
                }
                (hostname, host.transport_results)
            }));
        }

        let mut results = HashMap::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok((hostname, transport_results)) => {
                    results.insert(hostname, transport_results);
                }
                Err(e) => error!(error = %e, "probe task panicked"),
            }
        }
        results
    }

    fn apply_probe_results(
        &mut self,
        cluster_name: &str,
        probe_results: &HashMap<String, Vec<crate::types::TransportResult>>,
    ) {
        let cluster_name_re = regex::Regex::new(&format!("{}=([0-9]+)", regex::escape(cluster_name))).unwrap();
        let Some(cluster) = self.clusters.get_mut(cluster_name) else {
            return;
        };

        for hostname in cluster.host_metric_table.keys().cloned().collect::<Vec<_>>() {
            let Some(transport_results) = probe_results.get(&hostname) else {
                continue;
            };
            let host = crate::types::Host {
                hostname: hostname.clone(),
                cluster_name: cluster_name.to_string(),
                load_balancing_username: String::new(),
                load_balancing_password: String::new(),
                transport_results: transport_results.clone(),
            };
            let load = host.load_for_alias(&cluster_name_re);
            let ips = host.working_ips();
            cluster.host_metric_table.insert(
                hostname.clone(),
                NodeMetric {
                    hostname,
                    load,
                    ips,
                },
            );
        }
    }
}

fn build_clusters(config: &Config) -> HashMap<String, Cluster> {
    let mut clusters = HashMap::with_capacity(config.clusters.len());
    for (name, entry) in &config.clusters {
        let mut cluster = Cluster::new(name.clone(), entry.parameters.clone());
        cluster.load_balancing_username = entry.load_balancing_username.clone();
        cluster.load_balancing_password = entry.load_balancing_password.clone();
        for hostname in &entry.hosts {
            cluster.host_metric_table.insert(
                hostname.clone(),
                NodeMetric {
                    hostname: hostname.clone(),
                    load: crate::types::MISSING_LOAD,
                    ips: Vec::new(),
                },
            );
        }
        clusters.insert(name.clone(), cluster);
    }
    clusters
}

async fn watch_config_file(path: PathBuf, tx: mpsc::Sender<ControllerEvent>) {
    let mut last_mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
    loop {
        tokio::time::sleep(CONFIG_POLL_INTERVAL).await;
        let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        if mtime != last_mtime {
            last_mtime = mtime;
            if tx.send(ControllerEvent::ConfigChanged).await.is_err() {
                return;
            }
        }
    }
}

async fn tick_forever(tx: mpsc::Sender<ControllerEvent>) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    interval.tick().await; // first tick fires immediately; skip it
    loop {
        interval.tick().await;
        if tx.send(ControllerEvent::Tick).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Metric, Parameters};

    fn sample_config() -> Config {
        let mut clusters = HashMap::new();
        clusters.insert(
            "myalias".to_string(),
            crate::config::ClusterEntry {
                hosts: vec!["node1.example.org".to_string(), "node2.example.org".to_string()],
                load_balancing_username: "lbuser".to_string(),
                load_balancing_password: "lbpass".to_string(),
                parameters: Parameters {
                    best_hosts: -1,
                    external: false,
                    metric: Metric::Minimum,
                    polling_interval_secs: 60,
                    ttl_secs: 60,
                },
            },
        );
        Config {
            master: "lb01.example.org".to_string(),
            heartbeat_url: "http://lb01.example.org/heartbeat".to_string(),
            heartbeat_path: std::env::temp_dir(),
            heartbeat_file: PathBuf::from("heartbeat"),
            dns_manager: "dns01.example.org".to_string(),
            tsig_internal_key: crate::config::TsigKey {
                name: "internal-key".to_string(),
                secret_base64: "c2VjcmV0".to_string(),
            },
            tsig_external_key: None,
            clusters,
        }
    }

    #[test]
    fn build_clusters_seeds_host_metric_table() {
        let config = sample_config();
        let clusters = build_clusters(&config);
        let cluster = &clusters["myalias"];
        assert_eq!(cluster.host_metric_table.len(), 2);
    }

    #[test]
    fn gather_hosts_to_check_comma_joins_shared_hosts() {
        let config = sample_config();
        let mut clusters = build_clusters(&config);
        // Second alias shares node1 with myalias.
        let mut other = Cluster::new(
            "otheralias",
            Parameters {
                best_hosts: -1,
                external: false,
                metric: Metric::Minimum,
                polling_interval_secs: 60,
                ttl_secs: 60,
            },
        );
        other.host_metric_table.insert(
            "node1.example.org".to_string(),
            NodeMetric {
                hostname: "node1.example.org".to_string(),
                load: crate::types::MISSING_LOAD,
                ips: vec![],
            },
        );
        clusters.insert("otheralias".to_string(), other);

        let controller = Controller {
            config_path: PathBuf::from("/dev/null"),
            config: config.clone(),
            clusters,
            evaluator: ClusterEvaluator,
            elector: Arc::new(MasterElector::new(
                config.master.clone(),
                config.heartbeat_url.clone(),
                config.heartbeat_path.clone(),
                config.heartbeat_file.clone(),
            )),
            dns: DnsUpdater::new(config.dns_manager.clone(), config.tsig_internal_key.clone(), None),
        };

        let hosts = controller.gather_hosts_to_check(&["myalias".to_string(), "otheralias".to_string()]);
        let (names, _, _) = &hosts["node1.example.org"];
        assert!(names.contains("myalias"));
        assert!(names.contains("otheralias"));
    }
}

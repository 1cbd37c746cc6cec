//! Observability facade: probe, evaluation, DNS update, and election
//! concerns, exposed through the `metrics` crate's macros. No exporter is
//! installed by this crate -- the facade is cheap to call even with the
//! default no-op recorder, and installing a collector is left to whatever
//! embeds this binary.

use std::time::{Duration, Instant};

/// Record one SNMP probe's outcome.
pub fn record_probe(transport: &'static str, ok: bool, duration: Duration) {
    metrics::histogram!(
        "lbd_probe_duration_seconds",
        "transport" => transport,
    )
    .record(duration.as_secs_f64());

    metrics::counter!(
        "lbd_probe_total",
        "transport" => transport,
        "status" => if ok { "ok" } else { "error" },
    )
    .increment(1);
}

/// Record one cluster evaluation pass.
pub fn record_evaluation(cluster: &str, metric: &'static str, selected_hosts: usize) {
    metrics::gauge!(
        "lbd_selected_hosts",
        "cluster" => cluster.to_string(),
        "metric" => metric,
    )
    .set(selected_hosts as f64);

    metrics::counter!(
        "lbd_evaluations_total",
        "cluster" => cluster.to_string(),
    )
    .increment(1);
}

/// Record whether a DNS update was actually pushed for a cluster this tick.
pub fn record_dns_update(cluster: &str, pushed: bool) {
    metrics::counter!(
        "lbd_dns_updates_total",
        "cluster" => cluster.to_string(),
        "status" => if pushed { "pushed" } else { "unchanged" },
    )
    .increment(1);
}

/// Record a DNS update failure.
pub fn record_dns_update_error(cluster: &str, kind: &'static str) {
    metrics::counter!(
        "lbd_dns_update_errors_total",
        "cluster" => cluster.to_string(),
        "kind" => kind,
    )
    .increment(1);
}

/// Record the outcome of one master-election check.
pub fn record_election(is_master: bool) {
    metrics::gauge!("lbd_is_master").set(if is_master { 1.0 } else { 0.0 });
}

/// Guard returned by `ProbeTimer::start`; records duration and outcome on
/// drop-equivalent consuming calls, mirroring the teacher's `RpcTimer`.
pub struct ProbeTimer {
    transport: &'static str,
    start: Instant,
}

impl ProbeTimer {
    pub fn start(transport: &'static str) -> Self {
        Self {
            transport,
            start: Instant::now(),
        }
    }

    pub fn success(self) {
        record_probe(self.transport, true, self.start.elapsed());
    }

    pub fn error(self) {
        record_probe(self.transport, false, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_timer_records_without_panicking() {
        let timer = ProbeTimer::start("udp4");
        timer.success();
    }

    #[test]
    fn facade_calls_do_not_panic_without_an_installed_recorder() {
        record_evaluation("myalias", "minimum", 2);
        record_dns_update("myalias", true);
        record_dns_update_error("myalias", "dns_update");
        record_election(true);
    }
}

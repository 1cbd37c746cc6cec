//! Publishes a cluster's selected IPs as the A/AAAA set of its DNS alias,
//! via RFC 2136 dynamic update signed with TSIG.
//!
//! Grounded on `original_source/lbcluster/lbcluster_dns.go`: read the
//! current state with an EDNS0 query, diff it against what we're about to
//! publish, and if anything changed, delete the sentinel placeholder
//! records and insert the new set.

use std::net::IpAddr;

use base64::Engine as _;
use hickory_client::client::{AsyncClient, ClientHandle};
use hickory_client::op::DnsResponse;
use hickory_client::proto::rr::rdata::{A, AAAA};
use hickory_client::proto::rr::{Name, RData, Record, RecordType};
use hickory_client::rr::DNSClass;
use hickory_proto::rr::dnssec::tsig::TSigner;
use tracing::{debug, info};

use crate::config::TsigKey;
use crate::error::{LbdError, Result};

/// TTL floor the Go source's `defaultTTL` constant enforces.
pub const DEFAULT_TTL: u32 = 60;

/// Placeholder A/AAAA records the Go source deletes (by type, not by exact
/// value) before inserting the real record set. Their value is irrelevant;
/// only the owner name + rrtype identify the RRset being replaced.
const SENTINEL_V4: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1));
const SENTINEL_V6: IpAddr = IpAddr::V6(std::net::Ipv6Addr::LOCALHOST);

pub struct DnsUpdater {
    dns_manager: String,
    internal_key: TsigKey,
    external_key: Option<TsigKey>,
}

impl DnsUpdater {
    pub fn new(dns_manager: String, internal_key: TsigKey, external_key: Option<TsigKey>) -> Self {
        Self {
            dns_manager,
            internal_key,
            external_key,
        }
    }

    /// Query the current A/AAAA state for `alias` via EDNS0(4096).
    pub async fn current_state(&self, alias: &str) -> Result<Vec<IpAddr>> {
        let name = Name::from_ascii(format!("{alias}.")).map_err(|e| LbdError::Config(e.to_string()))?;
        let (mut client, bg) = self.connect().await?;
        tokio::spawn(bg);

        let mut ips = Vec::new();
        for rtype in [RecordType::A, RecordType::AAAA] {
            let response: DnsResponse = client
                .query(name.clone(), DNSClass::IN, rtype)
                .await
                .map_err(|e| LbdError::DnsRead {
                    name: alias.to_string(),
                    source: e,
                })?;
            for record in response.answers() {
                match record.data() {
                    Some(RData::A(A(addr))) => ips.push(IpAddr::V4(*addr)),
                    Some(RData::AAAA(AAAA(addr))) => ips.push(IpAddr::V6(*addr)),
                    _ => {}
                }
            }
        }
        Ok(ips)
    }

    /// Query the nameserver for `alias`'s live A/AAAA state, diff it
    /// against `current_best_ips`, and if they differ, push a dynamic
    /// update. Publishes to the internal key always, and to the external
    /// key too when `external` is set on the cluster.
    ///
    /// The diff baseline is always a fresh read, never a cache of the last
    /// publish: a read failure proceeds with an empty baseline rather than
    /// reusing a stale one, so a transient resolver hiccup degrades to "try
    /// to publish again" instead of silently skipping an update.
    pub async fn refresh(&self, alias: &str, current_best_ips: &[IpAddr], ttl: u32, external: bool) -> Result<Vec<IpAddr>> {
        let previous_best_ips_dns = match self.current_state(alias).await {
            Ok(ips) => ips,
            Err(e) => {
                debug!(alias, error = %e, "DNS read failed, proceeding with empty baseline");
                Vec::new()
            }
        };

        if sorted_strings(current_best_ips) == sorted_strings(&previous_best_ips_dns) {
            debug!(alias, "DNS already matches selected hosts, nothing to do");
            return Ok(previous_best_ips_dns);
        }

        self.update(alias, current_best_ips, ttl, &self.internal_key).await?;
        if external {
            if let Some(ext_key) = &self.external_key {
                self.update(alias, current_best_ips, ttl, ext_key).await?;
            }
        }
        info!(alias, ips = ?current_best_ips, "DNS updated");
        Ok(previous_best_ips_dns)
    }

    async fn update(&self, alias: &str, ips: &[IpAddr], ttl: u32, key: &TsigKey) -> Result<()> {
        let name = Name::from_ascii(format!("{alias}.")).map_err(|e| LbdError::Config(e.to_string()))?;
        let (mut client, bg) = self.connect_signed(key).await?;
        tokio::spawn(bg);

        // Delete-by-rrset: the value is never inspected, only the type, so
        // the sentinel addresses stand in for "all records of this type".
        let sentinel_v4 = match SENTINEL_V4 {
            IpAddr::V4(a) => a,
            IpAddr::V6(_) => unreachable!("SENTINEL_V4 is always IPv4"),
        };
        let sentinel_v6 = match SENTINEL_V6 {
            IpAddr::V6(a) => a,
            IpAddr::V4(_) => unreachable!("SENTINEL_V6 is always IPv6"),
        };
        let delete_a = Record::from_rdata(name.clone(), 0, RData::A(A(sentinel_v4)));
        let delete_aaaa = Record::from_rdata(name.clone(), 0, RData::AAAA(AAAA(sentinel_v6)));

        client
            .delete_rrset(delete_a, name.clone())
            .await
            .map_err(|e| LbdError::DnsUpdate {
                name: alias.to_string(),
                source: e,
            })?;
        client
            .delete_rrset(delete_aaaa, name.clone())
            .await
            .map_err(|e| LbdError::DnsUpdate {
                name: alias.to_string(),
                source: e,
            })?;

        let ttl = ttl.max(DEFAULT_TTL);
        let mut records = Vec::new();
        for ip in ips {
            let record = match ip {
                IpAddr::V4(addr) => Record::from_rdata(name.clone(), ttl, RData::A(A(*addr))),
                IpAddr::V6(addr) => Record::from_rdata(name.clone(), ttl, RData::AAAA(AAAA(*addr))),
            };
            records.push(record);
        }
        if !records.is_empty() {
            client
                .append(records, name, false)
                .await
                .map_err(|e| LbdError::DnsUpdate {
                    name: alias.to_string(),
                    source: e,
                })?;
        }

        Ok(())
    }

    async fn connect(&self) -> Result<(AsyncClient, impl std::future::Future<Output = ()>)> {
        self.connect_signed(&self.internal_key).await
    }

    async fn connect_signed(&self, key: &TsigKey) -> Result<(AsyncClient, impl std::future::Future<Output = ()>)> {
        use hickory_client::udp::UdpClientConnection as _;
        use hickory_proto::udp::UdpClientStream;

        let addr = format!("{}:53", self.dns_manager)
            .parse()
            .map_err(|e: std::net::AddrParseError| LbdError::Config(e.to_string()))?;

        let secret = base64::engine::general_purpose::STANDARD
            .decode(&key.secret_base64)
            .map_err(|e| LbdError::Config(format!("bad TSIG secret: {e}")))?;
        let signer = TSigner::new(
            secret,
            hickory_proto::rr::dnssec::tsig::TsigAlgorithm::HMAC_MD5,
            Name::from_ascii(&key.name).map_err(|e| LbdError::Config(e.to_string()))?,
            300,
        )
        .map_err(|e| LbdError::Config(e.to_string()))?;

        let stream = UdpClientStream::<tokio::net::UdpSocket>::with_timeout(
            addr,
            std::time::Duration::from_secs(5),
        );
        let (client, bg) = AsyncClient::with_tsigner(stream, Some(signer))
            .await
            .map_err(|e| LbdError::DnsUpdate {
                name: self.dns_manager.clone(),
                source: e,
            })?;
        Ok((client, bg))
    }
}

fn sorted_strings(ips: &[IpAddr]) -> Vec<String> {
    let mut s: Vec<String> = ips.iter().map(|ip| ip.to_string()).collect();
    s.sort();
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_strings_orders_lexically() {
        let ips = vec!["192.0.2.2".parse().unwrap(), "192.0.2.1".parse().unwrap()];
        assert_eq!(sorted_strings(&ips), vec!["192.0.2.1", "192.0.2.2"]);
    }

    #[test]
    fn tsig_secret_decodes_with_base64_crate() {
        let decoded = base64::engine::general_purpose::STANDARD.decode("c2VjcmV0").unwrap();
        assert_eq!(decoded, b"secret");
    }
}

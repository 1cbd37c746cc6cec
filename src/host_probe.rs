//! Per-host SNMPv3 probing and hostname resolution.
//!
//! Mirrors `original_source/lbhost/lbhost.go`: resolve a hostname to its
//! IPs, open one SNMPv3 session per (transport, ip) pair, and pull the
//! current load off the agent at a fixed OID.

use std::net::IpAddr;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use crate::error::{LbdError, Result};
use crate::types::{Host, Pdu, Transport, TransportResult, UNSET_RESPONSE};

/// OID the agent publishes its current load metric at.
pub const LOAD_OID: &str = ".1.3.6.1.4.1.96.255.1";

const SNMP_TIMEOUT: Duration = Duration::from_secs(10);
const SNMP_RETRIES: u32 = 2;
const RESOLVE_ATTEMPTS: u32 = 3;

/// Probes one host's transports over SNMPv3 and folds the replies into a
/// load value for a cluster.
pub struct HostProbe {
    pub hostname: String,
    pub username: String,
    pub password: String,
}

impl HostProbe {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    /// Resolve `hostname` to its IPs, retrying transient failures up to
    /// `RESOLVE_ATTEMPTS` times. A resolver error matching "no such host"
    /// is treated as permanent and returned immediately, mirroring the Go
    /// source's `.*no such host` fast-fail.
    pub async fn resolve_ips(&self) -> Result<Vec<IpAddr>> {
        let no_such_host = Regex::new(r"(?i).*no such host").unwrap();
        let mut last_err = None;

        for attempt in 0..RESOLVE_ATTEMPTS {
            let hostname = self.hostname.clone();
            let resolved = tokio::task::spawn_blocking(move || {
                use std::net::ToSocketAddrs;
                format!("{hostname}:0")
                    .to_socket_addrs()
                    .map(|addrs| addrs.map(|a| a.ip()).collect::<Vec<_>>())
            })
            .await
            .map_err(|e| LbdError::Resolve {
                host: self.hostname.clone(),
                source: std::io::Error::other(e.to_string()),
            })?;

            match resolved {
                Ok(ips) => return Ok(ips),
                Err(e) => {
                    if no_such_host.is_match(&e.to_string()) {
                        return Err(LbdError::Resolve {
                            host: self.hostname.clone(),
                            source: e,
                        });
                    }
                    warn!(host = %self.hostname, attempt, error = %e, "resolution attempt failed, retrying");
                    last_err = Some(e);
                }
            }
        }

        Err(LbdError::Resolve {
            host: self.hostname.clone(),
            source: last_err.unwrap_or_else(|| std::io::Error::other("resolution exhausted")),
        })
    }

    /// Run one SNMPv3 GetRequest per resolved IP over the transport matching
    /// its address family, populating `host.transport_results`.
    pub async fn probe(&self, host: &mut Host, ips: &[IpAddr]) {
        host.transport_results.clear();
        for &ip in ips {
            let transport = Transport::for_ip(&ip);
            let mut result = TransportResult::new(transport, ip);
            match self.snmp_get(ip).await {
                Ok(Pdu::Int(n)) => result.response_int = n,
                Ok(Pdu::Str(s)) => {
                    result.response_int = UNSET_RESPONSE;
                    result.response_string = s;
                }
                Ok(Pdu::Unexpected(kind)) => {
                    result.response_error = Some(format!("unexpected PDU kind: {kind}"));
                }
                Err(e) => {
                    debug!(%ip, error = %e, "SNMP probe failed");
                    result.response_error = Some(e.to_string());
                }
            }
            host.transport_results.push(result);
        }
    }

    /// Open one SNMPv3 session (MD5 auth, no privacy) against `ip` and fetch
    /// `LOAD_OID`, retrying up to `SNMP_RETRIES` times.
    async fn snmp_get(&self, ip: IpAddr) -> Result<Pdu> {
        let username = self.username.clone();
        let password = self.password.clone();

        for attempt in 0..=SNMP_RETRIES {
            let result = tokio::time::timeout(SNMP_TIMEOUT, self.snmp_get_once(ip, &username, &password)).await;
            match result {
                Ok(Ok(pdu)) => return Ok(pdu),
                Ok(Err(e)) if attempt < SNMP_RETRIES => {
                    warn!(%ip, attempt, error = %e, "SNMP request failed, retrying");
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_elapsed) if attempt < SNMP_RETRIES => {
                    warn!(%ip, attempt, "SNMP request timed out, retrying");
                    continue;
                }
                Err(_elapsed) => {
                    return Err(LbdError::Snmp {
                        ip,
                        message: "timed out".to_string(),
                    })
                }
            }
        }
        unreachable!("loop always returns")
    }

    async fn snmp_get_once(&self, ip: IpAddr, username: &str, password: &str) -> Result<Pdu> {
        let socket_domain = match ip {
            IpAddr::V4(_) => socket2::Domain::IPV4,
            IpAddr::V6(_) => socket2::Domain::IPV6,
        };
        let socket = socket2::Socket::new(socket_domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
            .map_err(|e| LbdError::Snmp {
                ip,
                message: format!("socket setup failed: {e}"),
            })?;
        socket.set_nonblocking(true).map_err(|e| LbdError::Snmp {
            ip,
            message: format!("socket setup failed: {e}"),
        })?;
        let udp = tokio::net::UdpSocket::from_std(socket.into()).map_err(|e| LbdError::Snmp {
            ip,
            message: format!("socket setup failed: {e}"),
        })?;
        let addr = std::net::SocketAddr::new(ip, 161);
        udp.connect(addr).await.map_err(|e| LbdError::Snmp {
            ip,
            message: format!("connect failed: {e}"),
        })?;

        let session = SnmpV3Session::discover(&udp, username, password)
            .await
            .map_err(|e| LbdError::Snmp {
                ip,
                message: format!("USM discovery failed: {e}"),
            })?;

        session.get(&udp, LOAD_OID).await.map(classify_pdu).map_err(|e| LbdError::Snmp {
            ip,
            message: e.to_string(),
        })
    }
}

/// An established SNMPv3 USM context: the agent's authoritative engine ID /
/// boot count / engine time (learned via RFC 3414 §4.2.1 discovery) plus
/// the password localized against that engine ID.
struct SnmpV3Session {
    engine_id: Vec<u8>,
    engine_boots: i64,
    engine_time: i64,
    username: String,
    auth_key: snmp_usm::LocalizedKey<snmp_usm::Md5>,
}

impl SnmpV3Session {
    /// RFC 3414 §4.2.1 discovery: send a GetRequest with empty
    /// securityParameters; a compliant agent replies with a Report PDU
    /// whose securityParameters carry its authoritative engine ID, boot
    /// count, and engine time, even though the request itself was
    /// unauthenticated.
    async fn discover(udp: &tokio::net::UdpSocket, username: &str, password: &str) -> std::io::Result<Self> {
        let probe = build_message(
            &[],
            0,
            0,
            "",
            &[0; 12],
            &[],
            encode_get_request(&[]),
        )
        .map_err(std::io::Error::other)?;

        udp.send(&probe).await?;
        let mut buf = [0u8; 2048];
        let n = udp.recv(&mut buf).await?;
        let response = decode_message(&buf[..n]).map_err(std::io::Error::other)?;

        let auth_key = snmp_usm::LocalizedKey::<snmp_usm::Md5>::new(
            password.as_bytes(),
            &response.authoritative_engine_id,
        );

        Ok(Self {
            engine_id: response.authoritative_engine_id,
            engine_boots: response.authoritative_engine_boots,
            engine_time: response.authoritative_engine_time,
            username: username.to_string(),
            auth_key,
        })
    }

    /// Send an authenticated (MD5, no privacy) GetRequest for `oid` and
    /// return the single var-bind value in the reply.
    async fn get(&self, udp: &tokio::net::UdpSocket, oid: &str) -> std::io::Result<ObjectSyntaxValue> {
        let pdu = encode_get_request(&[oid]);
        let mut message = build_message(
            &self.engine_id,
            self.engine_boots,
            self.engine_time,
            &self.username,
            &[0; 12], // zeroed placeholder, patched below once the whole message is serialized
            &[],
            pdu,
        )
        .map_err(std::io::Error::other)?;

        let auth_offset = find_auth_params_offset(&message)?;
        self.auth_key
            .auth_out_msg(&mut message, auth_offset)
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        udp.send(&message).await?;
        let mut buf = [0u8; 2048];
        let n = udp.recv(&mut buf).await?;

        let response_auth_offset = find_auth_params_offset(&buf[..n])?;
        self.auth_key
            .auth_in_msg(&buf[..n], response_auth_offset)
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        let response = decode_message(&buf[..n]).map_err(std::io::Error::other)?;
        response
            .first_value()
            .ok_or_else(|| std::io::Error::other("response carried no var-binds"))
    }
}

/// `msgAuthenticationParameters` is always encoded as a 12-byte all-zero
/// OCTET STRING placeholder until `LocalizedKey::auth_out_msg` overwrites
/// it in place with the real HMAC-MD5-96 digest, so its byte offset within
/// the fully-encoded message can be found by searching for that placeholder
/// rather than computed from the surrounding fields' variable BER lengths.
fn find_auth_params_offset(message: &[u8]) -> std::io::Result<usize> {
    let needle = [0x04u8, 0x0c, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    message
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + 2)
        .ok_or_else(|| std::io::Error::other("could not locate authenticationParameters placeholder"))
}

/// Minimal representation of the one var-bind value this daemon ever reads
/// back out of a response PDU.
enum ObjectSyntaxValue {
    Integer(i64),
    String(Vec<u8>),
    Other,
}

fn encode_get_request(oids: &[&str]) -> rasn_snmp::v2c::Pdus {
    let var_binds = oids
        .iter()
        .map(|oid| rasn_snmp::v2c::VarBind {
            name: parse_oid(oid),
            value: rasn_snmp::v2c::VarBindValue::Unspecified,
        })
        .collect::<Vec<_>>();

    rasn_snmp::v2c::Pdus::GetRequest(rasn_snmp::v2c::Pdu {
        request_id: rand::random(),
        error_status: 0,
        error_index: 0,
        variable_bindings: var_binds,
    })
}

fn parse_oid(oid: &str) -> rasn::types::ObjectIdentifier {
    let arcs: Vec<u32> = oid
        .trim_start_matches('.')
        .split('.')
        .filter_map(|a| a.parse().ok())
        .collect();
    rasn::types::ObjectIdentifier::new(arcs).expect("LOAD_OID is a fixed, valid dotted OID")
}

fn build_message(
    engine_id: &[u8],
    engine_boots: i64,
    engine_time: i64,
    username: &str,
    auth_params: &[u8],
    priv_params: &[u8],
    pdu: rasn_snmp::v2c::Pdus,
) -> std::result::Result<Vec<u8>, rasn::error::EncodeError> {
    let security_parameters = rasn_snmp::v3::UsmSecurityParameters {
        authoritative_engine_id: engine_id.to_vec(),
        authoritative_engine_boots: engine_boots,
        authoritative_engine_time: engine_time,
        user_name: username.to_string(),
        authentication_parameters: auth_params.to_vec(),
        privacy_parameters: priv_params.to_vec(),
    };

    let message = rasn_snmp::v3::Message {
        version: 3,
        global_data: rasn_snmp::v3::HeaderData {
            message_id: rand::random::<u16>() as i64,
            max_size: 65507,
            flags: vec![if username.is_empty() { 0 } else { 0b101 }], // reportable + auth, no priv
            security_model: 3,
        },
        security_parameters: rasn::der::encode(&security_parameters)?,
        scoped_pdu_data: rasn_snmp::v3::ScopedPduData::Cleartext(rasn_snmp::v3::ScopedPdu {
            engine_id: engine_id.to_vec(),
            name: Vec::new(),
            data: pdu,
        }),
    };

    rasn::der::encode(&message)
}

fn decode_message(bytes: &[u8]) -> std::result::Result<DecodedMessage, rasn::error::DecodeError> {
    let message: rasn_snmp::v3::Message = rasn::der::decode(bytes)?;
    let security_parameters: rasn_snmp::v3::UsmSecurityParameters = rasn::der::decode(&message.security_parameters)?;

    let pdu = match message.scoped_pdu_data {
        rasn_snmp::v3::ScopedPduData::Cleartext(scoped) => scoped.data,
        rasn_snmp::v3::ScopedPduData::EncryptedPdu(_) => {
            return Err(rasn::error::DecodeError::custom(
                "encrypted scoped PDU not supported: this daemon runs USM with no privacy",
            ))
        }
    };

    Ok(DecodedMessage {
        authoritative_engine_id: security_parameters.authoritative_engine_id,
        authoritative_engine_boots: security_parameters.authoritative_engine_boots,
        authoritative_engine_time: security_parameters.authoritative_engine_time,
        pdu,
    })
}

struct DecodedMessage {
    authoritative_engine_id: Vec<u8>,
    authoritative_engine_boots: i64,
    authoritative_engine_time: i64,
    pdu: rasn_snmp::v2c::Pdus,
}

impl DecodedMessage {
    fn first_value(&self) -> Option<ObjectSyntaxValue> {
        let bindings = match &self.pdu {
            rasn_snmp::v2c::Pdus::GetResponse(pdu) | rasn_snmp::v2c::Pdus::Response(pdu) => &pdu.variable_bindings,
            _ => return None,
        };
        let value = &bindings.first()?.value;
        Some(match value {
            rasn_snmp::v2c::VarBindValue::Value(rasn_snmp::v2c::ObjectSyntax::Simple(
                rasn_snmp::v2c::SimpleSyntax::Integer(n),
            )) => ObjectSyntaxValue::Integer(*n),
            rasn_snmp::v2c::VarBindValue::Value(rasn_snmp::v2c::ObjectSyntax::Simple(
                rasn_snmp::v2c::SimpleSyntax::String(s),
            )) => ObjectSyntaxValue::String(s.to_vec()),
            _ => ObjectSyntaxValue::Other,
        })
    }
}

/// Turn whatever PDU kind the agent returned into the tagged `Pdu` this
/// crate folds loads from.
fn classify_pdu(raw: ObjectSyntaxValue) -> Pdu {
    match raw {
        ObjectSyntaxValue::Integer(n) => Pdu::Int(n),
        ObjectSyntaxValue::String(s) => Pdu::Str(String::from_utf8_lossy(&s).into_owned()),
        ObjectSyntaxValue::Other => Pdu::Unexpected("non-scalar or error PDU"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_pdu_unexpected_is_tagged() {
        let pdu = Pdu::Unexpected("non-scalar or error PDU");
        match pdu {
            Pdu::Unexpected(kind) => assert_eq!(kind, "non-scalar or error PDU"),
            _ => panic!("expected Unexpected"),
        }
    }

    #[tokio::test]
    async fn resolve_ips_localhost() {
        let probe = HostProbe::new("localhost", "user", "pass");
        let ips = probe.resolve_ips().await.expect("localhost must resolve");
        assert!(!ips.is_empty());
    }
}

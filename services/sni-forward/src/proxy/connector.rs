//! Upstream connection search.
//!
//! Candidates are tried in priority order: the resolved target, the target
//! on port 443, then the default host on the same two ports. Each
//! candidate is resolved through DNS, IPv4 addresses first, and every
//! address gets a fresh socket. The first connect that succeeds ends the
//! search. One deadline covers the whole search.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::policy::{RoutePolicy, SocketTuning};

/// Default connect timeout for the whole candidate search.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(8);

/// Port tried when the target port fails.
pub const FALLBACK_PORT: u16 = 443;

/// One (host, port) pair to attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CandidateEndpoint {
    pub host: String,
    pub port: u16,
}

impl CandidateEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for CandidateEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Build the ordered candidate list for a connection.
///
/// Never empty: the target itself is always first.
pub fn candidate_endpoints(
    policy: &RoutePolicy,
    target: &str,
    target_port: u16,
) -> Vec<CandidateEndpoint> {
    let with_fallback = policy.try_port_fallback_to_443 && target_port != FALLBACK_PORT;

    let mut candidates = vec![CandidateEndpoint::new(target, target_port)];
    if with_fallback {
        candidates.push(CandidateEndpoint::new(target, FALLBACK_PORT));
    }

    if let Some(default_host) = policy
        .default_upstream_host
        .as_deref()
        .filter(|h| !h.eq_ignore_ascii_case(target))
    {
        candidates.push(CandidateEndpoint::new(default_host, target_port));
        if with_fallback {
            candidates.push(CandidateEndpoint::new(default_host, FALLBACK_PORT));
        }
    }

    candidates
}

/// A connected upstream socket.
#[derive(Debug)]
pub struct Upstream {
    pub stream: TcpStream,
    /// The candidate that succeeded.
    pub endpoint: CandidateEndpoint,
    /// The resolved address that accepted.
    pub peer_addr: SocketAddr,
    /// Connect attempts made, including the successful one.
    pub attempts: u32,
}

/// Connects to the first reachable candidate.
#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    tuning: SocketTuning,
    connect_timeout: Duration,
}

impl UpstreamConnector {
    pub fn new(tuning: SocketTuning, connect_timeout: Duration) -> Self {
        Self {
            tuning,
            connect_timeout,
        }
    }

    pub fn for_policy(policy: &RoutePolicy) -> Self {
        Self::new(policy.tuning, policy.connect_timeout)
    }

    /// Try `candidates` in order. Returns `None` when every candidate
    /// fails, the deadline passes, or `cancel` fires.
    pub async fn connect(
        &self,
        candidates: &[CandidateEndpoint],
        cancel: &CancellationToken,
    ) -> Option<Upstream> {
        let deadline = Instant::now() + self.connect_timeout;
        let mut attempts = 0u32;

        for endpoint in candidates {
            let lookup = timeout_at(deadline, lookup_host((endpoint.host.as_str(), endpoint.port)));
            let addrs = match cancel.run_until_cancelled(lookup).await? {
                Ok(Ok(addrs)) => order_addresses(addrs),
                Ok(Err(e)) => {
                    warn!(host = %endpoint.host, error = %e, "DNS lookup failed");
                    continue;
                }
                Err(_) => {
                    warn!(host = %endpoint.host, "DNS lookup hit connect deadline");
                    return None;
                }
            };

            for addr in addrs {
                attempts += 1;
                let connect = timeout_at(deadline, self.connect_addr(addr));
                match cancel.run_until_cancelled(connect).await? {
                    Ok(Ok(stream)) => {
                        info!(
                            host = %endpoint.host,
                            addr = %addr,
                            port = endpoint.port,
                            "Upstream connected"
                        );
                        return Some(Upstream {
                            stream,
                            endpoint: endpoint.clone(),
                            peer_addr: addr,
                            attempts,
                        });
                    }
                    Ok(Err(e)) => {
                        warn!(
                            host = %endpoint.host,
                            addr = %addr,
                            port = endpoint.port,
                            error = %e,
                            "Upstream connect failed"
                        );
                    }
                    Err(_) => {
                        warn!(
                            host = %endpoint.host,
                            addr = %addr,
                            port = endpoint.port,
                            timeout_ms = self.connect_timeout.as_millis() as u64,
                            "Upstream connect hit deadline"
                        );
                        return None;
                    }
                }
            }
        }

        debug!(candidates = candidates.len(), attempts, "All upstream candidates failed");
        None
    }

    /// Open a fresh socket, tune it, and connect.
    async fn connect_addr(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        self.tuning.apply(SockRef::from(&socket));
        socket.set_nonblocking(true)?;

        TcpSocket::from_std_stream(socket.into())
            .connect(addr)
            .await
    }
}

/// IPv4 before IPv6, otherwise resolver order, duplicates removed.
fn order_addresses(addrs: impl IntoIterator<Item = SocketAddr>) -> Vec<SocketAddr> {
    let mut seen = HashSet::new();
    let mut ordered: Vec<SocketAddr> = addrs.into_iter().filter(|a| seen.insert(*a)).collect();
    ordered.sort_by_key(|a| a.is_ipv6());
    ordered
}

//! Route listener and per-connection supervisor.
//!
//! Each route owns one [`Listener`]. Accepted connections are handed to the
//! [`Supervisor`], which walks a small state machine:
//!
//! ```text
//! Accepted -> Sniffing -> Resolving -> Connecting -> Relaying -> Closed
//!                              |             |
//!                              +-> Closed    +-> Closed
//! ```
//!
//! Cancellation is a tree: process shutdown -> listener -> session ->
//! relay. Stopping a listener cancels its sessions and waits for them;
//! one pump finishing cancels only its own sibling.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::SockRef;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::connector::{candidate_endpoints, UpstreamConnector};
use super::policy::RoutePolicy;
use super::pump::{pump, Direction, PumpOutcome, PumpReport};
use super::resolver::{resolve_target, TargetDecision};
use super::sni::{ClientHelloSample, SniInspector, SniffConfig, SniffOutcome};

/// Pause after an accept error before accepting again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(200);

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being handled.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// ClientHello reads that failed or timed out.
    pub sniff_failed: AtomicU64,
    /// Connections dropped by target resolution.
    pub connections_dropped: AtomicU64,
    /// Connections where every upstream candidate failed.
    pub upstream_failed: AtomicU64,
    /// Sessions that reached the relaying state.
    pub sessions_relayed: AtomicU64,
    /// Bytes relayed to upstream, including the captured ClientHello.
    pub bytes_to_upstream: AtomicU64,
    /// Bytes relayed to downstream.
    pub bytes_to_downstream: AtomicU64,
}

/// Supervisor state for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    Sniffing,
    Resolving,
    Connecting,
    Relaying,
    Closed,
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// The client closed or failed before a ClientHello header arrived.
    SniffFailed(io::Error),
    /// Target resolution returned no host.
    Dropped { reason: String },
    /// Every upstream candidate failed.
    UpstreamUnavailable,
    /// Forwarding the captured bytes upstream failed.
    PrewriteFailed(io::Error),
    /// Shutdown fired before relaying started.
    Cancelled,
    /// Relay ran and one direction finished first.
    Relayed {
        first: Direction,
        to_upstream: PumpReport,
        to_downstream: PumpReport,
    },
}

/// Runs the per-connection pipeline for one route.
#[derive(Debug)]
pub struct Supervisor {
    policy: Arc<RoutePolicy>,
    inspector: SniInspector,
    connector: UpstreamConnector,
    stats: Arc<ListenerStats>,
}

impl Supervisor {
    pub fn with_sniff_config(policy: Arc<RoutePolicy>, sniff_config: SniffConfig) -> Self {
        Self {
            connector: UpstreamConnector::for_policy(&policy),
            inspector: SniInspector::with_config(sniff_config),
            policy,
            stats: Arc::new(ListenerStats::default()),
        }
    }

    pub fn policy(&self) -> &RoutePolicy {
        &self.policy
    }

    pub fn stats(&self) -> &Arc<ListenerStats> {
        &self.stats
    }

    /// Drive one accepted connection to completion.
    pub async fn handle_connection(
        &self,
        mut client: TcpStream,
        peer_addr: SocketAddr,
        cancel: CancellationToken,
    ) -> SessionEnd {
        let mut state = SessionState::Accepted;
        let end = self
            .run_session(&mut client, peer_addr, &cancel, &mut state)
            .await;
        transition(&mut state, SessionState::Closed);
        end
    }

    async fn run_session(
        &self,
        client: &mut TcpStream,
        peer_addr: SocketAddr,
        cancel: &CancellationToken,
        state: &mut SessionState,
    ) -> SessionEnd {
        self.policy.tuning.apply(SockRef::from(&*client));
        let local_port = match client.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => return SessionEnd::SniffFailed(e),
        };

        transition(state, SessionState::Sniffing);
        let sample = match self.inspector.inspect(client, cancel).await {
            SniffOutcome::Captured(sample) => sample,
            SniffOutcome::TimedOut(sample) => {
                self.stats.sniff_failed.fetch_add(1, Ordering::Relaxed);
                sample
            }
            SniffOutcome::Failed(e) => {
                self.stats.sniff_failed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "ClientHello read failed");
                return SessionEnd::SniffFailed(e);
            }
            SniffOutcome::Cancelled => return SessionEnd::Cancelled,
        };

        transition(state, SessionState::Resolving);
        let decision = resolve_target(&self.policy, sample.sni.as_deref());
        let target = match decision {
            TargetDecision::Sni(host) | TargetDecision::Default(host) => host,
            TargetDecision::Drop { reason } => {
                self.stats.connections_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    sni = sample.sni.as_deref().unwrap_or("null"),
                    reason = %reason,
                    "Dropping connection, no valid target host"
                );
                return SessionEnd::Dropped { reason };
            }
        };

        transition(state, SessionState::Connecting);
        let target_port = self.policy.target_port(local_port);
        let candidates = candidate_endpoints(&self.policy, &target, target_port);
        let Some(upstream) = self.connector.connect(&candidates, cancel).await else {
            if cancel.is_cancelled() {
                return SessionEnd::Cancelled;
            }
            self.stats.upstream_failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                sni = sample.sni.as_deref().unwrap_or("n/a"),
                candidates = candidates.len(),
                "All upstreams failed"
            );
            return SessionEnd::UpstreamUnavailable;
        };

        let mut upstream_stream = upstream.stream;
        if let Err(e) = forward_sample(&mut upstream_stream, &sample, cancel).await {
            warn!(error = %e, "Failed to forward ClientHello upstream");
            return SessionEnd::PrewriteFailed(e);
        }
        self.stats
            .bytes_to_upstream
            .fetch_add(sample.bytes.len() as u64, Ordering::Relaxed);

        transition(state, SessionState::Relaying);
        self.stats.sessions_relayed.fetch_add(1, Ordering::Relaxed);
        info!(
            downstream = %peer_addr,
            upstream = %upstream.peer_addr,
            host = %target,
            port = upstream.endpoint.port,
            sni = sample.sni.as_deref().unwrap_or("n/a"),
            "Session paired"
        );

        let end = self.relay(client, &mut upstream_stream, cancel).await;
        if let SessionEnd::Relayed {
            to_upstream,
            to_downstream,
            ..
        } = &end
        {
            self.stats
                .bytes_to_upstream
                .fetch_add(to_upstream.bytes, Ordering::Relaxed);
            self.stats
                .bytes_to_downstream
                .fetch_add(to_downstream.bytes, Ordering::Relaxed);
        }
        end
    }

    /// Run both pumps. The first to finish cancels the other, which is
    /// awaited before the sockets are dropped.
    async fn relay(
        &self,
        client: &mut TcpStream,
        upstream: &mut TcpStream,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let idle = self.policy.idle_close;
        let relay_cancel = cancel.child_token();

        let (mut client_read, mut client_write) = client.split();
        let (mut upstream_read, mut upstream_write) = upstream.split();

        let to_upstream = pump(
            &mut client_read,
            &mut upstream_write,
            idle,
            &relay_cancel,
            Direction::ClientToServer,
        );
        let to_downstream = pump(
            &mut upstream_read,
            &mut client_write,
            idle,
            &relay_cancel,
            Direction::ServerToClient,
        );
        tokio::pin!(to_upstream, to_downstream);

        let finished = tokio::select! {
            report = &mut to_upstream => Finished::ToUpstream(report),
            report = &mut to_downstream => Finished::ToDownstream(report),
        };
        relay_cancel.cancel();

        let (first, to_upstream, to_downstream) = match finished {
            Finished::ToUpstream(report) => {
                (Direction::ClientToServer, report, to_downstream.await)
            }
            Finished::ToDownstream(report) => {
                (Direction::ServerToClient, to_upstream.await, report)
            }
        };

        debug!(
            first = %first,
            bytes_to_upstream = to_upstream.bytes,
            bytes_to_downstream = to_downstream.bytes,
            "Session closed"
        );

        SessionEnd::Relayed {
            first,
            to_upstream,
            to_downstream,
        }
    }
}

enum Finished {
    ToUpstream(PumpReport),
    ToDownstream(PumpReport),
}

fn transition(state: &mut SessionState, next: SessionState) {
    debug!(from = ?*state, to = ?next, "Session state");
    *state = next;
}

/// Write the captured ClientHello bytes upstream and flush.
async fn forward_sample(
    upstream: &mut TcpStream,
    sample: &ClientHelloSample,
    cancel: &CancellationToken,
) -> io::Result<()> {
    if sample.bytes.is_empty() {
        return Ok(());
    }

    let write = async {
        upstream.write_all(&sample.bytes).await?;
        upstream.flush().await
    };
    cancel
        .run_until_cancelled(write)
        .await
        .unwrap_or_else(|| Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled")))
}

/// A bound TCP listener for one route.
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
    supervisor: Arc<Supervisor>,
}

impl Listener {
    /// Bind the route's listening socket.
    pub async fn bind(policy: RoutePolicy) -> io::Result<Self> {
        Self::bind_with_sniff_config(policy, SniffConfig::default()).await
    }

    pub async fn bind_with_sniff_config(
        policy: RoutePolicy,
        sniff_config: SniffConfig,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(policy.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            route = %policy.name,
            bind_addr = %local_addr,
            mirror_sni = policy.mirror_sni,
            mirror_port = policy.mirror_port,
            "Listener bound"
        );

        Ok(Self {
            listener,
            local_addr,
            supervisor: Arc::new(Supervisor::with_sniff_config(Arc::new(policy), sniff_config)),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get listener statistics.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(self.supervisor.stats())
    }

    /// Accept until `shutdown` fires, then close the socket, cancel the
    /// in-flight sessions and wait for them.
    pub async fn run(self, shutdown: CancellationToken) {
        let Self {
            listener,
            local_addr,
            supervisor,
        } = self;
        let route = supervisor.policy().name.clone();
        let stats = Arc::clone(supervisor.stats());
        let mut sessions = JoinSet::new();

        info!(route = %route, bind_addr = %local_addr, "Listener started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!(route = %route, error = %e, "Session task failed");
                    }
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                        stats.connections_active.fetch_add(1, Ordering::Relaxed);

                        let supervisor = Arc::clone(&supervisor);
                        let stats = Arc::clone(&stats);
                        let cancel = shutdown.child_token();

                        sessions.spawn(
                            async move {
                                let end = supervisor
                                    .handle_connection(stream, peer_addr, cancel)
                                    .await;
                                debug!(end = ?end, "Connection finished");

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            }
                            .instrument(tracing::info_span!(
                                "connection",
                                route = %route,
                                peer = %peer_addr
                            )),
                        );
                    }
                    Err(e) => {
                        error!(route = %route, error = %e, "Accept error");
                        // Brief sleep to avoid tight loop on persistent errors
                        let _ = shutdown
                            .run_until_cancelled(tokio::time::sleep(ACCEPT_ERROR_BACKOFF))
                            .await;
                    }
                },
            }
        }

        drop(listener);
        info!(
            route = %route,
            active_sessions = sessions.len(),
            "Listener stopping"
        );

        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                error!(route = %route, error = %e, "Session task failed");
            }
        }

        info!(route = %route, "Listener stopped");
    }

    /// Run on a task under a child of `shutdown`.
    pub fn spawn(self, shutdown: &CancellationToken) -> ListenerHandle {
        let cancel = shutdown.child_token();
        let local_addr = self.local_addr;
        let stats = self.stats();
        let task = tokio::spawn(self.run(cancel.clone()));

        ListenerHandle {
            local_addr,
            stats,
            cancel,
            task,
        }
    }
}

/// Handle to a running listener.
pub struct ListenerHandle {
    local_addr: SocketAddr,
    stats: Arc<ListenerStats>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Stop accepting, cancel in-flight sessions and wait for them.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(bind_addr = %self.local_addr, error = %e, "Listener task failed");
        }
    }
}

//! Blind L4 TLS forwarding.
//!
//! This module provides:
//! - Route listeners and the per-connection supervisor
//! - ClientHello capture and SNI extraction
//! - Target host resolution against per-route allow-lists
//! - Upstream candidate search with port and host fallback
//! - Bidirectional relay with idle close
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> SNI Inspector -> Resolver -> Connector -> Upstream
//!                                                        |
//!                                      ClientHello bytes forwarded first
//! ```
//!
//! The TLS session is never terminated. Everything after the captured
//! ClientHello is copied byte for byte in both directions.
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{Listener, RoutePolicy};
//!
//! let shutdown = CancellationToken::new();
//! let listener = Listener::bind(RoutePolicy::from_config(&route)?).await?;
//! let handle = listener.spawn(&shutdown);
//! // ...
//! handle.stop().await;
//! ```

mod connector;
mod listener;
mod policy;
mod pump;
mod resolver;
mod sni;

pub use connector::{
    candidate_endpoints, CandidateEndpoint, Upstream, UpstreamConnector, DEFAULT_CONNECT_TIMEOUT,
    FALLBACK_PORT,
};
pub use listener::{Listener, ListenerHandle, ListenerStats, SessionEnd, SessionState, Supervisor};
pub use policy::{RoutePolicy, SocketTuning};
pub use pump::{pump, Direction, PumpOutcome, PumpReport, PUMP_BUFFER_SIZE};
pub use resolver::{is_allowed, resolve_target, TargetDecision};
pub use sni::{
    normalize_hostname, parse_sni, ClientHelloSample, SniInspector, SniffConfig, SniffOutcome,
    DEFAULT_MAX_SNIFF_BYTES, DEFAULT_SNIFF_TIMEOUT,
};

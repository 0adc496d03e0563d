//! SNI forwarder library.
//!
//! Exposes the route configuration and the proxy pipeline so the binary
//! and the integration tests drive the same code.

pub mod config;
pub mod error;
pub mod proxy;

pub use config::{Config, ForwarderConfig, LogFormat, RouteConfig};
pub use error::ConfigError;
pub use proxy::{
    Listener, ListenerHandle, ListenerStats, RoutePolicy, SniInspector, SniffConfig, SniffOutcome,
    TargetDecision,
};

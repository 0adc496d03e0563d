//! Immutable per-route forwarding policy.
//!
//! A [`RoutePolicy`] is built once from a [`RouteConfig`] at startup and
//! shared read-only by the listener and every session it spawns. All
//! normalization (allow-list casing, blank entries, unit conversion)
//! happens here so the hot path only compares.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use socket2::SockRef;
use tracing::debug;

use super::sni::normalize_hostname;
use crate::config::RouteConfig;
use crate::error::ConfigError;

/// Socket options applied to both downstream and upstream sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketTuning {
    pub keep_alive: bool,
    pub no_delay: bool,
    pub recv_buffer_size: usize,
    pub send_buffer_size: usize,
}

impl Default for SocketTuning {
    fn default() -> Self {
        Self {
            keep_alive: true,
            no_delay: true,
            recv_buffer_size: 64 * 1024,
            send_buffer_size: 64 * 1024,
        }
    }
}

impl SocketTuning {
    /// Apply the options to a socket. Failures are logged and ignored.
    pub fn apply(&self, socket: SockRef<'_>) {
        if let Err(e) = socket.set_keepalive(self.keep_alive) {
            debug!(error = %e, "Failed to set SO_KEEPALIVE");
        }
        if let Err(e) = socket.set_tcp_nodelay(self.no_delay) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        if self.recv_buffer_size > 0 {
            if let Err(e) = socket.set_recv_buffer_size(self.recv_buffer_size) {
                debug!(error = %e, "Failed to set SO_RCVBUF");
            }
        }
        if self.send_buffer_size > 0 {
            if let Err(e) = socket.set_send_buffer_size(self.send_buffer_size) {
                debug!(error = %e, "Failed to set SO_SNDBUF");
            }
        }
    }
}

/// Forwarding policy for one listening route.
#[derive(Debug, Clone)]
pub struct RoutePolicy {
    /// Route name, used in logs.
    pub name: String,
    /// Address the route listens on.
    pub listen_addr: SocketAddr,
    /// Use the client's SNI as the upstream host.
    pub mirror_sni: bool,
    /// Use the local listening port as the upstream port.
    pub mirror_port: bool,
    /// Upstream port when not mirroring.
    pub upstream_port: Option<u16>,
    /// Fallback host when SNI is absent or not allowed.
    pub default_upstream_host: Option<String>,
    /// Exact hostnames allowed (normalized).
    pub allowed_hosts: Vec<String>,
    /// Allowed domain suffixes (normalized, no leading or trailing dots).
    pub allowed_suffixes: Vec<String>,
    /// Drop connections whose SNI is present but not allowed.
    pub reject_if_no_valid_sni: bool,
    /// Socket options.
    pub tuning: SocketTuning,
    /// Deadline for the whole upstream connect search.
    pub connect_timeout: Duration,
    /// Close a relay direction after this long without data.
    pub idle_close: Option<Duration>,
    /// Also try port 443 when the target port differs.
    pub try_port_fallback_to_443: bool,
}

impl RoutePolicy {
    /// Build a policy from its file representation.
    pub fn from_config(route: &RouteConfig) -> Result<Self, ConfigError> {
        let ip: IpAddr =
            route
                .listen_ip
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidListenIp {
                    route: route.name.clone(),
                    value: route.listen_ip.clone(),
                })?;

        let allowed_hosts = route
            .allowed_hosts
            .iter()
            .flatten()
            .map(|h| normalize_hostname(h.trim()))
            .filter(|h| !h.is_empty())
            .collect();

        let allowed_suffixes = route
            .allowed_suffixes
            .iter()
            .flatten()
            .map(|s| s.trim().trim_matches('.').to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        let default_upstream_host = route
            .default_upstream_host
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string);

        Ok(Self {
            name: route.name.clone(),
            listen_addr: SocketAddr::new(ip, route.listen_port),
            mirror_sni: route.mirror_sni,
            mirror_port: route.mirror_port,
            upstream_port: route.upstream_port,
            default_upstream_host,
            allowed_hosts,
            allowed_suffixes,
            reject_if_no_valid_sni: route.reject_if_no_valid_sni,
            tuning: SocketTuning {
                keep_alive: route.tcp_keep_alive,
                no_delay: route.tcp_no_delay,
                recv_buffer_size: route.receive_buffer_size,
                send_buffer_size: route.send_buffer_size,
            },
            connect_timeout: Duration::from_millis(route.connect_timeout_ms),
            idle_close: (route.idle_close_seconds > 0)
                .then(|| Duration::from_secs(route.idle_close_seconds)),
            try_port_fallback_to_443: route.try_port_fallback_to_443,
        })
    }

    /// Upstream port for a connection accepted on `local_port`.
    pub fn target_port(&self, local_port: u16) -> u16 {
        if self.mirror_port {
            local_port
        } else {
            self.upstream_port.unwrap_or(local_port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_defaults() {
        let policy = RoutePolicy::from_config(&RouteConfig::new("fcm-443", 443)).unwrap();

        assert_eq!(policy.listen_addr, "0.0.0.0:443".parse().unwrap());
        assert!(policy.mirror_sni);
        assert!(policy.mirror_port);
        assert!(policy.try_port_fallback_to_443);
        assert_eq!(policy.tuning, SocketTuning::default());
        assert_eq!(policy.connect_timeout, Duration::from_secs(8));
        assert!(policy.idle_close.is_none());
        assert!(policy.default_upstream_host.is_none());
    }

    #[test]
    fn test_from_config_normalizes_allow_lists() {
        let mut route = RouteConfig::new("mtalk", 5228);
        route.allowed_hosts = Some(vec![
            "MTALK.Google.com.".into(),
            "  ".into(),
            " Alt.Google.com ".into(),
        ]);
        route.allowed_suffixes = Some(vec![".Google.COM.".into(), "".into()]);
        route.default_upstream_host = Some("   ".into());
        route.idle_close_seconds = 30;

        let policy = RoutePolicy::from_config(&route).unwrap();
        assert_eq!(policy.allowed_hosts, vec!["mtalk.google.com", "alt.google.com"]);
        assert_eq!(policy.allowed_suffixes, vec!["google.com"]);
        assert!(policy.default_upstream_host.is_none());
        assert_eq!(policy.idle_close, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_from_config_rejects_bad_listen_ip() {
        let mut route = RouteConfig::new("bad", 443);
        route.listen_ip = "not-an-ip".into();

        match RoutePolicy::from_config(&route) {
            Err(ConfigError::InvalidListenIp { route, value }) => {
                assert_eq!(route, "bad");
                assert_eq!(value, "not-an-ip");
            }
            other => panic!("Expected InvalidListenIp, got {:?}", other),
        }
    }

    #[test]
    fn test_target_port() {
        let mut route = RouteConfig::new("r", 5228);
        let policy = RoutePolicy::from_config(&route).unwrap();
        assert_eq!(policy.target_port(5228), 5228);

        route.mirror_port = false;
        route.upstream_port = Some(443);
        let policy = RoutePolicy::from_config(&route).unwrap();
        assert_eq!(policy.target_port(5228), 443);

        route.upstream_port = None;
        let policy = RoutePolicy::from_config(&route).unwrap();
        assert_eq!(policy.target_port(5229), 5229);
    }
}

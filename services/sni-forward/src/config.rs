//! Forwarder configuration.
//!
//! Two layers:
//! - [`Config`]: process settings read from the environment (where the
//!   route file lives, how to log).
//! - [`ForwarderConfig`]: the JSON route file. A missing file is replaced
//!   by a generated default that is written to disk and then used.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::proxy::RoutePolicy;

/// Default route file path, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "appsettings.json";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

/// Process settings (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Route file path.
    pub config_path: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,
}

impl Config {
    /// Load settings from environment variables.
    pub fn from_env() -> Self {
        let config_path = std::env::var("SNI_FORWARD_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let log_level =
            std::env::var("SNI_FORWARD_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let log_format = match std::env::var("SNI_FORWARD_LOG_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("text") => LogFormat::Text,
            _ => LogFormat::Json,
        };

        Self {
            config_path,
            log_level,
            log_format,
        }
    }
}

/// Route file contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwarderConfig {
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// One route as written in the route file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    pub name: String,

    #[serde(default = "default_listen_ip")]
    pub listen_ip: String,

    pub listen_port: u16,

    /// Use the client SNI as the upstream host.
    #[serde(default = "default_true")]
    pub mirror_sni: bool,

    /// Upstream port = local listening port.
    #[serde(default = "default_true")]
    pub mirror_port: bool,

    /// Upstream port when not mirroring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_port: Option<u16>,

    /// Fallback when SNI is missing or not allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_upstream_host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_hosts: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_suffixes: Option<Vec<String>>,

    #[serde(default)]
    pub reject_if_no_valid_sni: bool,

    #[serde(default = "default_true")]
    pub tcp_keep_alive: bool,

    #[serde(default = "default_true")]
    pub tcp_no_delay: bool,

    #[serde(default = "default_buffer_size")]
    pub receive_buffer_size: usize,

    #[serde(default = "default_buffer_size")]
    pub send_buffer_size: usize,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// 0 disables idle close.
    #[serde(default)]
    pub idle_close_seconds: u64,

    /// Also try 443 when the target port differs (commonly allowed outbound).
    #[serde(default = "default_true")]
    pub try_port_fallback_to_443: bool,
}

fn default_listen_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_buffer_size() -> usize {
    64 * 1024
}

fn default_connect_timeout_ms() -> u64 {
    8000
}

impl RouteConfig {
    /// A route with every optional field at its default.
    pub fn new(name: impl Into<String>, listen_port: u16) -> Self {
        Self {
            name: name.into(),
            listen_ip: default_listen_ip(),
            listen_port,
            mirror_sni: true,
            mirror_port: true,
            upstream_port: None,
            default_upstream_host: None,
            allowed_hosts: None,
            allowed_suffixes: None,
            reject_if_no_valid_sni: false,
            tcp_keep_alive: true,
            tcp_no_delay: true,
            receive_buffer_size: default_buffer_size(),
            send_buffer_size: default_buffer_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            idle_close_seconds: 0,
            try_port_fallback_to_443: true,
        }
    }
}

impl ForwarderConfig {
    /// The generated default: FCM on 443 and the mtalk push ports.
    pub fn example() -> Self {
        let mut fcm = RouteConfig::new("fcm-443", 443);
        fcm.allowed_suffixes = Some(vec!["googleapis.com".into(), "google.com".into()]);
        fcm.default_upstream_host = Some("fcm.googleapis.com".into());

        let mtalk = |port: u16| {
            let mut route = RouteConfig::new(format!("mtalk-{port}"), port);
            route.allowed_suffixes = Some(vec!["google.com".into()]);
            route.default_upstream_host = Some("mtalk.google.com".into());
            route
        };

        Self {
            routes: vec![fcm, mtalk(5228), mtalk(5229), mtalk(5230)],
        }
    }

    /// Load the route file, generating and persisting the default when it
    /// does not exist.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Self::example();
            config.save(path)?;
            info!(
                path = %path.display(),
                route_count = config.routes.len(),
                "Route file not found, generated default"
            );
            return Ok(config);
        }

        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and parse the route file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        debug!(
            path = %path.display(),
            route_count = config.routes.len(),
            "Loaded route file"
        );

        Ok(config)
    }

    /// Save the route file atomically (write temp, rename).
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }

        let content = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, content).map_err(write_err)?;
        fs::rename(&tmp_path, path).map_err(write_err)?;

        Ok(())
    }

    /// Check the route list is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.policies().map(|_| ())
    }

    /// Build the immutable policy for every route.
    pub fn policies(&self) -> Result<Vec<RoutePolicy>, ConfigError> {
        if self.routes.is_empty() {
            return Err(ConfigError::NoRoutes);
        }

        let mut seen = HashMap::new();
        let mut policies = Vec::with_capacity(self.routes.len());

        for route in &self.routes {
            let policy = RoutePolicy::from_config(route)?;

            // Port 0 asks the OS for a fresh port each time.
            if policy.listen_addr.port() != 0 {
                if let Some(first) = seen.insert(policy.listen_addr, policy.name.clone()) {
                    return Err(ConfigError::DuplicateBind {
                        first,
                        second: policy.name.clone(),
                        addr: policy.listen_addr,
                    });
                }
            }

            policies.push(policy);
        }

        Ok(policies)
    }
}

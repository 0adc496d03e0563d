//! Error types for route configuration.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Could not read the route file.
    #[error("config_read_failed: {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Could not persist the generated default route file.
    #[error("config_write_failed: {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Route file is not valid JSON for the expected schema.
    #[error("config_parse_failed: {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Could not serialize the route file.
    #[error("config_serialize_failed: {0}")]
    Serialize(#[source] serde_json::Error),

    /// Route list missing or empty.
    #[error("no_routes: no routes configured")]
    NoRoutes,

    /// A route has a listen IP that does not parse.
    #[error("invalid_listen_ip: route {route}: '{value}'")]
    InvalidListenIp { route: String, value: String },

    /// Two routes bind the same address.
    #[error("duplicate_bind: routes {first} and {second} both bind {addr}")]
    DuplicateBind {
        first: String,
        second: String,
        addr: SocketAddr,
    },
}

impl ConfigError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ConfigError::Read { .. } => "config_read_failed",
            ConfigError::Write { .. } => "config_write_failed",
            ConfigError::Parse { .. } => "config_parse_failed",
            ConfigError::Serialize(_) => "config_serialize_failed",
            ConfigError::NoRoutes => "no_routes",
            ConfigError::InvalidListenIp { .. } => "invalid_listen_ip",
            ConfigError::DuplicateBind { .. } => "duplicate_bind",
        }
    }
}

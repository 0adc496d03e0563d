//! Target host resolution from route policy and SNI.
//!
//! Rules:
//! - With SNI mirroring on and an SNI present, the normalized SNI is used
//!   when the allow-lists accept it.
//! - A present but disallowed SNI is dropped when the route rejects
//!   invalid SNI, otherwise it falls back to the default host.
//! - A missing SNI always falls back to the default host, regardless of
//!   the reject flag.

use tracing::debug;

use super::policy::RoutePolicy;
use super::sni::normalize_hostname;

/// Result of target resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetDecision {
    /// The client's SNI passed the allow-lists.
    Sni(String),
    /// The route's default upstream host.
    Default(String),
    /// No usable target, close the connection.
    Drop { reason: String },
}

impl TargetDecision {
    /// The host to connect to, if any.
    pub fn host(&self) -> Option<&str> {
        match self {
            TargetDecision::Sni(host) | TargetDecision::Default(host) => Some(host),
            TargetDecision::Drop { .. } => None,
        }
    }
}

/// Check a normalized hostname against the route's allow-lists.
///
/// Exact hosts and suffixes are alternatives. A host equal to a suffix
/// matches it. With no lists configured anything is allowed.
pub fn is_allowed(policy: &RoutePolicy, host: &str) -> bool {
    if policy.allowed_hosts.is_empty() && policy.allowed_suffixes.is_empty() {
        return true;
    }

    if policy.allowed_hosts.iter().any(|h| h == host) {
        return true;
    }

    policy.allowed_suffixes.iter().any(|suffix| {
        host == suffix
            || host
                .strip_suffix(suffix.as_str())
                .is_some_and(|rest| rest.ends_with('.'))
    })
}

/// Decide the upstream host for a connection.
pub fn resolve_target(policy: &RoutePolicy, sni: Option<&str>) -> TargetDecision {
    let sni = sni.map(normalize_hostname).filter(|h| !h.trim().is_empty());

    if policy.mirror_sni {
        if let Some(host) = sni.as_deref() {
            if is_allowed(policy, host) {
                return TargetDecision::Sni(host.to_string());
            }

            if policy.reject_if_no_valid_sni {
                return TargetDecision::Drop {
                    reason: format!("SNI '{}' not allowed on route {}", host, policy.name),
                };
            }

            debug!(sni = %host, route = %policy.name, "SNI not allowed, using default host");
        }
    }

    match &policy.default_upstream_host {
        Some(host) => TargetDecision::Default(host.clone()),
        None => TargetDecision::Drop {
            reason: format!("no default upstream host on route {}", policy.name),
        },
    }
}

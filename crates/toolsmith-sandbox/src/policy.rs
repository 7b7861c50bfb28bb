//! Network policy for tool egress
//!
//! Allow/deny host lists with `*.domain` wildcards. Deny takes precedence.
//! Local destinations (loopback, private and link-local addresses,
//! `localhost`) are denied unless `allow_loopback` is set.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Outbound host policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkPolicy {
    /// Allowed hosts (supports `*` and `*.example.com`)
    pub allowed_hosts: Vec<String>,
    /// Denied hosts (takes precedence over allowed)
    pub denied_hosts: Vec<String>,
    /// Whether local destinations are reachable
    pub allow_loopback: bool,
}

impl Default for NetworkPolicy {
    /// Public internet allowed, local network denied
    fn default() -> Self {
        Self {
            allowed_hosts: vec!["*".to_string()],
            denied_hosts: Vec::new(),
            allow_loopback: false,
        }
    }
}

impl NetworkPolicy {
    /// Policy that blocks all network access
    #[must_use]
    pub fn block_all() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            denied_hosts: Vec::new(),
            allow_loopback: false,
        }
    }

    /// Policy allowing only the listed hosts
    #[must_use]
    pub fn with_allowed_hosts(hosts: Vec<String>) -> Self {
        Self {
            allowed_hosts: hosts,
            ..Self::block_all()
        }
    }

    /// Check if a host is allowed
    #[must_use]
    pub fn is_host_allowed(&self, host: &str) -> bool {
        let host = normalize_host(host);
        if host.is_empty() {
            return false;
        }

        if self.denied_hosts.iter().any(|p| host_matches(&host, p)) {
            return false;
        }

        if is_local_host(&host) {
            return self.allow_loopback;
        }

        self.allowed_hosts.iter().any(|p| host_matches(&host, p))
    }

    /// Runtime permission flags for this policy
    ///
    /// `--allow-net` carries exact host lists as-is and widens for wildcards.
    /// Whenever network access is granted, `--deny-net` names the denied
    /// hosts (wildcards by their base domain) and, unless loopback is
    /// allowed, the well-known local and metadata destinations, so raw
    /// sockets cannot reach them either.
    #[must_use]
    pub fn runtime_flags(&self) -> Vec<String> {
        if self.allowed_hosts.is_empty() && !self.allow_loopback {
            return Vec::new();
        }

        let widened = self.allow_loopback || self.allowed_hosts.iter().any(|h| h.contains('*'));
        let allow = if widened {
            "--allow-net".to_string()
        } else {
            let hosts: Vec<String> = self.allowed_hosts.iter().map(|h| normalize_host(h)).collect();
            format!("--allow-net={}", hosts.join(","))
        };

        let mut denied: Vec<String> = Vec::new();
        for pattern in &self.denied_hosts {
            let host = normalize_host(pattern);
            let host = host.strip_prefix("*.").map_or(host.clone(), str::to_string);
            if !host.is_empty() && host != "*" && !denied.contains(&host) {
                denied.push(host);
            }
        }
        if !self.allow_loopback {
            for host in LOCAL_DESTINATIONS {
                let host = (*host).to_string();
                if !denied.contains(&host) {
                    denied.push(host);
                }
            }
        }

        let mut flags = vec![allow];
        if !denied.is_empty() {
            flags.push(format!("--deny-net={}", denied.join(",")));
        }
        flags
    }
}

/// Local and metadata hosts denied at the runtime level when loopback is off
const LOCAL_DESTINATIONS: &[&str] = &[
    "localhost",
    "127.0.0.1",
    "0.0.0.0",
    "[::1]",
    "169.254.169.254",
    "metadata.google.internal",
];

/// Lowercase, strip IPv6 brackets and a trailing dot
fn normalize_host(host: &str) -> String {
    host.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_lowercase()
}

/// Match host against a pattern; a `*.` pattern also matches its base domain
fn host_matches(host: &str, pattern: &str) -> bool {
    let pattern = normalize_host(pattern);
    if pattern == "*" {
        return true;
    }
    match pattern.strip_prefix("*.") {
        Some(base) => host == base || host.ends_with(&format!(".{base}")),
        None => host == pattern,
    }
}

fn is_local_host(host: &str) -> bool {
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
        }
        Ok(IpAddr::V6(ip)) => {
            let first = ip.segments()[0];
            ip.is_loopback()
                || ip.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
        Err(_) => false,
    }
}

// Configuration: serde-backed file format plus the hot-swappable runtime
// snapshot every request handler reads.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::error::ProxyError;

/// Minimum log level emitted, as configured by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Directive understood by the tracing-subscriber EnvFilter.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

/// Operator-settable configuration.
///
/// `server_ip`/`server_port` require a restart (the socket is bound once);
/// every other key is hot-applied by publishing a new snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// UDP bind host, also advertised in Via and Record-Route.
    pub server_ip: String,
    /// UDP bind port.
    pub server_port: u16,
    /// username → password map for Digest verification.
    pub users: HashMap<String, String>,
    /// Peers matching these CIDR prefixes or hosts are exempt from NAT
    /// rewriting.
    pub local_networks: Vec<String>,
    /// Collapse every peer to loopback (single-machine testing mode).
    pub force_local_addr: bool,
    pub log_level: LogLevel,
    /// Merge all milestones of one Call-ID into a single CDR row.
    pub cdr_merge_mode: bool,
    /// Server-side maximum contact binding lifetime in seconds.
    pub registration_expires: u32,
    /// Default Max-Forwards applied when a request arrives without one.
    pub max_forwards: u32,
    /// Root directory for the daily CDR buckets.
    pub cdr_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_ip: "0.0.0.0".to_string(),
            server_port: 5060,
            users: HashMap::new(),
            local_networks: vec!["127.0.0.1".to_string()],
            force_local_addr: false,
            log_level: LogLevel::default(),
            cdr_merge_mode: true,
            registration_expires: 3600,
            max_forwards: 70,
            cdr_dir: "CDR".to_string(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.server_ip.is_empty() {
            errors.push("server_ip must not be empty".to_string());
        } else if self.server_ip.parse::<IpAddr>().is_err() {
            errors.push(format!("server_ip is not an IP address: {}", self.server_ip));
        }
        if self.server_port == 0 {
            errors.push("server_port must not be 0".to_string());
        }
        if self.registration_expires == 0 {
            errors.push("registration_expires must be positive".to_string());
        }
        if self.max_forwards == 0 {
            errors.push("max_forwards must be positive".to_string());
        }
        for pattern in &self.local_networks {
            if !is_valid_network_pattern(pattern) {
                errors.push(format!("invalid local network entry: {}", pattern));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// A peer is local when it matches the configured networks or is the
    /// server's own address. Local peers keep their Contact as sent.
    pub fn is_local_peer(&self, ip: IpAddr) -> bool {
        if ip.to_string() == self.server_ip {
            return true;
        }
        self.local_networks
            .iter()
            .any(|pattern| network_matches(pattern, ip))
    }
}

/// Load a JSON config file.
pub fn load_from_file(path: &Path) -> Result<Config, ProxyError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ProxyError::Config(format!("failed to read {}: {}", path.display(), e)))?;
    serde_json::from_str(&content)
        .map_err(|e| ProxyError::Config(format!("failed to parse {}: {}", path.display(), e)))
}

/// The snapshot handle shared across the engine.
///
/// Readers take one `Arc<Config>` per request and use it for the whole
/// request; writers publish a complete replacement. No field is ever
/// mutated in place.
#[derive(Debug)]
pub struct SharedConfig {
    inner: RwLock<Arc<Config>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        SharedConfig {
            inner: RwLock::new(Arc::new(config)),
        }
    }

    /// Current snapshot. Cheap: clones the Arc, not the config.
    pub fn load(&self) -> Arc<Config> {
        self.inner.read().expect("config lock poisoned").clone()
    }

    /// Atomically replace the snapshot. In-flight requests keep the
    /// snapshot they already loaded.
    pub fn store(&self, config: Config) {
        *self.inner.write().expect("config lock poisoned") = Arc::new(config);
    }
}

fn is_valid_network_pattern(pattern: &str) -> bool {
    if pattern == "localhost" {
        return true;
    }
    match pattern.split_once('/') {
        Some((base, prefix)) => {
            base.parse::<Ipv4Addr>().is_ok()
                && prefix.parse::<u8>().map(|p| p <= 32).unwrap_or(false)
        }
        None => pattern.parse::<IpAddr>().is_ok(),
    }
}

/// Match an IP against one configured entry: exact host, `localhost`, or an
/// IPv4 CIDR prefix like `192.168.0.0/16`.
fn network_matches(pattern: &str, ip: IpAddr) -> bool {
    if pattern == "localhost" {
        return ip.is_loopback();
    }
    if let Some((base, prefix)) = pattern.split_once('/') {
        let (base, prefix, ip4) = match (
            base.parse::<Ipv4Addr>(),
            prefix.parse::<u8>(),
            ip,
        ) {
            (Ok(b), Ok(p), IpAddr::V4(v4)) if p <= 32 => (b, p, v4),
            _ => return false,
        };
        if prefix == 0 {
            return true;
        }
        let mask = u32::MAX << (32 - u32::from(prefix));
        return (u32::from(base) & mask) == (u32::from(ip4) & mask);
    }
    pattern
        .parse::<IpAddr>()
        .map(|p| p == ip)
        .unwrap_or(false)
}

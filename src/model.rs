//! Sources, configs, whitelists and the stats projection.

use crate::config::EngineConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

pub type SourceId = u64;
pub type ConfigId = u64;
pub type WhitelistId = u64;

/// Proxy protocols understood by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    Ssr,
    Hysteria2,
    Tuic,
}

impl Protocol {
    /// Map a URI scheme or Clash `type` onto a protocol.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "vmess" => Some(Protocol::Vmess),
            "vless" => Some(Protocol::Vless),
            "trojan" => Some(Protocol::Trojan),
            "ss" | "shadowsocks" => Some(Protocol::Shadowsocks),
            "ssr" | "shadowsocksr" => Some(Protocol::Ssr),
            "hy2" | "hysteria2" => Some(Protocol::Hysteria2),
            "tuic" => Some(Protocol::Tuic),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Vmess => "vmess",
            Protocol::Vless => "vless",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "shadowsocks",
            Protocol::Ssr => "ssr",
            Protocol::Hysteria2 => "hysteria2",
            Protocol::Tuic => "tuic",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Natural key of a config: `(protocol, server, port)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigKey {
    pub protocol: Protocol,
    pub server: String,
    pub port: u16,
}

impl ConfigKey {
    /// Create a key, normalizing the server so equal endpoints compare equal.
    pub fn new(protocol: Protocol, server: &str, port: u16) -> Self {
        Self {
            protocol,
            server: normalize_server(server),
            port,
        }
    }

    /// The server as an IP address, if it is a literal.
    pub fn ip(&self) -> Option<IpAddr> {
        self.server.parse().ok()
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip() {
            Some(IpAddr::V6(ip)) => write!(f, "{}://[{}]:{}", self.protocol, ip, self.port),
            _ => write!(f, "{}://{}:{}", self.protocol, self.server, self.port),
        }
    }
}

pub(crate) fn normalize_server(server: &str) -> String {
    let trimmed = server
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.');
    match trimmed.parse::<IpAddr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => trimmed.to_ascii_lowercase(),
    }
}

/// A config as discovered in a subscription payload, before probing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDescriptor {
    pub key: ConfigKey,
    pub remarks: String,
    /// The share line (or serialized feed entry) the descriptor was read from.
    pub raw: String,
}

/// Outcome of probing one config.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Mean round-trip time of successful attempts; `None` when unreachable.
    pub ping_ms: Option<f64>,
    /// Spread (max - min) of successful attempts.
    pub jitter_ms: Option<f64>,
    /// Percentage of attempts without a response.
    pub packet_loss: f64,
    pub reachable: bool,
}

impl ProbeResult {
    pub fn unreachable() -> Self {
        Self {
            ping_ms: None,
            jitter_ms: None,
            packet_loss: 100.0,
            reachable: false,
        }
    }

    /// Build a result from the round-trip times of successful attempts.
    pub fn from_samples(samples_ms: &[f64], attempts: usize) -> Self {
        if samples_ms.is_empty() || attempts == 0 {
            return Self::unreachable();
        }
        let answered = samples_ms.len().min(attempts);
        let mean = samples_ms.iter().sum::<f64>() / samples_ms.len() as f64;
        let max = samples_ms.iter().copied().fold(f64::MIN, f64::max);
        let min = samples_ms.iter().copied().fold(f64::MAX, f64::min);
        Self {
            ping_ms: Some(mean.max(0.0)),
            jitter_ms: Some((max - min).max(0.0)),
            packet_loss: (attempts - answered) as f64 / attempts as f64 * 100.0,
            reachable: true,
        }
    }

    /// Whether the result meets the activation thresholds.
    pub fn meets(&self, config: &EngineConfig) -> bool {
        match self.ping_ms {
            Some(ping) => {
                self.reachable
                    && self.packet_loss < config.max_packet_loss
                    && ping <= config.max_ping_ms
            }
            None => false,
        }
    }
}

/// A subscription source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    /// Lower values are fetched first and win duplicate endpoints.
    pub priority: i32,
    pub config_count: usize,
    /// Exponentially weighted fetch success rate, in percent.
    pub success_rate: f64,
    pub fetch_attempts: u64,
    pub fetch_successes: u64,
    pub last_fetched: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Source {
    /// Fold one fetch outcome into the counters and the moving average.
    pub fn record_fetch_outcome(
        &mut self,
        success: bool,
        config_count: Option<usize>,
        at: DateTime<Utc>,
        alpha: f64,
    ) {
        let sample = if success { 100.0 } else { 0.0 };
        self.success_rate = if self.fetch_attempts == 0 {
            sample
        } else {
            alpha * sample + (1.0 - alpha) * self.success_rate
        }
        .clamp(0.0, 100.0);

        self.fetch_attempts += 1;
        if success {
            self.fetch_successes += 1;
            self.last_fetched = Some(at);
        }
        if let Some(count) = config_count {
            self.config_count = count;
        }
    }
}

/// Operator input for a new source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSource {
    pub name: String,
    pub url: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
}

fn default_priority() -> i32 {
    1
}

/// A committed config with its latest measurements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub id: ConfigId,
    pub source_id: SourceId,
    pub protocol: Protocol,
    pub server: String,
    pub port: u16,
    pub remarks: String,
    pub raw: String,
    pub ping_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub packet_loss: f64,
    pub is_active: bool,
    pub last_seen_cycle: u64,
    pub last_check: Option<DateTime<Utc>>,
}

impl Config {
    pub fn key(&self) -> ConfigKey {
        ConfigKey {
            protocol: self.protocol,
            server: self.server.clone(),
            port: self.port,
        }
    }
}

/// Whether a whitelist host entry is an address or a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKind {
    Ip,
    Domain,
}

/// One entry of a whitelist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub value: String,
    pub kind: HostKind,
    pub description: String,
    pub country: String,
    pub is_active: bool,
    pub added_at: DateTime<Utc>,
}

/// Operator input for a new host entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewHost {
    pub host: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub country: String,
}

/// An operator-curated allow-list of hosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Whitelist {
    pub id: WhitelistId,
    pub name: String,
    pub description: String,
    pub is_active: bool,
    pub hosts: Vec<Host>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Whitelist {
    pub fn hosts_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn active_hosts(&self) -> usize {
        self.hosts.iter().filter(|h| h.is_active).count()
    }
}

/// Operator input for a new whitelist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWhitelist {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Aggregate statistics, always recomputed from committed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub total_sources: usize,
    pub enabled_sources: usize,
    pub total_configs: usize,
    pub active_configs: usize,
    pub avg_ping: f64,
    /// Distinct IP-literal servers among active configs.
    pub target_ips: Vec<String>,
    pub domain: String,
    pub last_update: Option<DateTime<Utc>>,
    pub update_interval_secs: u64,
}

impl Stats {
    pub fn project(
        sources: &[Source],
        configs: &[Config],
        config: &EngineConfig,
        last_update: Option<DateTime<Utc>>,
    ) -> Self {
        let active: Vec<&Config> = configs.iter().filter(|c| c.is_active).collect();
        let pings: Vec<f64> = active.iter().filter_map(|c| c.ping_ms).collect();
        let avg_ping = if pings.is_empty() {
            0.0
        } else {
            pings.iter().sum::<f64>() / pings.len() as f64
        };
        let target_ips: BTreeSet<String> = active
            .iter()
            .filter_map(|c| c.server.parse::<IpAddr>().ok())
            .map(|ip| ip.to_string())
            .collect();

        Self {
            total_sources: sources.len(),
            enabled_sources: sources.iter().filter(|s| s.enabled).count(),
            total_configs: configs.len(),
            active_configs: active.len(),
            avg_ping,
            target_ips: target_ips.into_iter().collect(),
            domain: config.probe_domain.clone(),
            last_update,
            update_interval_secs: config.update_interval.as_secs(),
        }
    }
}

/// Result of one aggregation cycle, reported to whoever triggered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateReport {
    pub cycle: u64,
    pub active_configs: usize,
    pub total_configs: usize,
    pub sources_ok: usize,
    pub sources_failed: usize,
    pub skipped_lines: usize,
    pub filtered_configs: usize,
}

//! Configuration for the aggregation engine.

use crate::error::ConfigError;
use std::str::FromStr;
use std::time::Duration;

/// How whitelist domain entries are compared against config hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainMatch {
    /// The host must equal the entry.
    Exact,
    /// The host must equal the entry or be one of its subdomains.
    Suffix,
}

impl FromStr for DomainMatch {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Ok(DomainMatch::Exact),
            "suffix" => Ok(DomainMatch::Suffix),
            _ => Err(()),
        }
    }
}

/// Configuration for the aggregation engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Latency ceiling for an active config, in milliseconds.
    pub max_ping_ms: f64,
    /// Packet loss (percent) a config must stay strictly below to be active.
    pub max_packet_loss: f64,
    /// Maximum number of simultaneously active configs.
    pub max_configs: usize,
    /// Interval between scheduled cycles.
    pub update_interval: Duration,
    /// Timeout of a single reachability attempt.
    pub probe_timeout: Duration,
    /// Reachability attempts per probe.
    pub probe_attempts: usize,
    /// Maximum number of probes in flight.
    pub probe_concurrency: usize,
    /// Domain reported in the stats projection.
    pub probe_domain: String,
    /// Timeout of a single subscription request.
    pub fetch_timeout: Duration,
    /// Retries after a transient fetch failure.
    pub fetch_retries: usize,
    /// Base delay of the exponential retry backoff.
    pub retry_backoff: Duration,
    /// Global pace of outbound subscription requests.
    pub fetch_rate_per_second: f64,
    /// Cycles a config may be absent before it is deleted.
    pub stale_after_cycles: u64,
    /// Weight of the newest outcome in the success-rate moving average.
    pub success_rate_alpha: f64,
    /// Count a fetch that yields zero valid configs as a failure.
    pub empty_payload_is_failure: bool,
    /// Whitelist domain matching policy.
    pub domain_match: DomainMatch,
    /// User-Agent sent with subscription requests.
    pub user_agent: String,
}

impl EngineConfig {
    /// Create a new configuration builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Build a configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = EngineConfigBuilder::new();

        if let Some(v) = parse_var::<f64, _>(&lookup, "MAX_PING_MS")? {
            builder = builder.max_ping_ms(v);
        }
        if let Some(v) = parse_var::<f64, _>(&lookup, "MAX_PACKET_LOSS")? {
            builder = builder.max_packet_loss(v);
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "MAX_CONFIGS")? {
            builder = builder.max_configs(v);
        }
        if let Some(hours) = parse_var::<u64, _>(&lookup, "UPDATE_INTERVAL")? {
            let secs = hours.checked_mul(3600).ok_or_else(|| ConfigError {
                var: "UPDATE_INTERVAL",
                value: hours.to_string(),
            })?;
            builder = builder.update_interval(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "PING_TIMEOUT")? {
            builder = builder.probe_timeout(Duration::from_secs(secs));
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "PROBE_ATTEMPTS")? {
            builder = builder.probe_attempts(v);
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "PROBE_CONCURRENCY")? {
            builder = builder.probe_concurrency(v);
        }
        if let Some(domain) = lookup("XPERT_DOMAIN") {
            builder = builder.probe_domain(domain);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "FETCH_TIMEOUT")? {
            builder = builder.fetch_timeout(Duration::from_secs(secs));
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "FETCH_RETRIES")? {
            builder = builder.fetch_retries(v);
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "STALE_AFTER_CYCLES")? {
            builder = builder.stale_after_cycles(v);
        }
        if let Some(v) = parse_var::<DomainMatch, _>(&lookup, "WHITELIST_DOMAIN_MATCH")? {
            builder = builder.domain_match(v);
        }

        let config = builder.build();
        if config.probe_concurrency == 0 {
            return Err(ConfigError {
                var: "PROBE_CONCURRENCY",
                value: "0".to_string(),
            });
        }
        if config.probe_attempts == 0 {
            return Err(ConfigError {
                var: "PROBE_ATTEMPTS",
                value: "0".to_string(),
            });
        }
        Ok(config)
    }

    /// Upper bound on the duration of one probe.
    pub fn probe_deadline(&self) -> Duration {
        self.probe_timeout * self.probe_attempts.max(1) as u32
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfigBuilder::new().build()
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError { var, value }),
    }
}

/// Builder for `EngineConfig`.
pub struct EngineConfigBuilder {
    max_ping_ms: Option<f64>,
    max_packet_loss: Option<f64>,
    max_configs: Option<usize>,
    update_interval: Option<Duration>,
    probe_timeout: Option<Duration>,
    probe_attempts: Option<usize>,
    probe_concurrency: Option<usize>,
    probe_domain: Option<String>,
    fetch_timeout: Option<Duration>,
    fetch_retries: Option<usize>,
    retry_backoff: Option<Duration>,
    fetch_rate_per_second: Option<f64>,
    stale_after_cycles: Option<u64>,
    success_rate_alpha: Option<f64>,
    empty_payload_is_failure: Option<bool>,
    domain_match: Option<DomainMatch>,
    user_agent: Option<String>,
}

impl EngineConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            max_ping_ms: None,
            max_packet_loss: None,
            max_configs: None,
            update_interval: None,
            probe_timeout: None,
            probe_attempts: None,
            probe_concurrency: None,
            probe_domain: None,
            fetch_timeout: None,
            fetch_retries: None,
            retry_backoff: None,
            fetch_rate_per_second: None,
            stale_after_cycles: None,
            success_rate_alpha: None,
            empty_payload_is_failure: None,
            domain_match: None,
            user_agent: None,
        }
    }

    /// Set the latency ceiling for active configs, in milliseconds.
    pub fn max_ping_ms(mut self, ms: f64) -> Self {
        self.max_ping_ms = Some(ms);
        self
    }

    /// Set the packet loss ceiling (percent).
    pub fn max_packet_loss(mut self, percent: f64) -> Self {
        self.max_packet_loss = Some(percent);
        self
    }

    /// Set the maximum number of active configs.
    pub fn max_configs(mut self, count: usize) -> Self {
        self.max_configs = Some(count);
        self
    }

    /// Set the interval between scheduled cycles.
    pub fn update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = Some(interval);
        self
    }

    /// Set the timeout of one reachability attempt.
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = Some(timeout);
        self
    }

    /// Set the number of reachability attempts per probe.
    pub fn probe_attempts(mut self, attempts: usize) -> Self {
        self.probe_attempts = Some(attempts);
        self
    }

    /// Set the maximum number of simultaneous probes.
    pub fn probe_concurrency(mut self, concurrency: usize) -> Self {
        self.probe_concurrency = Some(concurrency);
        self
    }

    /// Set the domain reported in stats.
    pub fn probe_domain(mut self, domain: impl Into<String>) -> Self {
        self.probe_domain = Some(domain.into());
        self
    }

    /// Set the timeout of one subscription request.
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    /// Set the number of retries after a transient fetch failure.
    pub fn fetch_retries(mut self, retries: usize) -> Self {
        self.fetch_retries = Some(retries);
        self
    }

    /// Set the base delay of the retry backoff.
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = Some(backoff);
        self
    }

    /// Set the global subscription request rate.
    pub fn fetch_rate_per_second(mut self, rps: f64) -> Self {
        self.fetch_rate_per_second = Some(rps);
        self
    }

    /// Set how many cycles a config may be absent before deletion.
    pub fn stale_after_cycles(mut self, cycles: u64) -> Self {
        self.stale_after_cycles = Some(cycles);
        self
    }

    /// Set the weight of the newest fetch outcome in the success rate.
    pub fn success_rate_alpha(mut self, alpha: f64) -> Self {
        self.success_rate_alpha = Some(alpha);
        self
    }

    /// Set whether a fetch with zero valid configs counts as failed.
    pub fn empty_payload_is_failure(mut self, failure: bool) -> Self {
        self.empty_payload_is_failure = Some(failure);
        self
    }

    /// Set the whitelist domain matching policy.
    pub fn domain_match(mut self, policy: DomainMatch) -> Self {
        self.domain_match = Some(policy);
        self
    }

    /// Set the User-Agent for subscription requests.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> EngineConfig {
        EngineConfig {
            max_ping_ms: self.max_ping_ms.unwrap_or(300.0),
            max_packet_loss: self.max_packet_loss.unwrap_or(50.0),
            max_configs: self.max_configs.unwrap_or(100),
            update_interval: self.update_interval.unwrap_or(Duration::from_secs(3600)),
            probe_timeout: self.probe_timeout.unwrap_or(Duration::from_secs(3)),
            probe_attempts: self.probe_attempts.unwrap_or(3),
            probe_concurrency: self.probe_concurrency.unwrap_or(20),
            probe_domain: self.probe_domain.unwrap_or_else(|| "xpert.local".to_string()),
            fetch_timeout: self.fetch_timeout.unwrap_or(Duration::from_secs(10)),
            fetch_retries: self.fetch_retries.unwrap_or(2),
            retry_backoff: self.retry_backoff.unwrap_or(Duration::from_millis(500)),
            fetch_rate_per_second: self.fetch_rate_per_second.unwrap_or(5.0),
            stale_after_cycles: self.stale_after_cycles.unwrap_or(1),
            success_rate_alpha: self.success_rate_alpha.unwrap_or(0.2).clamp(0.0, 1.0),
            empty_payload_is_failure: self.empty_payload_is_failure.unwrap_or(true),
            domain_match: self.domain_match.unwrap_or(DomainMatch::Exact),
            user_agent: self
                .user_agent
                .unwrap_or_else(|| concat!("xpert-aggregator/", env!("CARGO_PKG_VERSION")).to_string()),
        }
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

//! Reachability probing and the bounded probe pool.

use crate::config::EngineConfig;
use crate::error::ProbeError;
use crate::model::{ConfigKey, ProbeResult};

use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Measures reachability, latency and loss of one config's server.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, key: &ConfigKey) -> ProbeResult;
}

/// Probes a server with a series of TCP connects to its port.
#[derive(Debug, Clone)]
pub struct TcpProber {
    attempts: usize,
    attempt_timeout: Duration,
}

impl TcpProber {
    pub fn new(attempts: usize, attempt_timeout: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            attempt_timeout,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.probe_attempts, config.probe_timeout)
    }

    async fn connect_once(&self, key: &ConfigKey) -> Result<f64, ProbeError> {
        let target = key.to_string();
        let start = Instant::now();
        let connect = match key.ip() {
            Some(ip) => TcpStream::connect((ip, key.port)).await,
            None => TcpStream::connect((key.server.as_str(), key.port)).await,
        };
        match connect {
            Ok(_stream) => Ok(start.elapsed().as_secs_f64() * 1000.0),
            Err(e) => Err(ProbeError::Connect {
                target,
                message: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, key: &ConfigKey) -> ProbeResult {
        let mut samples = Vec::with_capacity(self.attempts);

        for _ in 0..self.attempts {
            let attempt = match tokio::time::timeout(self.attempt_timeout, self.connect_once(key)).await
            {
                Ok(result) => result,
                Err(_) => Err(ProbeError::Timeout {
                    target: key.to_string(),
                }),
            };
            match attempt {
                Ok(rtt) => samples.push(rtt),
                Err(e) => debug!("{}", e),
            }
        }

        ProbeResult::from_samples(&samples, self.attempts)
    }
}

/// Runs probes with a fixed ceiling on simultaneous outbound checks.
#[derive(Clone)]
pub struct ProbePool {
    prober: Arc<dyn Prober>,
    concurrency: usize,
    deadline: Duration,
}

impl ProbePool {
    pub fn new(prober: Arc<dyn Prober>, concurrency: usize, deadline: Duration) -> Self {
        Self {
            prober,
            concurrency: concurrency.max(1),
            deadline,
        }
    }

    pub fn from_config(prober: Arc<dyn Prober>, config: &EngineConfig) -> Self {
        Self::new(prober, config.probe_concurrency, config.probe_deadline())
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Probe every key and collect one result per key.
    ///
    /// A probe that outlives the deadline counts as unreachable. Dropping the
    /// returned future aborts all probes still in flight.
    pub async fn probe_all(&self, keys: Vec<ConfigKey>) -> HashMap<ConfigKey, ProbeResult> {
        if keys.is_empty() {
            return HashMap::new();
        }
        info!(
            "Probing {} configs with concurrency {}",
            keys.len(),
            self.concurrency
        );

        let gate = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for key in keys.iter().cloned() {
            let gate = Arc::clone(&gate);
            let prober = Arc::clone(&self.prober);
            let deadline = self.deadline;

            tasks.spawn(async move {
                let _permit = match gate.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (key, ProbeResult::unreachable()),
                };
                let outcome = tokio::time::timeout(deadline, prober.probe(&key)).await;
                match outcome {
                    Ok(result) => (key, result),
                    Err(_) => {
                        let err = ProbeError::Timeout {
                            target: key.to_string(),
                        };
                        warn!("{} (deadline {:?})", err, deadline);
                        (key, ProbeResult::unreachable())
                    }
                }
            });
        }

        let mut results = HashMap::with_capacity(keys.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, result)) => {
                    results.insert(key, result);
                }
                Err(e) => warn!("Probe task failed: {}", e),
            }
        }

        // a panicked probe leaves no entry; treat it as unreachable
        for key in keys {
            results.entry(key).or_insert_with(ProbeResult::unreachable);
        }

        let reachable = results.values().filter(|r| r.reachable).count();
        info!(
            "Probe round completed: {} reachable, {} unreachable",
            reachable,
            results.len() - reachable
        );
        results
    }
}

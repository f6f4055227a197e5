#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use xpert_aggregator::{
    AggregationEngine, ConfigKey, EngineConfig, FetchError, NewSource, ProbeResult, Prober,
    Source, SourceFetcher, Store,
};

/// Serves canned payloads keyed by source URL.
#[derive(Default)]
pub struct FakeFetcher {
    payloads: Mutex<HashMap<String, Result<Vec<u8>, FetchError>>>,
    hang: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl FakeFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, body: &str) {
        self.payloads
            .lock()
            .insert(url.to_string(), Ok(body.as_bytes().to_vec()));
    }

    pub fn fail(&self, url: &str, error: FetchError) {
        self.payloads.lock().insert(url.to_string(), Err(error));
    }

    /// Fetches of `url` never complete.
    pub fn hang(&self, url: &str) {
        self.hang.lock().push(url.to_string());
    }

    /// Later fetches of `url` complete again; fetches already hanging stay hung.
    pub fn unhang(&self, url: &str) {
        self.hang.lock().retain(|u| u != url);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceFetcher for FakeFetcher {
    async fn fetch(&self, source: &Source) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let hangs = self.hang.lock().contains(&source.url);
        if hangs {
            std::future::pending::<()>().await;
        }
        let payload = self.payloads.lock().get(&source.url).cloned();
        payload.unwrap_or_else(|| Err(FetchError::permanent(source.url.clone(), "HTTP 404 Not Found")))
    }
}

/// Answers probes from a table keyed by server, with a fallback result.
pub struct FakeProber {
    results: Mutex<HashMap<String, ProbeResult>>,
    fallback: ProbeResult,
    calls: AtomicUsize,
}

impl FakeProber {
    pub fn reachable_by_default() -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(HashMap::new()),
            fallback: ok(50.0),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn unreachable_by_default() -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(HashMap::new()),
            fallback: ProbeResult::unreachable(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, server: &str, result: ProbeResult) {
        self.results.lock().insert(server.to_string(), result);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe(&self, key: &ConfigKey) -> ProbeResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.results
            .lock()
            .get(&key.server)
            .copied()
            .unwrap_or(self.fallback)
    }
}

pub fn ok(ping_ms: f64) -> ProbeResult {
    with_loss(ping_ms, 0.0)
}

pub fn with_loss(ping_ms: f64, packet_loss: f64) -> ProbeResult {
    ProbeResult {
        ping_ms: Some(ping_ms),
        jitter_ms: Some(1.0),
        packet_loss,
        reachable: true,
    }
}

pub fn vless(server: &str, remarks: &str) -> String {
    format!("vless://11111111-2222-3333-4444-555555555555@{}:443?security=tls#{}", server, remarks)
}

pub fn engine(
    config: EngineConfig,
    store: Arc<dyn Store>,
    fetcher: Arc<FakeFetcher>,
    prober: Arc<FakeProber>,
) -> Arc<AggregationEngine> {
    Arc::new(AggregationEngine::new(config, store, fetcher, prober))
}

pub async fn add_source(store: &dyn Store, name: &str, url: &str, priority: i32) -> Source {
    store
        .add_source(NewSource {
            name: name.to_string(),
            url: url.to_string(),
            priority,
        })
        .await
        .unwrap()
}

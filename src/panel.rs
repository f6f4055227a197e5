//! Operator-facing operations over the store and the engine.
//!
//! Each method corresponds to one endpoint of the Xpert API; transport and
//! authentication belong to the API layer, which maps [`PanelError`] onto a
//! status with [`PanelError::status_code`].

use crate::engine::AggregationEngine;
use crate::error::PanelError;
use crate::export::{self, ExportFormat};
use crate::model::{
    Config, ConfigDescriptor, Host, NewHost, NewSource, NewWhitelist, Protocol, Source, SourceId,
    Stats, UpdateReport, Whitelist, WhitelistId,
};
use crate::parser::{self, PayloadFormat};
use crate::store::Store;
use crate::whitelist::classify_host;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use url::Url;

/// Configs included in a URL preview.
const PREVIEW_SAMPLE: usize = 3;

/// A whitelist without its host list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WhitelistSummary {
    pub id: WhitelistId,
    pub name: String,
    pub description: String,
    pub is_active: bool,
    pub hosts_count: usize,
    pub active_hosts: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Whitelist> for WhitelistSummary {
    fn from(w: &Whitelist) -> Self {
        Self {
            id: w.id,
            name: w.name.clone(),
            description: w.description.clone(),
            is_active: w.is_active,
            hosts_count: w.hosts_count(),
            active_hosts: w.active_hosts(),
            created_at: w.created_at,
            updated_at: w.updated_at,
        }
    }
}

/// What a subscription URL would contribute, without registering it.
#[derive(Debug, Clone, Serialize)]
pub struct SourcePreview {
    pub url: String,
    #[serde(skip)]
    pub format: PayloadFormat,
    pub config_count: usize,
    pub skipped_count: usize,
    pub protocols: BTreeMap<Protocol, usize>,
    pub sample_configs: Vec<ConfigDescriptor>,
    /// The URL is already registered as a source.
    pub already_registered: bool,
}

/// Operator facade over the store and the aggregation engine.
#[derive(Clone)]
pub struct XpertPanel {
    engine: Arc<AggregationEngine>,
}

impl XpertPanel {
    pub fn new(engine: Arc<AggregationEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<AggregationEngine> {
        &self.engine
    }

    fn store(&self) -> &Arc<dyn Store> {
        self.engine.store()
    }

    pub async fn list_sources(&self) -> Result<Vec<Source>, PanelError> {
        Ok(self.store().list_sources().await?)
    }

    pub async fn add_source(&self, source: NewSource) -> Result<Source, PanelError> {
        if source.name.trim().is_empty() {
            return Err(PanelError::Validation("source name is required".to_string()));
        }
        validate_source_url(&source.url)?;
        Ok(self.store().add_source(source).await?)
    }

    pub async fn delete_source(&self, id: SourceId) -> Result<(), PanelError> {
        Ok(self.store().delete_source(id).await?)
    }

    pub async fn toggle_source(&self, id: SourceId) -> Result<Source, PanelError> {
        Ok(self.store().toggle_source(id).await?)
    }

    /// Recompute stats from committed state; the cached snapshot is only
    /// rewritten when it changed.
    pub async fn stats(&self) -> Result<Stats, PanelError> {
        let store = self.store();
        let sources = store.list_sources().await?;
        let configs = store.list_configs().await?;
        let last_update = store.last_update().await?;
        let stats = Stats::project(&sources, &configs, self.engine.config(), last_update);
        if let Err(e) = store.put_stats_snapshot(stats.clone()).await {
            warn!("Failed to cache stats snapshot: {}", e);
        }
        Ok(stats)
    }

    /// All committed configs: active ones fastest first, then the rest by id.
    pub async fn configs(&self) -> Result<Vec<Config>, PanelError> {
        let configs = self.store().list_configs().await?;
        let mut ordered: Vec<Config> = export::active_by_ping(&configs)
            .into_iter()
            .cloned()
            .collect();
        ordered.extend(configs.into_iter().filter(|c| !c.is_active));
        Ok(ordered)
    }

    /// Run a cycle now, waiting behind any cycle already in flight.
    pub async fn trigger_update(&self) -> Result<UpdateReport, PanelError> {
        info!("Manual update triggered");
        Ok(self.engine.run_cycle().await?)
    }

    pub async fn whitelists(&self) -> Result<Vec<WhitelistSummary>, PanelError> {
        let whitelists = self.store().get_whitelists(false).await?;
        Ok(whitelists.iter().map(WhitelistSummary::from).collect())
    }

    pub async fn add_whitelist(&self, whitelist: NewWhitelist) -> Result<Whitelist, PanelError> {
        if whitelist.name.trim().is_empty() {
            return Err(PanelError::Validation("whitelist name is required".to_string()));
        }
        Ok(self.store().add_whitelist(whitelist).await?)
    }

    pub async fn delete_whitelist(&self, id: WhitelistId) -> Result<(), PanelError> {
        Ok(self.store().delete_whitelist(id).await?)
    }

    pub async fn hosts(&self, whitelist_id: WhitelistId) -> Result<Vec<Host>, PanelError> {
        Ok(self.store().get_whitelist(whitelist_id).await?.hosts)
    }

    pub async fn add_host(
        &self,
        whitelist_id: WhitelistId,
        host: NewHost,
    ) -> Result<Host, PanelError> {
        let (value, kind) = classify_host(&host.host).ok_or_else(|| {
            PanelError::Validation(format!("{:?} is neither an IP address nor a domain", host.host))
        })?;
        let entry = Host {
            value,
            kind,
            description: host.description,
            country: host.country,
            is_active: true,
            added_at: Utc::now(),
        };
        Ok(self.store().add_host(whitelist_id, entry).await?)
    }

    pub async fn delete_host(&self, whitelist_id: WhitelistId, host: &str) -> Result<(), PanelError> {
        Ok(self.store().delete_host(whitelist_id, host).await?)
    }

    /// Fetch and parse a subscription URL without persisting anything.
    pub async fn test_source_url(&self, url: &str) -> Result<SourcePreview, PanelError> {
        let url = validate_source_url(url)?;
        let probe_source = Source {
            id: 0,
            name: "preview".to_string(),
            url: url.clone(),
            enabled: true,
            priority: 0,
            config_count: 0,
            success_rate: 0.0,
            fetch_attempts: 0,
            fetch_successes: 0,
            last_fetched: None,
            created_at: Utc::now(),
        };
        let payload = self.engine.fetcher().fetch(&probe_source).await?;
        let outcome = parser::parse(&payload)?;

        let mut protocols = BTreeMap::new();
        for descriptor in &outcome.descriptors {
            *protocols.entry(descriptor.key.protocol).or_insert(0) += 1;
        }
        let already_registered = self
            .store()
            .list_sources()
            .await?
            .iter()
            .any(|s| s.url == url);

        Ok(SourcePreview {
            config_count: outcome.descriptors.len(),
            skipped_count: outcome.skipped_count,
            format: outcome.format,
            sample_configs: outcome.descriptors.into_iter().take(PREVIEW_SAMPLE).collect(),
            protocols,
            already_registered,
            url,
        })
    }

    /// Render the active set for subscription clients.
    pub async fn subscription(&self, format: &str) -> Result<String, PanelError> {
        let format: ExportFormat = format.parse().map_err(PanelError::Validation)?;
        let configs = self.store().list_configs().await?;
        Ok(export::render(&configs, format, self.engine.config(), Utc::now()))
    }
}

fn validate_source_url(raw: &str) -> Result<String, PanelError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PanelError::Validation("URL is required".to_string()));
    }
    let url = Url::parse(trimmed)
        .map_err(|e| PanelError::Validation(format!("invalid URL {:?}: {}", trimmed, e)))?;
    match url.scheme() {
        "http" | "https" | "file" => Ok(trimmed.to_string()),
        other => Err(PanelError::Validation(format!(
            "unsupported URL scheme {:?}",
            other
        ))),
    }
}

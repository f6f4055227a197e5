//! Persistence of sources, configs, whitelists and the stats snapshot.

use crate::error::StoreError;
use crate::model::{
    Config, ConfigDescriptor, ConfigId, ConfigKey, Host, NewSource, NewWhitelist, ProbeResult,
    Source, SourceId, Stats, Whitelist, WhitelistId,
};
use crate::whitelist::classify_host;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// One probed config to be written by a cycle commit.
#[derive(Debug, Clone)]
pub struct ConfigUpsert {
    pub source_id: SourceId,
    pub descriptor: ConfigDescriptor,
    pub probe: ProbeResult,
    pub is_active: bool,
}

/// Fetch outcome of one source during a cycle.
#[derive(Debug, Clone)]
pub struct SourceOutcome {
    pub source_id: SourceId,
    pub success: bool,
    /// Valid configs parsed from the payload; `None` leaves the stored count alone.
    pub config_count: Option<usize>,
    pub at: DateTime<Utc>,
}

/// Everything a cycle writes, applied as one unit.
#[derive(Debug, Clone)]
pub struct CycleCommit {
    pub cycle: u64,
    pub configs: Vec<ConfigUpsert>,
    pub outcomes: Vec<SourceOutcome>,
    /// Configs last seen before this cycle are deleted.
    pub stale_cutoff: u64,
    pub success_rate_alpha: f64,
    pub committed_at: DateTime<Utc>,
}

/// What a commit changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub upserted: usize,
    pub deactivated: usize,
    pub deleted: usize,
}

/// Persistence collaborator of the engine and the panel.
///
/// `commit_cycle` must be all-or-nothing: on error the previously committed
/// state stays visible to readers.
#[async_trait]
pub trait Store: Send + Sync {
    async fn list_sources(&self) -> Result<Vec<Source>, StoreError>;

    /// Enabled sources ordered by `(priority, id)`.
    async fn list_enabled_sources(&self) -> Result<Vec<Source>, StoreError>;

    async fn get_source(&self, id: SourceId) -> Result<Source, StoreError>;

    async fn add_source(&self, source: NewSource) -> Result<Source, StoreError>;

    /// Delete a source together with every config it owns.
    async fn delete_source(&self, id: SourceId) -> Result<(), StoreError>;

    async fn toggle_source(&self, id: SourceId) -> Result<Source, StoreError>;

    async fn list_configs(&self) -> Result<Vec<Config>, StoreError>;

    async fn get_whitelists(&self, active_only: bool) -> Result<Vec<Whitelist>, StoreError>;

    async fn get_whitelist(&self, id: WhitelistId) -> Result<Whitelist, StoreError>;

    async fn add_whitelist(&self, whitelist: NewWhitelist) -> Result<Whitelist, StoreError>;

    async fn delete_whitelist(&self, id: WhitelistId) -> Result<(), StoreError>;

    async fn add_host(&self, whitelist_id: WhitelistId, host: Host) -> Result<Host, StoreError>;

    async fn delete_host(&self, whitelist_id: WhitelistId, host: &str) -> Result<(), StoreError>;

    /// Number of the last committed cycle; 0 before the first.
    async fn current_cycle(&self) -> Result<u64, StoreError>;

    async fn last_update(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn commit_cycle(&self, commit: CycleCommit) -> Result<CommitSummary, StoreError>;

    async fn get_stats_snapshot(&self) -> Result<Option<Stats>, StoreError>;

    async fn put_stats_snapshot(&self, stats: Stats) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    cycle: u64,
    last_update: Option<DateTime<Utc>>,
    next_source_id: SourceId,
    next_config_id: ConfigId,
    next_whitelist_id: WhitelistId,
    sources: BTreeMap<SourceId, Source>,
    configs: BTreeMap<ConfigId, Config>,
    whitelists: BTreeMap<WhitelistId, Whitelist>,
    stats: Option<Stats>,
    #[serde(skip)]
    index: HashMap<ConfigKey, ConfigId>,
}

impl StoreState {
    fn rebuild_index(&mut self) {
        self.index = self
            .configs
            .iter()
            .map(|(id, config)| (config.key(), *id))
            .collect();
    }

    fn allocate_source_id(&mut self) -> SourceId {
        self.next_source_id += 1;
        self.next_source_id
    }

    fn allocate_config_id(&mut self) -> ConfigId {
        self.next_config_id += 1;
        self.next_config_id
    }

    fn allocate_whitelist_id(&mut self) -> WhitelistId {
        self.next_whitelist_id += 1;
        self.next_whitelist_id
    }

    fn upsert_configs(&mut self, cycle: u64, at: DateTime<Utc>, upserts: Vec<ConfigUpsert>) -> usize {
        let mut written = 0;
        for upsert in upserts {
            if !self.sources.contains_key(&upsert.source_id) {
                debug!(
                    "Skipping {} from deleted source {}",
                    upsert.descriptor.key, upsert.source_id
                );
                continue;
            }

            let ConfigUpsert {
                source_id,
                descriptor,
                probe,
                is_active,
            } = upsert;
            let existing = self.index.get(&descriptor.key).copied();
            let id = match existing {
                Some(id) => id,
                None => {
                    let id = self.allocate_config_id();
                    self.index.insert(descriptor.key.clone(), id);
                    id
                }
            };
            let ConfigDescriptor { key, remarks, raw } = descriptor;
            self.configs.insert(
                id,
                Config {
                    id,
                    source_id,
                    protocol: key.protocol,
                    server: key.server,
                    port: key.port,
                    remarks,
                    raw,
                    ping_ms: probe.ping_ms,
                    jitter_ms: probe.jitter_ms,
                    packet_loss: probe.packet_loss,
                    is_active,
                    last_seen_cycle: cycle,
                    last_check: Some(at),
                },
            );
            written += 1;
        }
        written
    }

    fn deactivate_absent(&mut self, cycle: u64) -> usize {
        let mut deactivated = 0;
        for config in self.configs.values_mut() {
            if config.last_seen_cycle != cycle && config.is_active {
                config.is_active = false;
                deactivated += 1;
            }
        }
        deactivated
    }

    fn delete_stale_configs(&mut self, cutoff: u64) -> usize {
        let before = self.configs.len();
        self.configs.retain(|_, c| c.last_seen_cycle >= cutoff);
        let deleted = before - self.configs.len();
        if deleted > 0 {
            self.rebuild_index();
        }
        deleted
    }

    fn record_source_fetch_outcome(&mut self, outcome: &SourceOutcome, alpha: f64) {
        match self.sources.get_mut(&outcome.source_id) {
            Some(source) => {
                source.record_fetch_outcome(outcome.success, outcome.config_count, outcome.at, alpha)
            }
            None => debug!("Dropping outcome of deleted source {}", outcome.source_id),
        }
    }

    fn whitelist_mut(&mut self, id: WhitelistId) -> Result<&mut Whitelist, StoreError> {
        self.whitelists
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("whitelist {}", id)))
    }
}

/// In-memory store with an optional JSON snapshot on disk.
///
/// Every mutation is applied to a staged copy of the state, persisted, and
/// only then swapped in, so a failed write leaves the previous state in place.
/// Writers are serialized by `writer`; readers only ever wait for the swap.
pub struct MemoryStore {
    state: RwLock<StoreState>,
    writer: Mutex<()>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    /// A store that lives only in memory.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            writer: Mutex::new(()),
            path: None,
        }
    }

    /// Open a store backed by a snapshot file, loading it if it exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let state = match std::fs::read(&path) {
            Ok(bytes) => {
                let mut state: StoreState = serde_json::from_slice(&bytes).map_err(|e| {
                    StoreError::Unavailable(format!("corrupt snapshot {}: {}", path.display(), e))
                })?;
                state.rebuild_index();
                info!(
                    "Loaded store snapshot {} (cycle {}, {} sources, {} configs)",
                    path.display(),
                    state.cycle,
                    state.sources.len(),
                    state.configs.len()
                );
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => {
                return Err(StoreError::Unavailable(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        Ok(Self {
            state: RwLock::new(state),
            writer: Mutex::new(()),
            path: Some(path),
        })
    }

    fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> T {
        f(&self.state.read())
    }

    async fn mutate<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut StoreState) -> Result<T, StoreError> + Send,
        T: Send,
    {
        let _writer = self.writer.lock().await;
        let mut staged = self.state.read().clone();
        let value = f(&mut staged)?;
        self.persist(&staged).await?;
        *self.state.write() = staged;
        Ok(value)
    }

    async fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| StoreError::Unavailable(format!("cannot encode snapshot: {}", e)))?;
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&target, &bytes))
            .await
            .map_err(|e| StoreError::Unavailable(format!("snapshot writer failed: {}", e)))?
            .map_err(|e| {
                warn!("Failed to persist store snapshot {}: {}", path.display(), e);
                StoreError::Unavailable(format!("cannot write {}: {}", path.display(), e))
            })
    }
}

/// Write `data` to a uniquely named sibling, fsync it, then rename over `path`.
fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let tmp = path.with_file_name(format!(".{}.{}-{}.tmp", name, std::process::id(), nanos));

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp, path).inspect_err(|_| {
        let _ = std::fs::remove_file(&tmp);
    })
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_sources(&self) -> Result<Vec<Source>, StoreError> {
        Ok(self.read(|s| s.sources.values().cloned().collect()))
    }

    async fn list_enabled_sources(&self) -> Result<Vec<Source>, StoreError> {
        let mut sources: Vec<Source> =
            self.read(|s| s.sources.values().filter(|s| s.enabled).cloned().collect());
        sources.sort_by_key(|s| (s.priority, s.id));
        Ok(sources)
    }

    async fn get_source(&self, id: SourceId) -> Result<Source, StoreError> {
        self.read(|s| s.sources.get(&id).cloned())
            .ok_or_else(|| StoreError::NotFound(format!("source {}", id)))
    }

    async fn add_source(&self, source: NewSource) -> Result<Source, StoreError> {
        self.mutate(|state| {
            let url = source.url.trim().to_string();
            if state.sources.values().any(|s| s.url == url) {
                return Err(StoreError::Conflict(format!("source URL {} already exists", url)));
            }
            let id = state.allocate_source_id();
            let created = Source {
                id,
                name: source.name.trim().to_string(),
                url,
                enabled: true,
                priority: source.priority,
                config_count: 0,
                success_rate: 0.0,
                fetch_attempts: 0,
                fetch_successes: 0,
                last_fetched: None,
                created_at: Utc::now(),
            };
            state.sources.insert(id, created.clone());
            info!("Added source {} ({})", created.name, created.url);
            Ok(created)
        })
        .await
    }

    async fn delete_source(&self, id: SourceId) -> Result<(), StoreError> {
        self.mutate(|state| {
            let removed = state
                .sources
                .remove(&id)
                .ok_or_else(|| StoreError::NotFound(format!("source {}", id)))?;
            let before = state.configs.len();
            state.configs.retain(|_, c| c.source_id != id);
            state.rebuild_index();
            info!(
                "Deleted source {} and {} of its configs",
                removed.name,
                before - state.configs.len()
            );
            Ok(())
        })
        .await
    }

    async fn toggle_source(&self, id: SourceId) -> Result<Source, StoreError> {
        self.mutate(|state| {
            let source = state
                .sources
                .get_mut(&id)
                .ok_or_else(|| StoreError::NotFound(format!("source {}", id)))?;
            source.enabled = !source.enabled;
            info!(
                "Source {} {}",
                source.name,
                if source.enabled { "enabled" } else { "disabled" }
            );
            Ok(source.clone())
        })
        .await
    }

    async fn list_configs(&self) -> Result<Vec<Config>, StoreError> {
        Ok(self.read(|s| s.configs.values().cloned().collect()))
    }

    async fn get_whitelists(&self, active_only: bool) -> Result<Vec<Whitelist>, StoreError> {
        Ok(self.read(|s| {
            s.whitelists
                .values()
                .filter(|w| !active_only || w.is_active)
                .cloned()
                .collect()
        }))
    }

    async fn get_whitelist(&self, id: WhitelistId) -> Result<Whitelist, StoreError> {
        self.read(|s| s.whitelists.get(&id).cloned())
            .ok_or_else(|| StoreError::NotFound(format!("whitelist {}", id)))
    }

    async fn add_whitelist(&self, whitelist: NewWhitelist) -> Result<Whitelist, StoreError> {
        self.mutate(|state| {
            let name = whitelist.name.trim().to_string();
            if state.whitelists.values().any(|w| w.name == name) {
                return Err(StoreError::Conflict(format!("whitelist {} already exists", name)));
            }
            let id = state.allocate_whitelist_id();
            let now = Utc::now();
            let created = Whitelist {
                id,
                name,
                description: whitelist.description,
                is_active: true,
                hosts: Vec::new(),
                created_at: now,
                updated_at: now,
            };
            state.whitelists.insert(id, created.clone());
            Ok(created)
        })
        .await
    }

    async fn delete_whitelist(&self, id: WhitelistId) -> Result<(), StoreError> {
        self.mutate(|state| {
            state
                .whitelists
                .remove(&id)
                .map(|_| ())
                .ok_or_else(|| StoreError::NotFound(format!("whitelist {}", id)))
        })
        .await
    }

    async fn add_host(&self, whitelist_id: WhitelistId, host: Host) -> Result<Host, StoreError> {
        self.mutate(|state| {
            let whitelist = state.whitelist_mut(whitelist_id)?;
            if whitelist.hosts.iter().any(|h| h.value == host.value) {
                return Err(StoreError::Conflict(format!(
                    "host {} already in whitelist {}",
                    host.value, whitelist.name
                )));
            }
            whitelist.hosts.push(host.clone());
            whitelist.updated_at = Utc::now();
            Ok(host)
        })
        .await
    }

    async fn delete_host(&self, whitelist_id: WhitelistId, host: &str) -> Result<(), StoreError> {
        let value = classify_host(host)
            .map(|(value, _)| value)
            .unwrap_or_else(|| host.trim().to_string());
        self.mutate(|state| {
            let whitelist = state.whitelist_mut(whitelist_id)?;
            let before = whitelist.hosts.len();
            whitelist.hosts.retain(|h| h.value != value);
            if whitelist.hosts.len() == before {
                return Err(StoreError::NotFound(format!(
                    "host {} in whitelist {}",
                    value, whitelist_id
                )));
            }
            whitelist.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn current_cycle(&self) -> Result<u64, StoreError> {
        Ok(self.read(|s| s.cycle))
    }

    async fn last_update(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.read(|s| s.last_update))
    }

    async fn commit_cycle(&self, commit: CycleCommit) -> Result<CommitSummary, StoreError> {
        self.mutate(|state| {
            if commit.cycle <= state.cycle {
                return Err(StoreError::Conflict(format!(
                    "cycle {} already committed (current {})",
                    commit.cycle, state.cycle
                )));
            }

            let upserted = state.upsert_configs(commit.cycle, commit.committed_at, commit.configs);
            let deactivated = state.deactivate_absent(commit.cycle);
            let deleted = state.delete_stale_configs(commit.stale_cutoff);
            for outcome in &commit.outcomes {
                state.record_source_fetch_outcome(outcome, commit.success_rate_alpha);
            }
            state.cycle = commit.cycle;
            state.last_update = Some(commit.committed_at);

            Ok(CommitSummary {
                upserted,
                deactivated,
                deleted,
            })
        })
        .await
    }

    async fn get_stats_snapshot(&self) -> Result<Option<Stats>, StoreError> {
        Ok(self.read(|s| s.stats.clone()))
    }

    async fn put_stats_snapshot(&self, stats: Stats) -> Result<(), StoreError> {
        if self.read(|s| s.stats.as_ref() == Some(&stats)) {
            return Ok(());
        }
        self.mutate(|state| {
            state.stats = Some(stats);
            Ok(())
        })
        .await
    }
}

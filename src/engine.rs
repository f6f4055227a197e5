//! The aggregation cycle: fetch, parse, filter, probe, rank and commit.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::fetcher::SourceFetcher;
use crate::model::{ConfigDescriptor, ConfigKey, ProbeResult, Source, SourceId, Stats, UpdateReport};
use crate::parser;
use crate::probe::{ProbePool, Prober};
use crate::store::{ConfigUpsert, CycleCommit, SourceOutcome, Store};
use crate::whitelist::WhitelistFilter;

use chrono::Utc;
use futures::future;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;

/// Observable stage of the aggregation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Fetching,
    Parsing,
    Filtering,
    Probing,
    Ranking,
    Committed,
}

/// Resets the phase to `Idle` however the cycle ends.
struct PhaseGuard<'a>(&'a Mutex<CyclePhase>);

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock() = CyclePhase::Idle;
    }
}

/// Work of one cycle that is ready to be committed.
struct PreparedCycle {
    commit: CycleCommit,
    sources_ok: usize,
    sources_failed: usize,
    skipped_lines: usize,
    filtered_configs: usize,
    active_configs: usize,
}

/// Drives aggregation cycles against a store.
///
/// Only one cycle runs at a time; further triggers wait on the run gate in
/// arrival order and then run a fresh cycle of their own.
pub struct AggregationEngine {
    store: Arc<dyn Store>,
    fetcher: Arc<dyn SourceFetcher>,
    pool: ProbePool,
    config: EngineConfig,
    run_gate: tokio::sync::Mutex<()>,
    cancel: watch::Sender<u64>,
    phase: Mutex<CyclePhase>,
}

impl AggregationEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn Store>,
        fetcher: Arc<dyn SourceFetcher>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        let pool = ProbePool::from_config(prober, &config);
        let (cancel, _) = watch::channel(0);
        Self {
            store,
            fetcher,
            pool,
            config,
            run_gate: tokio::sync::Mutex::new(()),
            cancel,
            phase: Mutex::new(CyclePhase::Idle),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn fetcher(&self) -> &Arc<dyn SourceFetcher> {
        &self.fetcher
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.lock()
    }

    /// Whether a cycle currently holds the run gate.
    pub fn is_running(&self) -> bool {
        self.run_gate.try_lock().is_err()
    }

    fn set_phase(&self, phase: CyclePhase) {
        debug!("Cycle phase: {:?}", phase);
        *self.phase.lock() = phase;
    }

    /// Abort the cycle in flight, if it has not reached its commit yet.
    ///
    /// Cycles queued behind it are not affected.
    pub fn cancel_in_flight(&self) {
        self.cancel.send_modify(|epoch| *epoch += 1);
    }

    /// Cancel the cycle in flight and run a fresh one.
    pub async fn run_superseding(&self) -> Result<UpdateReport, EngineError> {
        self.cancel_in_flight();
        self.run_cycle().await
    }

    /// Run one full aggregation cycle.
    ///
    /// Source failures are recorded and never abort the cycle; only a failed
    /// commit or a cancellation does, and both leave the store untouched.
    pub async fn run_cycle(&self) -> Result<UpdateReport, EngineError> {
        let _gate = self.run_gate.lock().await;
        let mut cancelled = self.cancel.subscribe();
        let _phase = PhaseGuard(&self.phase);

        let cycle = self.store.current_cycle().await? + 1;
        info!("Starting aggregation cycle {}", cycle);

        let prepared = tokio::select! {
            biased;
            Ok(()) = cancelled.changed() => {
                warn!("Aggregation cycle {} cancelled before commit", cycle);
                return Err(EngineError::Cancelled);
            }
            prepared = self.prepare(cycle) => prepared?,
        };

        let committed_at = prepared.commit.committed_at;
        let summary = match self.store.commit_cycle(prepared.commit).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!("Commit of cycle {} failed: {}", cycle, e);
                return Err(EngineError::Store(e));
            }
        };
        self.set_phase(CyclePhase::Committed);
        debug!(
            "Cycle {} commit: {} upserted, {} deactivated, {} deleted",
            cycle, summary.upserted, summary.deactivated, summary.deleted
        );

        let sources = self.store.list_sources().await?;
        let configs = self.store.list_configs().await?;
        let stats = Stats::project(&sources, &configs, &self.config, Some(committed_at));
        if let Err(e) = self.store.put_stats_snapshot(stats).await {
            warn!("Failed to store stats snapshot for cycle {}: {}", cycle, e);
        }

        let report = UpdateReport {
            cycle,
            active_configs: prepared.active_configs,
            total_configs: configs.len(),
            sources_ok: prepared.sources_ok,
            sources_failed: prepared.sources_failed,
            skipped_lines: prepared.skipped_lines,
            filtered_configs: prepared.filtered_configs,
        };
        info!(
            "Aggregation cycle {} committed: {}/{} configs active, {} sources ok, {} failed",
            cycle,
            report.active_configs,
            report.total_configs,
            report.sources_ok,
            report.sources_failed
        );
        Ok(report)
    }

    async fn prepare(&self, cycle: u64) -> Result<PreparedCycle, EngineError> {
        self.set_phase(CyclePhase::Fetching);
        let sources = self.store.list_enabled_sources().await?;
        let whitelists = self.store.get_whitelists(true).await?;
        let filter = WhitelistFilter::from_whitelists(&whitelists, self.config.domain_match);
        info!("Fetching {} enabled sources", sources.len());

        let fetches = sources.iter().map(|source| async move {
            let payload = self.fetcher.fetch(source).await;
            (source, payload)
        });
        let fetched = future::join_all(fetches).await;

        self.set_phase(CyclePhase::Parsing);
        let mut outcomes = Vec::with_capacity(fetched.len());
        let mut per_source: Vec<(SourceId, Vec<ConfigDescriptor>)> = Vec::new();
        let mut skipped_lines = 0;

        for (source, payload) in fetched {
            let at = Utc::now();
            let (success, config_count, descriptors) = match payload {
                Ok(bytes) => self.parse_payload(source, &bytes, &mut skipped_lines),
                Err(e) => {
                    warn!("Failed to fetch source {}: {}", source.name, e);
                    (false, None, Vec::new())
                }
            };
            outcomes.push(SourceOutcome {
                source_id: source.id,
                success,
                config_count,
                at,
            });
            if !descriptors.is_empty() {
                per_source.push((source.id, descriptors));
            }
        }
        let sources_ok = outcomes.iter().filter(|o| o.success).count();
        let sources_failed = outcomes.len() - sources_ok;

        self.set_phase(CyclePhase::Filtering);
        let (candidates, filtered_configs) = merge_candidates(per_source, &filter);
        if filter.is_enabled() {
            info!(
                "Whitelist admitted {} configs, filtered {}",
                candidates.len(),
                filtered_configs
            );
        }

        self.set_phase(CyclePhase::Probing);
        let keys: Vec<ConfigKey> = candidates.iter().map(|(_, d)| d.key.clone()).collect();
        let results = self.pool.probe_all(keys).await;

        self.set_phase(CyclePhase::Ranking);
        let probed: Vec<(ConfigKey, ProbeResult)> = candidates
            .iter()
            .map(|(_, d)| {
                let result = results
                    .get(&d.key)
                    .copied()
                    .unwrap_or_else(ProbeResult::unreachable);
                (d.key.clone(), result)
            })
            .collect();
        let active: HashSet<ConfigKey> = rank(&probed, &self.config).into_iter().collect();

        let probe_of: HashMap<ConfigKey, ProbeResult> = probed.into_iter().collect();
        let configs: Vec<ConfigUpsert> = candidates
            .into_iter()
            .map(|(source_id, descriptor)| {
                let probe = probe_of
                    .get(&descriptor.key)
                    .copied()
                    .unwrap_or_else(ProbeResult::unreachable);
                ConfigUpsert {
                    source_id,
                    is_active: active.contains(&descriptor.key),
                    descriptor,
                    probe,
                }
            })
            .collect();

        Ok(PreparedCycle {
            commit: CycleCommit {
                cycle,
                configs,
                outcomes,
                stale_cutoff: cycle.saturating_sub(self.config.stale_after_cycles),
                success_rate_alpha: self.config.success_rate_alpha,
                committed_at: Utc::now(),
            },
            sources_ok,
            sources_failed,
            skipped_lines,
            filtered_configs,
            active_configs: active.len(),
        })
    }

    fn parse_payload(
        &self,
        source: &Source,
        bytes: &[u8],
        skipped_lines: &mut usize,
    ) -> (bool, Option<usize>, Vec<ConfigDescriptor>) {
        match parser::parse(bytes) {
            Ok(outcome) => {
                *skipped_lines += outcome.skipped_count;
                let count = outcome.descriptors.len();
                if outcome.is_empty() && self.config.empty_payload_is_failure {
                    warn!("Source {} returned no valid configs", source.name);
                    return (false, Some(0), Vec::new());
                }
                info!(
                    "Parsed {} configs from {} ({:?}, {} lines skipped)",
                    count, source.name, outcome.format, outcome.skipped_count
                );
                (true, Some(count), outcome.descriptors)
            }
            Err(e) => {
                warn!("Failed to parse payload of {}: {}", source.name, e);
                (false, None, Vec::new())
            }
        }
    }
}

/// Merge per-source descriptors in source order; the first source to expose
/// an endpoint owns it.
fn merge_candidates(
    per_source: Vec<(SourceId, Vec<ConfigDescriptor>)>,
    filter: &WhitelistFilter,
) -> (Vec<(SourceId, ConfigDescriptor)>, usize) {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    let mut filtered = 0;

    for (source_id, descriptors) in per_source {
        for descriptor in descriptors {
            if !filter.is_allowed(&descriptor.key.server) {
                filtered += 1;
                continue;
            }
            if seen.insert(descriptor.key.clone()) {
                merged.push((source_id, descriptor));
            }
        }
    }
    (merged, filtered)
}

/// Select the configs to activate.
///
/// Qualifying results are ordered by ping, then loss, then natural key, and
/// the first `max_configs` are returned. Ids are assigned after ranking, so the
/// key stands in for the config id as the final tie-break.
pub fn rank(probed: &[(ConfigKey, ProbeResult)], config: &EngineConfig) -> Vec<ConfigKey> {
    let mut qualifying: Vec<(&ConfigKey, f64, f64)> = probed
        .iter()
        .filter(|(_, result)| result.meets(config))
        .filter_map(|(key, result)| result.ping_ms.map(|ping| (key, ping, result.packet_loss)))
        .collect();

    qualifying.sort_by(|a, b| {
        a.1.total_cmp(&b.1)
            .then_with(|| a.2.total_cmp(&b.2))
            .then_with(|| a.0.cmp(b.0))
    });
    qualifying.truncate(config.max_configs);
    qualifying.into_iter().map(|(key, _, _)| key.clone()).collect()
}

impl std::fmt::Debug for AggregationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationEngine")
            .field("phase", &self.phase())
            .field("probe_concurrency", &self.pool.concurrency())
            .finish()
    }
}

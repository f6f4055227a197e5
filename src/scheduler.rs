//! Periodic aggregation in the background.

use crate::engine::AggregationEngine;
use crate::error::EngineError;
use crate::model::UpdateReport;

use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Progress of the background scheduler.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStatus {
    pub runs: u64,
    pub failures: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub last_report: Option<UpdateReport>,
    pub last_error: Option<String>,
}

/// Runs a cycle immediately and then every `update_interval`.
pub struct Scheduler {
    engine: Arc<AggregationEngine>,
    shutdown: watch::Sender<bool>,
    status: Arc<RwLock<SchedulerStatus>>,
    handle: JoinHandle<()>,
}

fn record_run(
    status: &RwLock<SchedulerStatus>,
    result: Result<UpdateReport, EngineError>,
    next_run: Option<DateTime<Utc>>,
) {
    let mut status = status.write();
    status.runs += 1;
    status.last_run = Some(Utc::now());
    status.next_run = next_run;
    match result {
        Ok(report) => {
            status.last_report = Some(report);
            status.last_error = None;
        }
        Err(EngineError::Cancelled) => {
            status.last_error = Some(EngineError::Cancelled.to_string());
        }
        Err(e) => {
            warn!("Scheduled update failed: {}", e);
            status.failures += 1;
            status.last_error = Some(e.to_string());
        }
    }
}

impl Scheduler {
    /// Spawn the scheduling loop on the current runtime.
    pub fn start(engine: Arc<AggregationEngine>) -> Self {
        let interval = engine.config().update_interval.max(Duration::from_secs(1));
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let status = Arc::new(RwLock::new(SchedulerStatus::default()));

        let task_engine = Arc::clone(&engine);
        let task_status = Arc::clone(&status);
        let handle = tokio::spawn(async move {
            info!("Scheduler started, update interval {:?}", interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }
                if *shutdown_rx.borrow() {
                    break;
                }

                let result = task_engine.run_cycle().await;
                let now = Utc::now();
                let next = chrono::Duration::from_std(interval)
                    .ok()
                    .map(|step| now + step);

                record_run(&task_status, result, next);
            }
            info!("Scheduler stopped");
        });

        Self {
            engine,
            shutdown,
            status,
            handle,
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        self.status.read().clone()
    }

    /// Stop the loop, cancelling a cycle that has not committed yet.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        self.engine.cancel_in_flight();
        if let Err(e) = self.handle.await {
            warn!("Scheduler task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::FetchError;
    use crate::fetcher::SourceFetcher;
    use crate::model::{ConfigKey, ProbeResult, Source};
    use crate::probe::Prober;
    use crate::store::{MemoryStore, Store};
    use async_trait::async_trait;

    struct NoFetch;

    #[async_trait]
    impl SourceFetcher for NoFetch {
        async fn fetch(&self, source: &Source) -> Result<Vec<u8>, FetchError> {
            Err(FetchError::permanent(source.url.clone(), "offline"))
        }
    }

    struct NoProbe;

    #[async_trait]
    impl Prober for NoProbe {
        async fn probe(&self, _key: &ConfigKey) -> ProbeResult {
            ProbeResult::unreachable()
        }
    }

    fn engine() -> Arc<AggregationEngine> {
        let config = EngineConfig::builder()
            .update_interval(Duration::from_secs(3600))
            .build();
        Arc::new(AggregationEngine::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(NoFetch),
            Arc::new(NoProbe),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn runs_immediately_and_then_every_interval() {
        let engine = engine();
        let scheduler = Scheduler::start(Arc::clone(&engine));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(scheduler.status().runs, 1);
        assert_eq!(scheduler.status().last_report.unwrap().cycle, 1);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(scheduler.status().runs, 2);

        scheduler.shutdown().await;
        assert_eq!(engine.store().current_cycle().await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_further_cycles() {
        let engine = engine();
        let scheduler = Scheduler::start(Arc::clone(&engine));
        tokio::time::sleep(Duration::from_secs(1)).await;
        scheduler.shutdown().await;

        tokio::time::sleep(Duration::from_secs(3 * 3600)).await;
        assert_eq!(engine.store().current_cycle().await.unwrap(), 1);
    }
}

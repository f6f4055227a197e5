//! Simple example of running one aggregation cycle.
//!
//! Usage: `cargo run --example simple -- <subscription-url>...`

use std::sync::Arc;
use xpert_aggregator::{
    AggregationEngine, EngineConfig, HttpFetcher, MemoryStore, NewSource, TcpProber, XpertPanel,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = EngineConfig::from_env()?;
    let store = Arc::new(MemoryStore::open("xpert-snapshot.json")?);
    let fetcher = Arc::new(HttpFetcher::new(&config)?);
    let prober = Arc::new(TcpProber::from_config(&config));
    let engine = Arc::new(AggregationEngine::new(config, store, fetcher, prober));
    let panel = XpertPanel::new(engine);

    let urls: Vec<String> = std::env::args().skip(1).collect();
    for (i, url) in urls.iter().enumerate() {
        let source = NewSource {
            name: format!("source-{}", i + 1),
            url: url.clone(),
            priority: i as i32 + 1,
        };
        match panel.add_source(source).await {
            Ok(source) => println!("Added source #{} {}", source.id, source.url),
            Err(e) => println!("Skipping {}: {}", url, e),
        }
    }

    println!("Running update...");
    let report = panel.trigger_update().await?;
    println!(
        "Cycle {}: {}/{} configs active ({} sources ok, {} failed)",
        report.cycle,
        report.active_configs,
        report.total_configs,
        report.sources_ok,
        report.sources_failed
    );

    let stats = panel.stats().await?;
    println!("Average ping: {:.1}ms", stats.avg_ping);
    println!("{}", panel.subscription("universal").await?);

    Ok(())
}

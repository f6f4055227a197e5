//! # xpert-aggregator
//!
//! An aggregation engine for proxy subscriptions.
//!
//! Subscription sources are fetched, their payloads decoded into proxy
//! configs, deduplicated across sources, narrowed by operator whitelists,
//! probed for reachability and latency, and ranked. The best configs are
//! committed as the active set and exported as a client subscription.

pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod fetcher;
pub mod middleware;
pub mod model;
pub mod panel;
pub mod parser;
pub mod probe;
pub mod scheduler;
pub mod store;
pub mod whitelist;

pub use config::{DomainMatch, EngineConfig, EngineConfigBuilder};
pub use engine::{AggregationEngine, CyclePhase};
pub use error::{
    ConfigError, EngineError, FetchError, FetchErrorKind, PanelError, ParseError, ProbeError,
    StoreError,
};
pub use export::ExportFormat;
pub use fetcher::{HttpFetcher, SourceFetcher};
pub use middleware::RetryTransientMiddleware;
pub use model::{
    Config, ConfigDescriptor, ConfigKey, Host, HostKind, NewHost, NewSource, NewWhitelist,
    ProbeResult, Protocol, Source, Stats, UpdateReport, Whitelist,
};
pub use panel::{SourcePreview, WhitelistSummary, XpertPanel};
pub use probe::{ProbePool, Prober, TcpProber};
pub use scheduler::{Scheduler, SchedulerStatus};
pub use store::{MemoryStore, Store};
pub use whitelist::WhitelistFilter;

mod common;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::{engine, ok, vless, FakeFetcher, FakeProber};
use http::StatusCode;
use std::sync::Arc;
use xpert_aggregator::{
    EngineConfig, FetchError, MemoryStore, NewHost, NewSource, NewWhitelist, PanelError,
    Protocol, XpertPanel,
};

fn panel_with(fetcher: Arc<FakeFetcher>, prober: Arc<FakeProber>) -> XpertPanel {
    XpertPanel::new(engine(
        EngineConfig::default(),
        Arc::new(MemoryStore::new()),
        fetcher,
        prober,
    ))
}

fn new_source(name: &str, url: &str) -> NewSource {
    NewSource {
        name: name.to_string(),
        url: url.to_string(),
        priority: 1,
    }
}

#[tokio::test]
async fn source_management_reports_http_statuses() {
    let panel = panel_with(FakeFetcher::new(), FakeProber::reachable_by_default());

    let source = panel
        .add_source(new_source("main", "https://a.example/sub"))
        .await
        .unwrap();
    assert!(source.enabled);
    assert_eq!(source.success_rate, 0.0);
    assert!(source.last_fetched.is_none());

    let dup = panel
        .add_source(new_source("again", "https://a.example/sub"))
        .await
        .unwrap_err();
    assert_eq!(dup.status_code(), StatusCode::CONFLICT);

    let invalid = panel
        .add_source(new_source("bad", "not a url"))
        .await
        .unwrap_err();
    assert_eq!(invalid.status_code(), StatusCode::BAD_REQUEST);

    let unnamed = panel
        .add_source(new_source("  ", "https://b.example/sub"))
        .await
        .unwrap_err();
    assert_eq!(unnamed.status_code(), StatusCode::BAD_REQUEST);

    let toggled = panel.toggle_source(source.id).await.unwrap();
    assert!(!toggled.enabled);

    panel.delete_source(source.id).await.unwrap();
    let missing = panel.delete_source(source.id).await.unwrap_err();
    assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);
    assert!(panel.list_sources().await.unwrap().is_empty());
}

#[tokio::test]
async fn update_stats_and_configs_reflect_the_committed_cycle() {
    let fetcher = FakeFetcher::new();
    fetcher.serve(
        "https://a.example/sub",
        &format!(
            "{}\n{}\n{}",
            vless("10.0.0.1", "fast"),
            vless("10.0.0.2", "slower"),
            vless("edge.example", "domain")
        ),
    );
    let prober = FakeProber::reachable_by_default();
    prober.set("10.0.0.1", ok(20.0));
    prober.set("10.0.0.2", ok(60.0));
    prober.set("edge.example", ok(999.0));
    let panel = panel_with(fetcher, prober);

    panel
        .add_source(new_source("main", "https://a.example/sub"))
        .await
        .unwrap();
    let report = panel.trigger_update().await.unwrap();
    assert_eq!(report.active_configs, 2);
    assert_eq!(report.total_configs, 3);

    let stats = panel.stats().await.unwrap();
    assert_eq!(stats.total_sources, 1);
    assert_eq!(stats.enabled_sources, 1);
    assert_eq!(stats.active_configs, 2);
    assert_eq!(stats.avg_ping, 40.0);
    assert_eq!(stats.target_ips, vec!["10.0.0.1", "10.0.0.2"]);
    assert_eq!(stats.domain, "xpert.local");
    assert!(stats.last_update.is_some());

    let configs = panel.configs().await.unwrap();
    let order: Vec<&str> = configs.iter().map(|c| c.remarks.as_str()).collect();
    assert_eq!(order, vec!["fast", "slower", "domain"]);

    let plain = panel.subscription("plain").await.unwrap();
    assert_eq!(plain.lines().count(), 2);
    assert!(plain.lines().next().unwrap().ends_with("#fast"));

    let encoded = panel.subscription("base64").await.unwrap();
    assert_eq!(STANDARD.decode(encoded).unwrap(), plain.as_bytes());

    let universal = panel.subscription("universal").await.unwrap();
    assert!(universal.contains("# Active servers: 2"));

    let unknown = panel.subscription("surge").await.unwrap_err();
    assert_eq!(unknown.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn whitelists_and_hosts() {
    let panel = panel_with(FakeFetcher::new(), FakeProber::reachable_by_default());

    let whitelist = panel
        .add_whitelist(NewWhitelist {
            name: "edge".to_string(),
            description: "edge nodes".to_string(),
        })
        .await
        .unwrap();
    let host = panel
        .add_host(
            whitelist.id,
            NewHost {
                host: "[2001:DB8::1]".to_string(),
                description: String::new(),
                country: "DE".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(host.value, "2001:db8::1");

    panel
        .add_host(
            whitelist.id,
            NewHost {
                host: "cdn.example.com".to_string(),
                description: String::new(),
                country: String::new(),
            },
        )
        .await
        .unwrap();

    let invalid = panel
        .add_host(
            whitelist.id,
            NewHost {
                host: "not a host".to_string(),
                description: String::new(),
                country: String::new(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(invalid, PanelError::Validation(_)));

    let summaries = panel.whitelists().await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].hosts_count, 2);
    assert_eq!(summaries[0].active_hosts, 2);

    panel.delete_host(whitelist.id, "cdn.example.com").await.unwrap();
    assert_eq!(panel.hosts(whitelist.id).await.unwrap().len(), 1);

    panel.delete_whitelist(whitelist.id).await.unwrap();
    let gone = panel.hosts(whitelist.id).await.unwrap_err();
    assert_eq!(gone.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn url_preview_persists_nothing() {
    let fetcher = FakeFetcher::new();
    let lines: Vec<String> = (0..5)
        .map(|i| vless(&format!("h{}.example", i), &format!("n{}", i)))
        .collect();
    fetcher.serve(
        "https://preview.example/sub",
        &STANDARD.encode(format!("{}\ngarbage\n", lines.join("\n"))),
    );
    fetcher.fail(
        "https://down.example/sub",
        FetchError::transient("https://down.example/sub", "connection reset"),
    );
    let panel = panel_with(fetcher, FakeProber::reachable_by_default());

    let preview = panel
        .test_source_url("https://preview.example/sub")
        .await
        .unwrap();
    assert_eq!(preview.config_count, 5);
    assert_eq!(preview.skipped_count, 1);
    assert_eq!(preview.sample_configs.len(), 3);
    assert_eq!(preview.protocols.get(&Protocol::Vless), Some(&5));
    assert!(!preview.already_registered);
    assert!(panel.list_sources().await.unwrap().is_empty());

    let err = panel
        .test_source_url("https://down.example/sub")
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);

    let err = panel.test_source_url("").await.unwrap_err();
    assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn deleting_a_source_removes_its_configs() {
    let fetcher = FakeFetcher::new();
    fetcher.serve("https://a.example/sub", &vless("a.example", "a"));
    fetcher.serve("https://b.example/sub", &vless("b.example", "b"));
    let panel = panel_with(fetcher, FakeProber::reachable_by_default());

    let a = panel
        .add_source(new_source("a", "https://a.example/sub"))
        .await
        .unwrap();
    panel
        .add_source(new_source("b", "https://b.example/sub"))
        .await
        .unwrap();
    panel.trigger_update().await.unwrap();
    assert_eq!(panel.configs().await.unwrap().len(), 2);

    panel.delete_source(a.id).await.unwrap();
    let configs = panel.configs().await.unwrap();
    assert_eq!(configs.len(), 1);
    assert_eq!(configs[0].server, "b.example");
    assert_eq!(panel.stats().await.unwrap().total_configs, 1);
}

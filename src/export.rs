//! Rendering of the active set as a client subscription.

use crate::config::EngineConfig;
use crate::model::Config;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::fmt;
use std::str::FromStr;

/// Output shape of an exported subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    /// Annotated plain text with a header and per-config quality lines.
    #[default]
    Universal,
    /// Newline-joined share lines, base64 encoded. Understood by most clients.
    Base64,
    /// Newline-joined share lines.
    Plain,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "universal" => Ok(ExportFormat::Universal),
            "base64" => Ok(ExportFormat::Base64),
            "plain" | "raw" => Ok(ExportFormat::Plain),
            other => Err(format!("unknown subscription format {:?}", other)),
        }
    }
}

/// Coarse connection quality shown next to each exported config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Excellent,
    Good,
    Fair,
    Poor,
    Bad,
}

impl Quality {
    pub fn of(config: &Config) -> Self {
        let Some(ping) = config.ping_ms else {
            return Quality::Bad;
        };
        let loss = config.packet_loss;
        if ping < 50.0 && loss < 1.0 {
            Quality::Excellent
        } else if ping < 100.0 && loss < 5.0 {
            Quality::Good
        } else if ping < 200.0 && loss < 10.0 {
            Quality::Fair
        } else if ping < 300.0 && loss < 20.0 {
            Quality::Poor
        } else {
            Quality::Bad
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Quality::Excellent => "EXCELLENT",
            Quality::Good => "GOOD",
            Quality::Fair => "FAIR",
            Quality::Poor => "POOR",
            Quality::Bad => "BAD",
        })
    }
}

/// Active configs, fastest first.
pub fn active_by_ping(configs: &[Config]) -> Vec<&Config> {
    let mut active: Vec<&Config> = configs.iter().filter(|c| c.is_active).collect();
    active.sort_by(|a, b| {
        let pa = a.ping_ms.unwrap_or(f64::MAX);
        let pb = b.ping_ms.unwrap_or(f64::MAX);
        pa.total_cmp(&pb).then_with(|| a.id.cmp(&b.id))
    });
    active
}

/// Render the active configs in `format`.
pub fn render(
    configs: &[Config],
    format: ExportFormat,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> String {
    let active = active_by_ping(configs);
    let plain = || {
        active
            .iter()
            .map(|c| c.raw.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    };

    match format {
        ExportFormat::Plain => plain(),
        ExportFormat::Base64 => STANDARD.encode(plain()),
        ExportFormat::Universal => render_universal(&active, config, now),
    }
}

fn render_universal(active: &[&Config], config: &EngineConfig, now: DateTime<Utc>) -> String {
    const RULE: &str = "# =========================================";
    let interval_hours = (config.update_interval.as_secs() / 3600).max(1);
    let next_update = now
        + ChronoDuration::from_std(config.update_interval).unwrap_or(ChronoDuration::hours(1));

    let mut lines = vec![
        RULE.to_string(),
        "# Xpert Panel - Smart VPN Subscription".to_string(),
        format!("# Domain: {}", config.probe_domain),
        format!("# Generated: {}", now.format("%Y-%m-%d %H:%M:%S UTC")),
        format!("# Active servers: {}", active.len()),
        format!("# Auto-update: Every {} hour(s)", interval_hours),
        RULE.to_string(),
        String::new(),
    ];

    for (i, c) in active.iter().enumerate() {
        lines.push(format!(
            "# [{}] {} | {}",
            i + 1,
            c.remarks,
            c.protocol.as_str().to_ascii_uppercase()
        ));
        lines.push(format!(
            "# Quality: {} | Ping: {:.0}ms | Loss: {:.0}%",
            Quality::of(c),
            c.ping_ms.unwrap_or_default(),
            c.packet_loss
        ));
        lines.push(c.raw.clone());
        lines.push(String::new());
    }

    lines.push(RULE.to_string());
    lines.push(format!("# Next update: {}", next_update.format("%H:%M UTC")));
    lines.push(RULE.to_string());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Protocol;
    use chrono::TimeZone;

    fn config(id: u64, ping: Option<f64>, is_active: bool) -> Config {
        Config {
            id,
            source_id: 1,
            protocol: Protocol::Trojan,
            server: format!("h{}.example", id),
            port: 443,
            remarks: format!("node-{}", id),
            raw: format!("trojan://pw@h{}.example:443#node-{}", id, id),
            ping_ms: ping,
            jitter_ms: Some(1.0),
            packet_loss: 0.0,
            is_active,
            last_seen_cycle: 1,
            last_check: None,
        }
    }

    #[test]
    fn plain_and_base64_list_active_configs_fastest_first() {
        let configs = vec![
            config(1, Some(80.0), true),
            config(2, Some(20.0), true),
            config(3, Some(5.0), false),
        ];
        let now = Utc::now();
        let plain = render(&configs, ExportFormat::Plain, &EngineConfig::default(), now);
        assert_eq!(
            plain,
            "trojan://pw@h2.example:443#node-2\ntrojan://pw@h1.example:443#node-1"
        );

        let encoded = render(&configs, ExportFormat::Base64, &EngineConfig::default(), now);
        assert_eq!(STANDARD.decode(encoded).unwrap(), plain.as_bytes());
    }

    #[test]
    fn universal_format_annotates_each_config() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();
        let out = render(
            &[config(7, Some(42.4), true)],
            ExportFormat::Universal,
            &EngineConfig::default(),
            now,
        );
        assert!(out.contains("# Domain: xpert.local"));
        assert!(out.contains("# Generated: 2024-05-01 10:30:00 UTC"));
        assert!(out.contains("# Active servers: 1"));
        assert!(out.contains("# [1] node-7 | TROJAN"));
        assert!(out.contains("# Quality: EXCELLENT | Ping: 42ms | Loss: 0%"));
        assert!(out.contains("# Next update: 11:30 UTC"));
    }

    #[test]
    fn quality_grades_follow_ping_and_loss() {
        let mut c = config(1, Some(120.0), true);
        assert_eq!(Quality::of(&c), Quality::Fair);
        c.packet_loss = 15.0;
        assert_eq!(Quality::of(&c), Quality::Poor);
        c.ping_ms = None;
        assert_eq!(Quality::of(&c), Quality::Bad);
    }

    #[test]
    fn format_names_parse() {
        assert_eq!("BASE64".parse::<ExportFormat>(), Ok(ExportFormat::Base64));
        assert_eq!("".parse::<ExportFormat>(), Ok(ExportFormat::Universal));
        assert!("clash".parse::<ExportFormat>().is_err());
    }
}

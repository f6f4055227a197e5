//! Subscription payload parsing.
//!
//! A payload is one of: a base64 blob wrapping a share-link list, a plain
//! newline-delimited share-link list, or a Clash-style YAML feed with a
//! `proxies:` sequence. Individual lines that cannot be decoded are skipped and
//! counted; they never fail the whole payload.

use crate::error::ParseError;
use crate::model::{ConfigDescriptor, ConfigKey, Protocol};

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use log::debug;
use std::collections::HashSet;
use url::Url;

/// Shape the payload was recognised as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Base64,
    PlainList,
    ClashYaml,
}

/// Result of parsing one payload.
#[derive(Debug, Clone)]
pub struct ParseOutcome {
    pub descriptors: Vec<ConfigDescriptor>,
    pub skipped_count: usize,
    pub format: PayloadFormat,
}

impl ParseOutcome {
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Parse a raw subscription payload into config descriptors.
pub fn parse(payload: &[u8]) -> Result<ParseOutcome, ParseError> {
    // invalid bytes become U+FFFD inside their own line
    let text = String::from_utf8_lossy(payload);
    let text = text.trim_start_matches('\u{feff}').trim();

    if text.is_empty() {
        return Ok(ParseOutcome {
            descriptors: Vec::new(),
            skipped_count: 0,
            format: PayloadFormat::PlainList,
        });
    }

    if let Some(outcome) = try_clash_yaml(text) {
        return Ok(outcome);
    }

    if !text.contains("://") {
        if let Some(decoded) = decode_base64_auto(text) {
            if let Some(mut outcome) = try_clash_yaml(&decoded) {
                outcome.format = PayloadFormat::Base64;
                return Ok(outcome);
            }
            if decoded.contains("://") {
                return Ok(parse_lines(&decoded, PayloadFormat::Base64));
            }
        }
    }

    Ok(parse_lines(text, PayloadFormat::PlainList))
}

fn parse_lines(text: &str, format: PayloadFormat) -> ParseOutcome {
    let mut descriptors = Vec::new();
    let mut seen = HashSet::new();
    let mut skipped_count = 0;

    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }
        match parse_line(index + 1, line) {
            Ok(descriptor) => {
                if seen.insert(descriptor.key.clone()) {
                    descriptors.push(descriptor);
                }
            }
            Err(e) => {
                debug!("Skipping subscription line: {}", e);
                skipped_count += 1;
            }
        }
    }

    ParseOutcome {
        descriptors,
        skipped_count,
        format,
    }
}

/// Decode one share link into a descriptor.
pub fn parse_line(line_no: usize, line: &str) -> Result<ConfigDescriptor, ParseError> {
    let malformed = |reason: &str| ParseError::Malformed {
        line: line_no,
        reason: reason.to_string(),
    };

    let (scheme, body) = line
        .split_once("://")
        .ok_or_else(|| malformed("missing scheme"))?;
    let protocol = Protocol::from_scheme(scheme).ok_or_else(|| ParseError::Unsupported {
        line: line_no,
        scheme: scheme.to_string(),
    })?;

    let (server, port, remarks) = match protocol {
        Protocol::Vmess => parse_vmess(body),
        Protocol::Shadowsocks => parse_shadowsocks(line),
        Protocol::Ssr => parse_ssr(body),
        Protocol::Vless | Protocol::Trojan | Protocol::Hysteria2 | Protocol::Tuic => {
            parse_url_form(line)
        }
    }
    .ok_or_else(|| malformed("cannot extract server and port"))?;

    build_descriptor(protocol, &server, port, remarks, line.to_string())
        .ok_or_else(|| malformed("empty server or zero port"))
}

fn build_descriptor(
    protocol: Protocol,
    server: &str,
    port: u16,
    remarks: String,
    raw: String,
) -> Option<ConfigDescriptor> {
    let key = ConfigKey::new(protocol, server, port);
    if key.server.is_empty() || key.port == 0 {
        return None;
    }
    let remarks = if remarks.trim().is_empty() {
        let short: String = key.server.chars().take(15).collect();
        format!("{}-{}", protocol.as_str().to_uppercase(), short)
    } else {
        remarks.trim().to_string()
    };
    Some(ConfigDescriptor { key, remarks, raw })
}

fn decode_base64_auto(input: &str) -> Option<String> {
    let clean: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if clean.is_empty() {
        return None;
    }
    let engines = [&STANDARD, &STANDARD_NO_PAD, &URL_SAFE, &URL_SAFE_NO_PAD];
    engines
        .iter()
        .find_map(|engine| engine.decode(&clean).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

fn percent_decode(s: &str) -> String {
    urlencoding::decode(s)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| s.to_string())
}

fn host_of(url: &Url) -> Option<String> {
    match url.host()? {
        url::Host::Domain(d) => Some(d.to_string()),
        url::Host::Ipv4(ip) => Some(ip.to_string()),
        url::Host::Ipv6(ip) => Some(ip.to_string()),
    }
}

fn parse_url_form(line: &str) -> Option<(String, u16, String)> {
    let url = Url::parse(line).ok()?;
    let server = host_of(&url)?;
    let port = url.port().unwrap_or(443);
    let remarks = url.fragment().map(percent_decode).unwrap_or_default();
    Some((server, port, remarks))
}

fn json_port(value: &serde_json::Value) -> Option<u16> {
    value
        .as_u64()
        .or_else(|| value.as_str()?.trim().parse().ok())
        .and_then(|p| u16::try_from(p).ok())
}

fn parse_vmess(body: &str) -> Option<(String, u16, String)> {
    let decoded = decode_base64_auto(body.split('#').next()?)?;
    let v: serde_json::Value = serde_json::from_str(&decoded).ok()?;
    let server = v.get("add")?.as_str()?.to_string();
    let port = json_port(v.get("port")?)?;
    let remarks = v
        .get("ps")
        .and_then(|s| s.as_str())
        .unwrap_or_default()
        .to_string();
    Some((server, port, remarks))
}

fn parse_shadowsocks(line: &str) -> Option<(String, u16, String)> {
    // SIP002: ss://base64(method:password)@host:port#tag
    if let Ok(url) = Url::parse(line) {
        if let (Some(server), Some(port)) = (host_of(&url), url.port()) {
            let remarks = url.fragment().map(percent_decode).unwrap_or_default();
            return Some((server, port, remarks));
        }
    }

    // Legacy: ss://base64(method:password@host:port)#tag
    let rest = line.strip_prefix("ss://")?;
    let (body, tag) = match rest.split_once('#') {
        Some((body, tag)) => (body, percent_decode(tag)),
        None => (rest, String::new()),
    };
    let decoded = decode_base64_auto(body.trim_end_matches('/'))?;
    let (_, addr) = decoded.rsplit_once('@')?;
    let (host, port) = addr.trim().rsplit_once(':')?;
    Some((host.to_string(), port.parse().ok()?, tag))
}

fn parse_ssr(body: &str) -> Option<(String, u16, String)> {
    // host:port:protocol:method:obfs:base64(password)/?remarks=base64(...)
    let decoded = decode_base64_auto(body)?;
    let (main, query) = match decoded.split_once("/?") {
        Some((main, query)) => (main, Some(query)),
        None => (decoded.as_str(), None),
    };
    let parts: Vec<&str> = main.rsplitn(6, ':').collect();
    if parts.len() < 6 {
        return None;
    }
    // rsplitn yields fields in reverse; host may itself contain ':' (IPv6)
    let port: u16 = parts[4].parse().ok()?;
    let host = parts[5].to_string();
    let remarks = query
        .and_then(|q| {
            q.split('&')
                .find_map(|pair| pair.strip_prefix("remarks="))
                .and_then(decode_base64_auto)
        })
        .unwrap_or_default();
    Some((host, port, remarks))
}

fn try_clash_yaml(text: &str) -> Option<ParseOutcome> {
    if !text.contains("proxies:") {
        return None;
    }
    let root: serde_yaml::Value = serde_yaml::from_str(text).ok()?;
    let proxies = root.get("proxies")?.as_sequence()?;

    let mut descriptors = Vec::new();
    let mut seen = HashSet::new();
    let mut skipped_count = 0;

    for (index, entry) in proxies.iter().enumerate() {
        match clash_entry(entry) {
            Some(descriptor) => {
                if seen.insert(descriptor.key.clone()) {
                    descriptors.push(descriptor);
                }
            }
            None => {
                debug!("Skipping proxies[{}] entry in YAML feed", index);
                skipped_count += 1;
            }
        }
    }

    Some(ParseOutcome {
        descriptors,
        skipped_count,
        format: PayloadFormat::ClashYaml,
    })
}

fn clash_entry(entry: &serde_yaml::Value) -> Option<ConfigDescriptor> {
    let protocol = Protocol::from_scheme(entry.get("type")?.as_str()?)?;
    let server = entry.get("server")?.as_str()?;
    let port = entry.get("port").and_then(|p| {
        p.as_u64()
            .or_else(|| p.as_str()?.trim().parse().ok())
            .and_then(|p| u16::try_from(p).ok())
    })?;
    let remarks = entry
        .get("name")
        .and_then(|n| n.as_str())
        .unwrap_or_default()
        .to_string();
    let raw = serde_json::to_string(entry).ok()?;
    build_descriptor(protocol, server, port, remarks, raw)
}

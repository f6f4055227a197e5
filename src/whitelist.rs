//! Host admission against operator whitelists.

use crate::config::DomainMatch;
use crate::model::{HostKind, Whitelist};

use log::debug;
use std::collections::HashSet;
use std::net::IpAddr;

/// Validate a whitelist entry and normalize it.
///
/// IP literals (with or without IPv6 brackets) are canonicalized; anything
/// else must be a valid domain name and is lowercased.
pub fn classify_host(value: &str) -> Option<(String, HostKind)> {
    let trimmed = value.trim();
    let unbracketed = trimmed.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = unbracketed.parse::<IpAddr>() {
        return Some((ip.to_string(), HostKind::Ip));
    }

    let name = trimmed.trim_end_matches('.');
    if name.is_empty() || name.len() > 253 || name.contains(':') {
        return None;
    }
    match url::Host::parse(name).ok()? {
        url::Host::Domain(domain) => {
            let valid = domain.split('.').all(|label| {
                !label.is_empty()
                    && label.len() <= 63
                    && !label.starts_with('-')
                    && !label.ends_with('-')
                    && label
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            });
            valid.then(|| (domain.to_ascii_lowercase(), HostKind::Domain))
        }
        // url parses dotted-decimal forms like "1.2.3" as IPv4
        url::Host::Ipv4(ip) => Some((ip.to_string(), HostKind::Ip)),
        url::Host::Ipv6(ip) => Some((ip.to_string(), HostKind::Ip)),
    }
}

/// Decides whether a discovered host may be probed and activated.
///
/// Whitelists narrow the candidate set only when at least one active
/// whitelist holds an active host; otherwise every host is admitted.
#[derive(Debug, Clone)]
pub struct WhitelistFilter {
    ips: HashSet<IpAddr>,
    domains: HashSet<String>,
    domain_match: DomainMatch,
}

impl WhitelistFilter {
    /// Build the filter from the current whitelists.
    pub fn from_whitelists(whitelists: &[Whitelist], domain_match: DomainMatch) -> Self {
        let mut ips = HashSet::new();
        let mut domains = HashSet::new();

        for whitelist in whitelists.iter().filter(|w| w.is_active) {
            for host in whitelist.hosts.iter().filter(|h| h.is_active) {
                match classify_host(&host.value) {
                    Some((value, HostKind::Ip)) => {
                        if let Ok(ip) = value.parse() {
                            ips.insert(ip);
                        }
                    }
                    Some((value, HostKind::Domain)) => {
                        domains.insert(value);
                    }
                    None => debug!("Ignoring invalid whitelist host {:?}", host.value),
                }
            }
        }

        Self {
            ips,
            domains,
            domain_match,
        }
    }

    /// Whether the filter narrows anything at all.
    pub fn is_enabled(&self) -> bool {
        !self.ips.is_empty() || !self.domains.is_empty()
    }

    pub fn is_allowed(&self, host: &str) -> bool {
        if !self.is_enabled() {
            return true;
        }

        let host = host.trim().trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            return self.ips.contains(&ip);
        }

        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if self.domains.contains(&host) {
            return true;
        }
        match self.domain_match {
            DomainMatch::Exact => false,
            DomainMatch::Suffix => host
                .match_indices('.')
                .any(|(i, _)| self.domains.contains(&host[i + 1..])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Host;
    use chrono::Utc;

    fn host(value: &str, is_active: bool) -> Host {
        let (value, kind) = classify_host(value).unwrap();
        Host {
            value,
            kind,
            description: String::new(),
            country: String::new(),
            is_active,
            added_at: Utc::now(),
        }
    }

    fn whitelist(id: u64, is_active: bool, hosts: Vec<Host>) -> Whitelist {
        Whitelist {
            id,
            name: format!("wl-{}", id),
            description: String::new(),
            is_active,
            hosts,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn classify_distinguishes_ips_and_domains() {
        assert_eq!(
            classify_host(" 10.0.0.1 "),
            Some(("10.0.0.1".to_string(), HostKind::Ip))
        );
        assert_eq!(
            classify_host("[2001:DB8::1]"),
            Some(("2001:db8::1".to_string(), HostKind::Ip))
        );
        assert_eq!(
            classify_host("Edge.Example.com."),
            Some(("edge.example.com".to_string(), HostKind::Domain))
        );
        assert_eq!(classify_host("bad host"), None);
        assert_eq!(classify_host("-lead.example.com"), None);
        assert_eq!(classify_host(""), None);
    }

    #[test]
    fn no_active_whitelist_admits_everything() {
        let filter = WhitelistFilter::from_whitelists(
            &[whitelist(1, false, vec![host("1.1.1.1", true)])],
            DomainMatch::Exact,
        );
        assert!(!filter.is_enabled());
        assert!(filter.is_allowed("8.8.8.8"));
        assert!(filter.is_allowed("anything.example.org"));
    }

    #[test]
    fn active_whitelist_without_active_hosts_is_a_no_op() {
        let filter = WhitelistFilter::from_whitelists(
            &[
                whitelist(1, true, vec![]),
                whitelist(2, true, vec![host("1.1.1.1", false)]),
            ],
            DomainMatch::Exact,
        );
        assert!(filter.is_allowed("9.9.9.9"));
    }

    #[test]
    fn hosts_from_any_active_whitelist_are_admitted() {
        let filter = WhitelistFilter::from_whitelists(
            &[
                whitelist(1, true, vec![host("1.1.1.1", true)]),
                whitelist(2, true, vec![host("edge.example.com", true)]),
                whitelist(3, false, vec![host("2.2.2.2", true)]),
            ],
            DomainMatch::Exact,
        );
        assert!(filter.is_allowed("1.1.1.1"));
        assert!(filter.is_allowed("EDGE.example.com"));
        assert!(!filter.is_allowed("2.2.2.2"));
        assert!(!filter.is_allowed("sub.edge.example.com"));
    }

    #[test]
    fn ip_literals_compare_by_value() {
        let filter = WhitelistFilter::from_whitelists(
            &[whitelist(1, true, vec![host("2001:db8::1", true)])],
            DomainMatch::Suffix,
        );
        assert!(filter.is_allowed("2001:db8:0:0::1"));
        assert!(filter.is_allowed("[2001:db8::1]"));
        assert!(!filter.is_allowed("2001:db8::2"));
    }

    #[test]
    fn suffix_matching_respects_label_boundaries() {
        let filter = WhitelistFilter::from_whitelists(
            &[whitelist(1, true, vec![host("example.com", true)])],
            DomainMatch::Suffix,
        );
        assert!(filter.is_allowed("example.com"));
        assert!(filter.is_allowed("a.b.example.com"));
        assert!(!filter.is_allowed("badexample.com"));
        assert!(!filter.is_allowed("example.com.evil.net"));
    }
}

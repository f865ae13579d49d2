//! Domain name helpers shared by the server and plugins.

/// Appends the root dot if missing.
pub fn fqdn(name: &str) -> String {
    if name.ends_with('.') { name.to_string() } else { format!("{}.", name) }
}

/// Normalizes a zone as written in a Corefile key or plugin argument:
/// `dns://Example.COM:1053` -> `example.com.`.
pub fn normalize_zone(raw: &str) -> String {
    let host = raw.strip_prefix("dns://").unwrap_or(raw);
    let host = match host.rfind(':') {
        Some(idx) if host[idx + 1..].chars().all(|c| c.is_ascii_digit()) => &host[..idx],
        _ => host,
    };
    let host = host.trim().to_ascii_lowercase();
    if host.is_empty() || host == "." { ".".to_string() } else { fqdn(&host) }
}

/// Labels of a presentation-form name, split on dots that are not backslash-escaped.
pub fn labels(name: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, b) in name.bytes().enumerate() {
        match b {
            _ if escaped => escaped = false,
            b'\\' => escaped = true,
            b'.' => {
                if i > start { out.push(&name[start..i]); }
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < name.len() { out.push(&name[start..]); }
    out
}

/// Label-wise, case-insensitive check that `child` is `parent` or below it.
pub fn is_subdomain(parent: &str, child: &str) -> bool {
    let parent = parent.to_ascii_lowercase();
    let child = child.to_ascii_lowercase();
    let (p, c) = (labels(&parent), labels(&child));
    c.len() >= p.len() && c[c.len() - p.len()..] == p[..]
}

/// Longest zone in `zones` that contains `qname`.
pub fn zone_match<'a>(zones: &'a [String], qname: &str) -> Option<&'a str> {
    zones
        .iter()
        .filter(|zone| is_subdomain(zone, qname))
        .max_by_key(|zone| zone.len())
        .map(String::as_str)
}

/// Prefixes `labels` onto `zone`: `join("ns.dns", "example.com.")` -> `ns.dns.example.com.`.
pub fn join(labels: &str, zone: &str) -> String {
    if zone == "." { format!("{}.", labels) } else { format!("{}.{}", labels, zone) }
}

/// Zones for which a miss is handed to the next plugin instead of answered with NXDOMAIN.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fallthrough {
    zones: Vec<String>,
}

impl Fallthrough {
    /// `fallthrough` with no arguments covers every name.
    pub fn from_args(args: &[String]) -> Self {
        if args.is_empty() {
            return Self { zones: vec![".".to_string()] };
        }
        Self { zones: args.iter().map(|z| normalize_zone(z)).collect() }
    }

    pub fn through(&self, qname: &str) -> bool {
        zone_match(&self.zones, qname).is_some()
    }

    pub fn is_enabled(&self) -> bool {
        !self.zones.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_scheme_port_and_case() {
        assert_eq!(normalize_zone("dns://Example.COM:1053"), "example.com.");
        assert_eq!(normalize_zone(".:53"), ".");
        assert_eq!(normalize_zone("example.com"), "example.com.");
        assert_eq!(normalize_zone("."), ".");
    }

    #[test]
    fn subdomain_is_label_aware() {
        assert!(is_subdomain("example.com.", "svc.example.com."));
        assert!(is_subdomain("example.com.", "EXAMPLE.com."));
        assert!(!is_subdomain("example.com.", "badexample.com."));
        assert!(is_subdomain(".", "anything.org."));
        // an escaped dot belongs to its label
        assert!(!is_subdomain("example.com.", "a\\.example.com."));
        assert!(is_subdomain("example.com.", "a\\.b.example.com."));
    }

    #[test]
    fn labels_respect_escapes() {
        assert_eq!(labels("svc1\\.ns1.example.com."), vec!["svc1\\.ns1", "example", "com"]);
        assert_eq!(labels("a\\\\.b."), vec!["a\\\\", "b"]);
        assert_eq!(labels("x\\046y.z"), vec!["x\\046y", "z"]);
        assert!(labels(".").is_empty());
    }

    #[test]
    fn longest_zone_wins() {
        let zones = vec!["example.com.".to_string(), "lb.example.com.".to_string(), ".".to_string()];
        assert_eq!(zone_match(&zones, "svc.lb.example.com."), Some("lb.example.com."));
        assert_eq!(zone_match(&zones, "svc.example.com."), Some("example.com."));
        assert_eq!(zone_match(&zones, "svc.example.org."), Some("."));
        assert_eq!(zone_match(&zones[..2], "svc.example.org."), None);
    }

    #[test]
    fn join_handles_root() {
        assert_eq!(join("ns.dns", "example.com."), "ns.dns.example.com.");
        assert_eq!(join("hostmaster.dns", "."), "hostmaster.dns.");
    }

    #[test]
    fn fallthrough_scopes() {
        let off = Fallthrough::default();
        assert!(!off.is_enabled());
        assert!(!off.through("a.example.com."));

        let all = Fallthrough::from_args(&[]);
        assert!(all.through("a.example.com."));

        let some = Fallthrough::from_args(&["lb.example.com".to_string()]);
        assert!(some.through("a.lb.example.com."));
        assert!(!some.through("a.example.com."));
    }
}

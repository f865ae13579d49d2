//! Query name -> zone + lookup key.

use crate::dnsutil::{labels, zone_match};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupKey {
    /// The query is the zone apex.
    ZoneOnly,
    /// `<name>.<zone>`: every namespace.
    Name(String),
    /// `<name>.<namespace>.<zone>`
    NamespaceName { namespace: String, name: String },
    /// More labels than a service name can have; never looked up.
    TooDeep,
}

impl LookupKey {
    pub fn mode(&self) -> &'static str {
        match self {
            LookupKey::ZoneOnly => "zone",
            LookupKey::Name(_) => "name",
            LookupKey::NamespaceName { .. } => "namespace_name",
            LookupKey::TooDeep => "too_deep",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Matched zone as spelled in the query.
    pub zone: String,
    pub key: LookupKey,
}

/// Matches fully qualified `qname` against `zones` (normalized) and splits off the service part.
pub fn resolve(qname: &str, zones: &[String]) -> Option<Resolution> {
    let zone = zone_match(zones, qname)?;
    let lower = qname.to_ascii_lowercase();
    let zone_in_query = qname[qname.len() - zone.len()..].to_string();

    if lower.len() == zone.len() {
        return Some(Resolution { zone: zone_in_query, key: LookupKey::ZoneOnly });
    }

    // split on unescaped dots only: `svc1\.ns1` is one label
    let rest = &lower[..lower.len() - zone.len()];
    let key = match labels(rest).as_slice() {
        [] => LookupKey::ZoneOnly,
        [name] => LookupKey::Name(name.to_string()),
        [name, namespace] => LookupKey::NamespaceName { namespace: namespace.to_string(), name: name.to_string() },
        _ => LookupKey::TooDeep,
    };
    Some(Resolution { zone: zone_in_query, key })
}

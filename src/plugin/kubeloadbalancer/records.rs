//! Address and SOA record synthesis.

use super::source::ServiceRecord;
use crate::dnsutil::join;
use crate::types::{QType, Record, ResourceRecord};
use std::net::IpAddr;
use std::sync::Arc;

pub const SOA_REFRESH: u32 = 3600;
pub const SOA_RETRY: u32 = 1800;
pub const SOA_EXPIRE: u32 = 86400;

/// One record per ingress address of every service that fits `qtype`, owned by `qname`.
/// An address is AAAA material when it contains a colon and A material when it does not;
/// either way it must parse as an IP. Anything else is skipped.
pub fn address_records(services: &[Arc<ServiceRecord>], qname: &str, qtype: QType, ttl: u32) -> Vec<ResourceRecord> {
    if !matches!(qtype, QType::A | QType::AAAA) {
        return Vec::new();
    }
    services
        .iter()
        .flat_map(|svc| svc.ingress.iter())
        .filter_map(|ip| address(ip, qtype))
        .map(|data| ResourceRecord { name: qname.to_string(), ttl, data })
        .collect()
}

fn address(ip: &str, qtype: QType) -> Option<Record> {
    let has_colon = ip.contains(':');
    match (qtype, has_colon, ip.parse::<IpAddr>().ok()?) {
        (QType::A, false, IpAddr::V4(addr)) => Some(Record::A { addr }),
        (QType::AAAA, true, IpAddr::V6(addr)) => Some(Record::AAAA { addr }),
        _ => None,
    }
}

/// SOA for `zone`, serial taken from the clock.
pub fn soa(zone: &str, ttl: u32) -> ResourceRecord {
    ResourceRecord {
        name: zone.to_string(),
        ttl,
        data: Record::SOA {
            mname: join("ns.dns", zone),
            rname: join("hostmaster.dns", zone),
            serial: chrono::Utc::now().timestamp() as u32,
            refresh: SOA_REFRESH,
            retry: SOA_RETRY,
            expire: SOA_EXPIRE,
            minimum: ttl,
        },
    }
}

//! Basic types shared by the server, the wire codec and the plugins

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QType { A, AAAA, MX, TXT, CNAME, NS, SOA, PTR, SRV, ANY, Other(u16) }

impl QType {
    pub fn from_u16(v: u16) -> Self {
        match v {
            1 => QType::A, 28 => QType::AAAA, 15 => QType::MX, 16 => QType::TXT, 5 => QType::CNAME,
            2 => QType::NS, 6 => QType::SOA, 12 => QType::PTR, 33 => QType::SRV, 255 => QType::ANY,
            other => QType::Other(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            QType::A => 1, QType::AAAA => 28, QType::MX => 15, QType::TXT => 16, QType::CNAME => 5,
            QType::NS => 2, QType::SOA => 6, QType::PTR => 12, QType::SRV => 33, QType::ANY => 255,
            QType::Other(v) => v,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QType::A => "A", QType::AAAA => "AAAA", QType::MX => "MX", QType::TXT => "TXT", QType::CNAME => "CNAME",
            QType::NS => "NS", QType::SOA => "SOA", QType::PTR => "PTR", QType::SRV => "SRV", QType::ANY => "ANY",
            QType::Other(_) => "OTHER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QClass { IN, CH, HS, Other(u16) }

impl QClass {
    pub fn from_u16(v: u16) -> Self {
        match v { 1 => QClass::IN, 3 => QClass::CH, 4 => QClass::HS, other => QClass::Other(other) }
    }

    pub fn to_u16(self) -> u16 {
        match self { QClass::IN => 1, QClass::CH => 3, QClass::HS => 4, QClass::Other(v) => v }
    }
}

/// Response codes used by the plugins.
pub mod rcode {
    pub const NOERROR: u8 = 0;
    pub const FORMERR: u8 = 1;
    pub const SERVFAIL: u8 = 2;
    pub const NXDOMAIN: u8 = 3;
    pub const NOTIMP: u8 = 4;
    pub const REFUSED: u8 = 5;
}

pub fn rcode_to_str(rcode: u8) -> &'static str {
    match rcode { 0 => "NOERROR", 1 => "FORMERR", 2 => "SERVFAIL", 3 => "NXDOMAIN", 4 => "NOTIMP", 5 => "REFUSED", _ => "UNKNOWN" }
}

/// Record data. Only the types this server ever answers with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    A { addr: Ipv4Addr },
    AAAA { addr: Ipv6Addr },
    SOA { mname: String, rname: String, serial: u32, refresh: u32, retry: u32, expire: u32, minimum: u32 },
}

impl Record {
    pub fn rtype(&self) -> QType {
        match self { Record::A { .. } => QType::A, Record::AAAA { .. } => QType::AAAA, Record::SOA { .. } => QType::SOA }
    }
}

/// A record of class IN with its owner name and TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: String,
    pub ttl: u32,
    pub data: Record,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DnsHeader {
    pub id: u16, pub flags: HeaderFlags,
    pub question_count: u16, pub answer_count: u16,
    pub authority_count: u16, pub additional_count: u16,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderFlags {
    pub qr: bool, pub opcode: u8, pub aa: bool, pub tc: bool,
    pub rd: bool, pub ra: bool, pub cd: bool, pub rcode: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion { pub name: String, pub qtype: QType, pub qclass: QClass }

#[derive(Debug, Clone, Default)]
pub struct DnsMessage {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<ResourceRecord>,
    pub authority: Vec<ResourceRecord>,

    pub raw_query: Vec<u8>,
    pub raw_response: Option<Vec<u8>>,
    pub halt_chain: bool,

    pub client_addr: Option<SocketAddr>,
    pub protocol: String,

    // request context for logging and metrics
    pub server_port: Option<u16>,
    pub zone: String,
    pub start_time: Option<std::time::Instant>,
    pub answered_by: String,
}

impl DnsMessage {
    /// Builds an unanswered message around a raw query as received from a listener.
    pub fn from_raw(raw_query: Vec<u8>, client_addr: Option<SocketAddr>, protocol: &str, server_port: u16) -> Self {
        Self {
            raw_query,
            client_addr,
            protocol: protocol.to_string(),
            server_port: Some(server_port),
            ..Default::default()
        }
    }

    pub fn question(&self) -> Option<&DnsQuestion> {
        self.questions.first()
    }
}

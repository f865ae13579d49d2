//! DNS wire format: query decoding and response encoding.
//!
//! Only what the server needs: the header and first question of a query, and responses
//! carrying A, AAAA and SOA records. Names are written uncompressed.

use crate::types::{DnsHeader, DnsMessage, DnsQuestion, HeaderFlags, QClass, QType, Record, ResourceRecord};
use anyhow::Result;

pub const HEADER_LEN: usize = 12;
/// Largest UDP payload sent without truncation.
pub const MAX_UDP_PAYLOAD: usize = 1232;

const MAX_POINTER_JUMPS: usize = 16;

/// Decodes header and questions of `msg.raw_query` into `msg`.
pub fn decode_query(msg: &mut DnsMessage) -> Result<()> {
    let raw = &msg.raw_query;
    if raw.len() < HEADER_LEN { anyhow::bail!("message shorter than a DNS header ({} bytes)", raw.len()); }

    let header = decode_header(raw);
    if header.flags.qr { anyhow::bail!("message is a response, not a query"); }
    if header.question_count == 0 { anyhow::bail!("query carries no question"); }

    let mut offset = HEADER_LEN;
    let mut questions = Vec::with_capacity(header.question_count as usize);
    for _ in 0..header.question_count {
        let (name, next) = read_name(raw, offset)?;
        if next + 4 > raw.len() { anyhow::bail!("question section truncated"); }
        let qtype = u16::from_be_bytes([raw[next], raw[next + 1]]);
        let qclass = u16::from_be_bytes([raw[next + 2], raw[next + 3]]);
        questions.push(DnsQuestion { name, qtype: QType::from_u16(qtype), qclass: QClass::from_u16(qclass) });
        offset = next + 4;
    }

    msg.header = header;
    msg.questions = questions;
    Ok(())
}

fn decode_header(raw: &[u8]) -> DnsHeader {
    let b2 = raw[2];
    let b3 = raw[3];
    DnsHeader {
        id: u16::from_be_bytes([raw[0], raw[1]]),
        flags: HeaderFlags {
            qr: b2 & 0x80 != 0,
            opcode: (b2 >> 3) & 0x0F,
            aa: b2 & 0x04 != 0,
            tc: b2 & 0x02 != 0,
            rd: b2 & 0x01 != 0,
            ra: b3 & 0x80 != 0,
            cd: b3 & 0x10 != 0,
            rcode: b3 & 0x0F,
        },
        question_count: u16::from_be_bytes([raw[4], raw[5]]),
        answer_count: u16::from_be_bytes([raw[6], raw[7]]),
        authority_count: u16::from_be_bytes([raw[8], raw[9]]),
        additional_count: u16::from_be_bytes([raw[10], raw[11]]),
    }
}

/// Reads a possibly compressed name starting at `offset`. Returns the fully qualified name
/// in presentation form, and the offset just past the name in the original position.
/// Label bytes keep their case. A `.` or `\` inside a label is backslash-escaped and bytes
/// outside printable ASCII become `\DDD`, so the name splits back into the same labels.
fn read_name(raw: &[u8], offset: usize) -> Result<(String, usize)> {
    let mut name = String::new();
    let mut pos = offset;
    let mut end = None;
    let mut jumps = 0;

    loop {
        let len = *raw.get(pos).ok_or_else(|| anyhow::anyhow!("name runs past end of message"))? as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        if len & 0xC0 == 0xC0 {
            let low = *raw.get(pos + 1).ok_or_else(|| anyhow::anyhow!("truncated compression pointer"))? as usize;
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS { anyhow::bail!("too many compression pointers"); }
            if end.is_none() { end = Some(pos + 2); }
            pos = ((len & 0x3F) << 8) | low;
            continue;
        }
        if len > 63 { anyhow::bail!("label length {} exceeds 63", len); }
        let label = raw.get(pos + 1..pos + 1 + len).ok_or_else(|| anyhow::anyhow!("label runs past end of message"))?;
        escape_label(&mut name, label);
        name.push('.');
        pos += 1 + len;
    }

    if name.is_empty() { name.push('.'); }
    Ok((name, end.unwrap_or(pos)))
}

fn escape_label(out: &mut String, label: &[u8]) {
    for &b in label {
        match b {
            b'.' | b'\\' => {
                out.push('\\');
                out.push(b as char);
            }
            0x21..=0x7E => out.push(b as char),
            _ => out.push_str(&format!("\\{:03}", b)),
        }
    }
}

/// Inverse of `escape_label` over a whole name: splits on unescaped dots.
fn name_labels(name: &str) -> Vec<Vec<u8>> {
    let bytes = name.as_bytes();
    let mut labels = Vec::new();
    let mut label = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if i + 3 < bytes.len() && bytes[i + 1..i + 4].iter().all(u8::is_ascii_digit) => {
                let value = (bytes[i + 1] - b'0') as u16 * 100 + (bytes[i + 2] - b'0') as u16 * 10 + (bytes[i + 3] - b'0') as u16;
                label.push(value.min(255) as u8);
                i += 4;
            }
            b'\\' if i + 1 < bytes.len() => {
                label.push(bytes[i + 1]);
                i += 2;
            }
            b'.' => {
                if !label.is_empty() { labels.push(std::mem::take(&mut label)); }
                i += 1;
            }
            b => {
                label.push(b);
                i += 1;
            }
        }
    }
    if !label.is_empty() { labels.push(label); }
    labels
}

fn write_name(buf: &mut Vec<u8>, name: &str) {
    for label in name_labels(name) {
        let len = label.len().min(63);
        buf.push(len as u8);
        buf.extend_from_slice(&label[..len]);
    }
    buf.push(0);
}

/// Bytes of the first `count` questions of a query, exactly as received.
fn question_section(raw: &[u8], count: usize) -> Option<&[u8]> {
    let mut offset = HEADER_LEN;
    for _ in 0..count {
        let (_, next) = read_name(raw, offset).ok()?;
        offset = next + 4;
    }
    raw.get(HEADER_LEN..offset)
}

fn write_record(buf: &mut Vec<u8>, rr: &ResourceRecord) {
    write_name(buf, &rr.name);
    buf.extend_from_slice(&rr.data.rtype().to_u16().to_be_bytes());
    buf.extend_from_slice(&QClass::IN.to_u16().to_be_bytes());
    buf.extend_from_slice(&rr.ttl.to_be_bytes());

    let mut rdata = Vec::new();
    match &rr.data {
        Record::A { addr } => rdata.extend_from_slice(&addr.octets()),
        Record::AAAA { addr } => rdata.extend_from_slice(&addr.octets()),
        Record::SOA { mname, rname, serial, refresh, retry, expire, minimum } => {
            write_name(&mut rdata, mname);
            write_name(&mut rdata, rname);
            for v in [serial, refresh, retry, expire, minimum] { rdata.extend_from_slice(&v.to_be_bytes()); }
        }
    }
    buf.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    buf.extend_from_slice(&rdata);
}

/// Encodes `msg` as a reply to its query: id, opcode, RD and CD are copied from the query,
/// QR is set, AA and rcode come from `msg.header.flags`.
pub fn encode_response(msg: &DnsMessage) -> Vec<u8> {
    let flags = msg.header.flags;
    let mut buf = Vec::with_capacity(512);
    buf.extend_from_slice(&msg.header.id.to_be_bytes());

    let mut b2 = 0x80 | ((flags.opcode & 0x0F) << 3);
    if flags.aa { b2 |= 0x04; }
    if flags.rd { b2 |= 0x01; }
    let mut b3 = flags.rcode & 0x0F;
    if flags.cd { b3 |= 0x10; }
    buf.push(b2);
    buf.push(b3);

    buf.extend_from_slice(&(msg.questions.len() as u16).to_be_bytes());
    buf.extend_from_slice(&(msg.answers.len() as u16).to_be_bytes());
    buf.extend_from_slice(&(msg.authority.len() as u16).to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());

    // echo the question verbatim when the query is at hand, so compression and odd label
    // bytes come back unchanged
    match question_section(&msg.raw_query, msg.questions.len()) {
        Some(section) => buf.extend_from_slice(section),
        None => {
            for q in &msg.questions {
                write_name(&mut buf, &q.name);
                buf.extend_from_slice(&q.qtype.to_u16().to_be_bytes());
                buf.extend_from_slice(&q.qclass.to_u16().to_be_bytes());
            }
        }
    }
    for rr in msg.answers.iter().chain(msg.authority.iter()) {
        write_record(&mut buf, rr);
    }
    buf
}

/// Minimal error reply for a query that could not be decoded: the query echoed back with
/// QR set and the given rcode. `None` when the input is too short to carry an id.
pub fn error_response(query: &[u8], rcode: u8) -> Option<Vec<u8>> {
    if query.len() < HEADER_LEN { return None; }
    let mut resp = query.to_vec();
    resp[2] |= 0x80;
    resp[3] = (resp[3] & 0xF0) | (rcode & 0x0F);
    Some(resp)
}

/// Cuts an oversized response down to header and question with TC set.
pub fn truncate(resp: &[u8]) -> Vec<u8> {
    if resp.len() < HEADER_LEN { return resp.to_vec(); }
    let qdcount = u16::from_be_bytes([resp[4], resp[5]]);
    let mut offset = HEADER_LEN;
    for _ in 0..qdcount {
        match read_name(resp, offset) {
            Ok((_, next)) => offset = (next + 4).min(resp.len()),
            Err(_) => { offset = HEADER_LEN; break; }
        }
    }
    let mut out = resp[..offset].to_vec();
    out[2] |= 0x02;
    if offset == HEADER_LEN { out[4] = 0; out[5] = 0; }
    for b in &mut out[6..HEADER_LEN] { *b = 0; }
    out
}

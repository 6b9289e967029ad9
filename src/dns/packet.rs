//! DNS wire format (RFC 1035): header, questions, resource records with
//! message-compression pointers, and reply synthesis for blocked queries.
//!
//! Malformed packets parse to `None`; nothing here panics on hostile input.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Record type mnemonics handled with typed rdata; everything else is kept
/// as hex.
pub mod rtype {
    pub const A: u16 = 1;
    pub const NS: u16 = 2;
    pub const CNAME: u16 = 5;
    pub const SOA: u16 = 6;
    pub const PTR: u16 = 12;
    pub const MX: u16 = 15;
    pub const TXT: u16 = 16;
    pub const AAAA: u16 = 28;
    pub const SRV: u16 = 33;
    pub const ANY: u16 = 255;
}

/// Mnemonic for a record type ("A", "AAAA", … or "TYPE<n>").
pub fn type_name(rtype: u16) -> String {
    match rtype {
        rtype::A => "A".to_string(),
        rtype::NS => "NS".to_string(),
        rtype::CNAME => "CNAME".to_string(),
        rtype::SOA => "SOA".to_string(),
        rtype::PTR => "PTR".to_string(),
        rtype::MX => "MX".to_string(),
        rtype::TXT => "TXT".to_string(),
        rtype::AAAA => "AAAA".to_string(),
        rtype::SRV => "SRV".to_string(),
        rtype::ANY => "ANY".to_string(),
        other => format!("TYPE{other}"),
    }
}

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_NXDOMAIN: u8 = 3;

/// TTL used for forged redirect answers.
pub const REDIRECT_TTL: u32 = 300;

/// Compression pointers followed per name before giving up; loop guard.
const MAX_POINTER_JUMPS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// Decoded rdata, stringly for storage and display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordData(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub name: String,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: RecordData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsPacket {
    pub id: u16,
    pub is_response: bool,
    pub opcode: u8,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub rcode: u8,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authority: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
}

impl DnsPacket {
    /// Primary queried name, lowercased without the trailing dot.
    pub fn query_name(&self) -> Option<String> {
        self.questions
            .first()
            .map(|q| q.name.trim_end_matches('.').to_ascii_lowercase())
    }

    pub fn query_type(&self) -> Option<String> {
        self.questions.first().map(|q| type_name(q.qtype))
    }

    /// Addresses from A/AAAA answers.
    pub fn resolved_ips(&self) -> Vec<String> {
        self.answers
            .iter()
            .filter(|r| r.rtype == rtype::A || r.rtype == rtype::AAAA)
            .map(|r| r.rdata.0.clone())
            .collect()
    }

    /// Minimum TTL across answers, if any.
    pub fn answer_ttl(&self) -> Option<u32> {
        self.answers.iter().map(|r| r.ttl).min()
    }
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*data.get(offset)?, *data.get(offset + 1)?]))
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    Some(u32::from_be_bytes([
        *data.get(offset)?,
        *data.get(offset + 1)?,
        *data.get(offset + 2)?,
        *data.get(offset + 3)?,
    ]))
}

/// Parse a name starting at `offset`, following compression pointers.
/// Returns the name and the offset just past it in the original stream.
fn parse_name(data: &[u8], mut offset: usize) -> Option<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut resume = None;
    let mut jumps = 0;

    loop {
        let len = *data.get(offset)? as usize;
        if len == 0 {
            offset += 1;
            break;
        }
        if len & 0xC0 == 0xC0 {
            if jumps >= MAX_POINTER_JUMPS {
                return None;
            }
            jumps += 1;
            let pointer = (((len & 0x3F) << 8) | *data.get(offset + 1)? as usize) & 0x3FFF;
            if resume.is_none() {
                resume = Some(offset + 2);
            }
            offset = pointer;
            continue;
        }
        if len > 63 {
            return None;
        }
        let label = data.get(offset + 1..offset + 1 + len)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        offset += 1 + len;
    }

    Some((labels.join("."), resume.unwrap_or(offset)))
}

fn parse_record(data: &[u8], offset: usize) -> Option<(ResourceRecord, usize)> {
    let (name, mut offset) = parse_name(data, offset)?;
    let rtype = read_u16(data, offset)?;
    let rclass = read_u16(data, offset + 2)?;
    let ttl = read_u32(data, offset + 4)?;
    let rdlength = read_u16(data, offset + 8)? as usize;
    offset += 10;
    if offset + rdlength > data.len() {
        return None;
    }
    let rdata = parse_rdata(data, offset, rtype, rdlength);
    Some((
        ResourceRecord {
            name,
            rtype,
            rclass,
            ttl,
            rdata: RecordData(rdata),
        },
        offset + rdlength,
    ))
}

fn parse_rdata(data: &[u8], offset: usize, rtype: u16, rdlength: usize) -> String {
    let raw = &data[offset..offset + rdlength];
    match rtype {
        rtype::A if rdlength == 4 => Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]).to_string(),
        rtype::AAAA if rdlength == 16 => {
            let mut groups = [0u16; 8];
            for (i, group) in groups.iter_mut().enumerate() {
                *group = u16::from_be_bytes([raw[i * 2], raw[i * 2 + 1]]);
            }
            groups
                .iter()
                .map(|g| format!("{g:x}"))
                .collect::<Vec<_>>()
                .join(":")
        }
        rtype::CNAME | rtype::NS | rtype::PTR => parse_name(data, offset)
            .map(|(name, _)| name)
            .unwrap_or_else(|| hex::encode(raw)),
        rtype::MX if rdlength >= 3 => {
            let preference = u16::from_be_bytes([raw[0], raw[1]]);
            match parse_name(data, offset + 2) {
                Some((name, _)) => format!("{preference} {name}"),
                None => hex::encode(raw),
            }
        }
        rtype::TXT => {
            let mut texts = Vec::new();
            let mut pos = 0;
            while pos < raw.len() {
                let len = raw[pos] as usize;
                pos += 1;
                if pos + len > raw.len() {
                    break;
                }
                texts.push(String::from_utf8_lossy(&raw[pos..pos + len]).into_owned());
                pos += len;
            }
            texts.join(" ")
        }
        rtype::SRV if rdlength >= 7 => {
            let priority = u16::from_be_bytes([raw[0], raw[1]]);
            let weight = u16::from_be_bytes([raw[2], raw[3]]);
            let port = u16::from_be_bytes([raw[4], raw[5]]);
            match parse_name(data, offset + 6) {
                Some((target, _)) => format!("{priority} {weight} {port} {target}"),
                None => hex::encode(raw),
            }
        }
        rtype::SOA => match parse_name(data, offset) {
            Some((mname, pos)) => match parse_name(data, pos) {
                Some((rname, pos)) => match read_u32(data, pos) {
                    Some(serial) if pos + 20 <= offset + rdlength => {
                        format!("{mname} {rname} {serial}")
                    }
                    _ => format!("{mname} {rname}"),
                },
                None => hex::encode(raw),
            },
            None => hex::encode(raw),
        },
        _ => hex::encode(raw),
    }
}

/// Parse a DNS message from a UDP payload.
pub fn parse(data: &[u8]) -> Option<DnsPacket> {
    if data.len() < 12 {
        return None;
    }
    let id = read_u16(data, 0)?;
    let flags = read_u16(data, 2)?;
    let qdcount = read_u16(data, 4)?;
    let ancount = read_u16(data, 6)?;
    let nscount = read_u16(data, 8)?;
    let arcount = read_u16(data, 10)?;

    let mut packet = DnsPacket {
        id,
        is_response: flags & 0x8000 != 0,
        opcode: ((flags >> 11) & 0x0F) as u8,
        authoritative: flags & 0x0400 != 0,
        truncated: flags & 0x0200 != 0,
        recursion_desired: flags & 0x0100 != 0,
        recursion_available: flags & 0x0080 != 0,
        rcode: (flags & 0x000F) as u8,
        questions: Vec::new(),
        answers: Vec::new(),
        authority: Vec::new(),
        additional: Vec::new(),
    };

    let mut offset = 12;
    for _ in 0..qdcount.min(32) {
        let (name, next) = parse_name(data, offset)?;
        let qtype = read_u16(data, next)?;
        let qclass = read_u16(data, next + 2)?;
        offset = next + 4;
        packet.questions.push(Question { name, qtype, qclass });
    }

    for (count, section) in [
        (ancount, &mut packet.answers),
        (nscount, &mut packet.authority),
        (arcount, &mut packet.additional),
    ] {
        for _ in 0..count.min(256) {
            match parse_record(data, offset) {
                Some((record, next)) => {
                    section.push(record);
                    offset = next;
                }
                // Tolerate a truncated tail; keep what parsed.
                None => return Some(packet),
            }
        }
    }
    Some(packet)
}

/// Encode a domain name as length-prefixed labels.
pub fn encode_name(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + 2);
    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() {
            continue;
        }
        let label = &label.as_bytes()[..label.len().min(63)];
        out.push(label.len() as u8);
        out.extend_from_slice(label);
    }
    out.push(0);
    out
}

fn encode_header(query: &DnsPacket, rcode: u8, ancount: u16) -> Vec<u8> {
    let mut flags: u16 = 0x8000; // QR = response
    flags |= (query.opcode as u16 & 0x0F) << 11;
    flags |= 0x0400; // AA
    if query.recursion_desired {
        flags |= 0x0100;
    }
    flags |= rcode as u16 & 0x0F;

    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&query.id.to_be_bytes());
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(&(query.questions.len() as u16).to_be_bytes());
    out.extend_from_slice(&ancount.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out
}

fn encode_questions(query: &DnsPacket, out: &mut Vec<u8>) {
    for q in &query.questions {
        out.extend_from_slice(&encode_name(&q.name));
        out.extend_from_slice(&q.qtype.to_be_bytes());
        out.extend_from_slice(&q.qclass.to_be_bytes());
    }
}

/// Forge an authoritative NXDOMAIN reply echoing the question.
pub fn build_nxdomain(query: &DnsPacket) -> Vec<u8> {
    let mut out = encode_header(query, RCODE_NXDOMAIN, 0);
    encode_questions(query, &mut out);
    out
}

/// Forge a NOERROR reply with a single A record pointing at `redirect`.
pub fn build_redirect(query: &DnsPacket, redirect: Ipv4Addr) -> Vec<u8> {
    let mut out = encode_header(query, RCODE_NOERROR, 1);
    encode_questions(query, &mut out);
    // Answer name: compression pointer to the first question at offset 12.
    out.extend_from_slice(&[0xC0, 0x0C]);
    out.extend_from_slice(&rtype::A.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // IN
    out.extend_from_slice(&REDIRECT_TTL.to_be_bytes());
    out.extend_from_slice(&4u16.to_be_bytes());
    out.extend_from_slice(&redirect.octets());
    out
}

/// Build a simple query, used for reverse-DNS lookups.
pub fn build_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let query = DnsPacket {
        id,
        is_response: false,
        opcode: 0,
        authoritative: false,
        truncated: false,
        recursion_desired: true,
        recursion_available: false,
        rcode: 0,
        questions: vec![Question {
            name: name.to_string(),
            qtype,
            qclass: 1,
        }],
        answers: Vec::new(),
        authority: Vec::new(),
        additional: Vec::new(),
    };
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&[0; 6]);
    encode_questions(&query, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_packet(id: u16, name: &str, qtype: u16) -> DnsPacket {
        parse(&build_query(id, name, qtype)).unwrap()
    }

    #[test]
    fn test_parse_query() {
        let packet = query_packet(0x1234, "ads.example", rtype::A);
        assert_eq!(packet.id, 0x1234);
        assert!(!packet.is_response);
        assert!(packet.recursion_desired);
        assert_eq!(packet.query_name().as_deref(), Some("ads.example"));
        assert_eq!(packet.query_type().as_deref(), Some("A"));
    }

    #[test]
    fn test_nxdomain_roundtrip() {
        // A forged reply echoes the id and question with QR=1, AA=1,
        // RCODE=3, and no answers.
        let query = query_packet(0x1234, "ads.example", rtype::A);
        let reply = parse(&build_nxdomain(&query)).unwrap();
        assert_eq!(reply.id, 0x1234);
        assert!(reply.is_response);
        assert!(reply.authoritative);
        assert_eq!(reply.rcode, RCODE_NXDOMAIN);
        assert_eq!(reply.questions, query.questions);
        assert!(reply.answers.is_empty());
    }

    #[test]
    fn test_redirect_roundtrip() {
        let query = query_packet(0xBEEF, "blocked.example", rtype::A);
        let redirect = Ipv4Addr::new(10, 0, 0, 1);
        let reply = parse(&build_redirect(&query, redirect)).unwrap();
        assert_eq!(reply.id, 0xBEEF);
        assert_eq!(reply.rcode, RCODE_NOERROR);
        assert_eq!(reply.answers.len(), 1);
        let answer = &reply.answers[0];
        assert_eq!(answer.rtype, rtype::A);
        assert_eq!(answer.ttl, REDIRECT_TTL);
        assert_eq!(answer.rdata.0, "10.0.0.1");
        // Compression pointer resolves back to the question name.
        assert_eq!(answer.name, "blocked.example");
        assert_eq!(reply.resolved_ips(), vec!["10.0.0.1"]);
    }

    #[test]
    fn test_malformed_inputs_do_not_panic() {
        assert!(parse(&[]).is_none());
        assert!(parse(&[0u8; 11]).is_none());
        // Header claims questions that are not present.
        let mut bogus = vec![0u8; 12];
        bogus[4] = 0;
        bogus[5] = 4;
        assert!(parse(&bogus).is_none());
    }

    #[test]
    fn test_pointer_loop_is_rejected() {
        // A name that points at itself.
        let mut data = vec![0u8; 12];
        data[4] = 0;
        data[5] = 1; // one question
        data.extend_from_slice(&[0xC0, 0x0C]); // pointer to offset 12 (itself)
        data.extend_from_slice(&[0, 1, 0, 1]);
        assert!(parse(&data).is_none());
    }

    #[test]
    fn test_txt_and_mx_rdata() {
        // Hand-built response with one TXT and one MX answer.
        let mut data = Vec::new();
        data.extend_from_slice(&0x42u16.to_be_bytes());
        data.extend_from_slice(&0x8180u16.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes()); // qd
        data.extend_from_slice(&2u16.to_be_bytes()); // an
        data.extend_from_slice(&[0; 4]);
        data.extend_from_slice(&encode_name("example.com"));
        data.extend_from_slice(&rtype::TXT.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes());

        // TXT answer
        data.extend_from_slice(&[0xC0, 0x0C]);
        data.extend_from_slice(&rtype::TXT.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&60u32.to_be_bytes());
        data.extend_from_slice(&6u16.to_be_bytes());
        data.extend_from_slice(&[5]);
        data.extend_from_slice(b"hello");

        // MX answer
        data.extend_from_slice(&[0xC0, 0x0C]);
        data.extend_from_slice(&rtype::MX.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&60u32.to_be_bytes());
        let mx_rdata_len = 2 + encode_name("mail.example.com").len();
        data.extend_from_slice(&(mx_rdata_len as u16).to_be_bytes());
        data.extend_from_slice(&10u16.to_be_bytes());
        data.extend_from_slice(&encode_name("mail.example.com"));

        let packet = parse(&data).unwrap();
        assert_eq!(packet.answers.len(), 2);
        assert_eq!(packet.answers[0].rdata.0, "hello");
        assert_eq!(packet.answers[1].rdata.0, "10 mail.example.com");
    }

    #[test]
    fn test_aaaa_rdata() {
        let mut data = Vec::new();
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&0x8180u16.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&[0; 4]);
        data.extend_from_slice(&encode_name("v6.example"));
        data.extend_from_slice(&rtype::AAAA.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&30u32.to_be_bytes());
        data.extend_from_slice(&16u16.to_be_bytes());
        let mut addr = [0u8; 16];
        addr[0] = 0x20;
        addr[1] = 0x01;
        addr[15] = 0x01;
        data.extend_from_slice(&addr);

        let packet = parse(&data).unwrap();
        assert_eq!(packet.answers[0].rdata.0, "2001:0:0:0:0:0:0:1");
    }

    #[test]
    fn test_unknown_type_kept_as_hex() {
        let mut data = Vec::new();
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&0x8180u16.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&[0; 4]);
        data.extend_from_slice(&encode_name("x.example"));
        data.extend_from_slice(&99u16.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&30u32.to_be_bytes());
        data.extend_from_slice(&2u16.to_be_bytes());
        data.extend_from_slice(&[0xAB, 0xCD]);

        let packet = parse(&data).unwrap();
        assert_eq!(packet.answers[0].rdata.0, "abcd");
        assert_eq!(type_name(99), "TYPE99");
    }
}

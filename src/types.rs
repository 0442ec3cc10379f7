//! Basic DNS message types shared by the context and the plugins

use anyhow::{bail, Result};
use std::fmt;

pub const HEADER_LEN: usize = 12;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_FORMERR: u8 = 1;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_NXDOMAIN: u8 = 3;
pub const RCODE_REFUSED: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QType { A, AAAA, MX, TXT, CNAME, NS, SOA, PTR, SRV, ANY, Other(u16) }

impl QType {
    pub fn code(self) -> u16 {
        match self {
            QType::A => 1, QType::NS => 2, QType::CNAME => 5, QType::SOA => 6,
            QType::PTR => 12, QType::MX => 15, QType::TXT => 16, QType::AAAA => 28,
            QType::SRV => 33, QType::ANY => 255, QType::Other(code) => code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            1 => QType::A, 2 => QType::NS, 5 => QType::CNAME, 6 => QType::SOA,
            12 => QType::PTR, 15 => QType::MX, 16 => QType::TXT, 28 => QType::AAAA,
            33 => QType::SRV, 255 => QType::ANY, other => QType::Other(other),
        }
    }

    /// Label used by the metrics collectors.
    pub fn label(self) -> &'static str {
        match self {
            QType::A => "A", QType::AAAA => "AAAA", QType::MX => "MX", QType::TXT => "TXT",
            QType::CNAME => "CNAME", QType::NS => "NS", QType::SOA => "SOA", QType::PTR => "PTR",
            QType::SRV => "SRV", QType::ANY => "ANY", QType::Other(_) => "OTHER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QClass { IN, CH, HS, Other(u16) }

impl QClass {
    pub fn code(self) -> u16 {
        match self { QClass::IN => 1, QClass::CH => 3, QClass::HS => 4, QClass::Other(code) => code }
    }

    pub fn from_code(code: u16) -> Self {
        match code { 1 => QClass::IN, 3 => QClass::CH, 4 => QClass::HS, other => QClass::Other(other) }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderFlags {
    pub qr: bool, pub opcode: u8, pub aa: bool, pub tc: bool,
    pub rd: bool, pub ra: bool, pub rcode: u8,
}

impl HeaderFlags {
    fn from_bytes(hi: u8, lo: u8) -> Self {
        Self {
            qr: hi & 0x80 != 0,
            opcode: (hi >> 3) & 0x0F,
            aa: hi & 0x04 != 0,
            tc: hi & 0x02 != 0,
            rd: hi & 0x01 != 0,
            ra: lo & 0x80 != 0,
            rcode: lo & 0x0F,
        }
    }

    fn to_bytes(self) -> [u8; 2] {
        let mut hi = (self.opcode & 0x0F) << 3;
        if self.qr { hi |= 0x80; }
        if self.aa { hi |= 0x04; }
        if self.tc { hi |= 0x02; }
        if self.rd { hi |= 0x01; }
        let mut lo = self.rcode & 0x0F;
        if self.ra { lo |= 0x80; }
        [hi, lo]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16, pub flags: HeaderFlags,
    pub question_count: u16, pub answer_count: u16,
    pub authority_count: u16, pub additional_count: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion { pub name: String, pub qtype: QType, pub qclass: QClass }

impl fmt::Display for DnsQuestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{} {} {}}}", self.name, self.qtype.code(), self.qclass.code())
    }
}

/// A decoded DNS message together with the wire bytes it came from.
///
/// Only the header and the question section are decoded; the remaining
/// sections travel untouched in `raw`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsMessage {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub raw: Vec<u8>,
}

impl DnsMessage {
    /// Build a query carrying the given questions, encoded to wire format.
    ///
    /// The question section is capped at `u16::MAX` entries, the most the
    /// header can count.
    pub fn query(id: u16, mut questions: Vec<DnsQuestion>) -> Self {
        let question_count = count_of(&questions);
        questions.truncate(question_count as usize);
        let header = DnsHeader {
            id,
            flags: HeaderFlags { rd: true, ..HeaderFlags::default() },
            question_count,
            ..DnsHeader::default()
        };
        let raw = encode(&header, &questions);
        Self { header, questions, raw }
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            bail!("message too short: {} bytes", bytes.len());
        }
        let read_u16 = |at: usize| ((bytes[at] as u16) << 8) | (bytes[at + 1] as u16);
        let header = DnsHeader {
            id: read_u16(0),
            flags: HeaderFlags::from_bytes(bytes[2], bytes[3]),
            question_count: read_u16(4),
            answer_count: read_u16(6),
            authority_count: read_u16(8),
            additional_count: read_u16(10),
        };

        let mut offset = HEADER_LEN;
        // every question takes at least 5 bytes, don't trust the header count beyond that
        let fits = (bytes.len() - HEADER_LEN) / 5;
        let mut questions = Vec::with_capacity((header.question_count as usize).min(fits));
        for _ in 0..header.question_count {
            let (name, next) = read_name(bytes, offset)?;
            if next + 4 > bytes.len() {
                bail!("truncated question for '{}'", name);
            }
            questions.push(DnsQuestion {
                name,
                qtype: QType::from_code(read_u16(next)),
                qclass: QClass::from_code(read_u16(next + 2)),
            });
            offset = next + 4;
        }

        Ok(Self { header, questions, raw: bytes.to_vec() })
    }

    pub fn id(&self) -> u16 { self.header.id }

    pub fn rcode(&self) -> u8 { self.header.flags.rcode }

    /// Rewrite the message id in both the decoded header and the wire bytes.
    pub fn set_id(&mut self, id: u16) {
        self.header.id = id;
        if self.raw.len() >= 2 {
            self.raw[..2].copy_from_slice(&id.to_be_bytes());
        }
    }

    /// Header-only response to this query carrying `rcode`.
    pub fn reply_with_rcode(&self, rcode: u8) -> Self {
        let question_count = count_of(&self.questions);
        let questions = self.questions[..question_count as usize].to_vec();
        let header = DnsHeader {
            id: self.header.id,
            flags: HeaderFlags {
                qr: true,
                opcode: self.header.flags.opcode,
                rd: self.header.flags.rd,
                ra: true,
                rcode,
                ..HeaderFlags::default()
            },
            question_count,
            ..DnsHeader::default()
        };
        let raw = encode(&header, &questions);
        Self { header, questions, raw }
    }
}

pub fn rcode_to_str(rcode: u8) -> &'static str {
    match rcode { 0 => "NOERROR", 1 => "FORMERR", 2 => "SERVFAIL", 3 => "NXDOMAIN", 4 => "NOTIMP", 5 => "REFUSED", _ => "UNKNOWN" }
}

/// Render a question list the way the summary fallback expects: `[{a. 1 1} {b. 28 1}]`.
pub fn format_questions(questions: &[DnsQuestion]) -> String {
    let inner: Vec<String> = questions.iter().map(|q| q.to_string()).collect();
    format!("[{}]", inner.join(" "))
}

fn count_of(questions: &[DnsQuestion]) -> u16 {
    u16::try_from(questions.len()).unwrap_or(u16::MAX)
}

fn read_name(bytes: &[u8], mut offset: usize) -> Result<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    loop {
        let Some(&len) = bytes.get(offset) else { bail!("name runs past end of message") };
        offset += 1;
        if len == 0 { break; }
        if len & 0xC0 != 0 {
            bail!("compressed names are not supported in the question section");
        }
        let end = offset + len as usize;
        if end > bytes.len() {
            bail!("label runs past end of message");
        }
        labels.push(String::from_utf8_lossy(&bytes[offset..end]).into_owned());
        offset = end;
    }
    let name = if labels.is_empty() { ".".to_string() } else { format!("{}.", labels.join(".")) };
    Ok((name, offset))
}

fn encode(header: &DnsHeader, questions: &[DnsQuestion]) -> Vec<u8> {
    let mut out = Vec::with_capacity(512);
    out.extend_from_slice(&header.id.to_be_bytes());
    out.extend_from_slice(&header.flags.to_bytes());
    out.extend_from_slice(&header.question_count.to_be_bytes());
    out.extend_from_slice(&header.answer_count.to_be_bytes());
    out.extend_from_slice(&header.authority_count.to_be_bytes());
    out.extend_from_slice(&header.additional_count.to_be_bytes());
    for q in questions {
        for label in q.name.trim_end_matches('.').split('.').filter(|l| !l.is_empty()) {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        out.extend_from_slice(&q.qtype.code().to_be_bytes());
        out.extend_from_slice(&q.qclass.code().to_be_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(name: &str, qtype: QType) -> DnsQuestion {
        DnsQuestion { name: name.to_string(), qtype, qclass: QClass::IN }
    }

    #[test]
    fn test_decode_query_built_from_questions() {
        let q = DnsMessage::query(0x1234, vec![question("example.com.", QType::AAAA)]);
        let decoded = DnsMessage::from_wire(&q.raw).unwrap();
        assert_eq!(decoded.id(), 0x1234);
        assert!(decoded.header.flags.rd);
        assert!(!decoded.header.flags.qr);
        assert_eq!(decoded.questions, vec![question("example.com.", QType::AAAA)]);
    }

    #[test]
    fn test_decode_rejects_short_and_truncated_messages() {
        assert!(DnsMessage::from_wire(&[0u8; 5]).is_err());

        let q = DnsMessage::query(7, vec![question("example.com.", QType::A)]);
        let cut = &q.raw[..q.raw.len() - 2];
        assert!(DnsMessage::from_wire(cut).is_err());
    }

    #[test]
    fn test_decode_bare_header_with_huge_question_count() {
        let mut raw = [0u8; HEADER_LEN];
        raw[4] = 0xFF;
        raw[5] = 0xFF;
        assert!(DnsMessage::from_wire(&raw).is_err());
    }

    #[test]
    fn test_question_count_saturates() {
        let qs = vec![question("a.", QType::A); u16::MAX as usize + 1];
        let q = DnsMessage::query(9, qs);
        assert_eq!(q.header.question_count, u16::MAX);
        assert_eq!(q.questions.len(), u16::MAX as usize);

        let reply = q.reply_with_rcode(RCODE_NOERROR);
        assert_eq!(reply.header.question_count, u16::MAX);
        let decoded = DnsMessage::from_wire(&reply.raw).unwrap();
        assert_eq!(decoded.questions.len(), u16::MAX as usize);
    }

    #[test]
    fn test_decode_rejects_compression_pointer_in_question() {
        let mut raw = DnsMessage::query(1, vec![]).raw;
        raw[5] = 1;
        raw.extend_from_slice(&[0xC0, 0x0C, 0, 1, 0, 1]);
        assert!(DnsMessage::from_wire(&raw).is_err());
    }

    #[test]
    fn test_reply_with_rcode_sets_response_bits() {
        let q = DnsMessage::query(0xBEEF, vec![question("example.org.", QType::A)]);
        let reply = DnsMessage::from_wire(&q.reply_with_rcode(RCODE_REFUSED).raw).unwrap();
        assert_eq!(reply.id(), 0xBEEF);
        assert!(reply.header.flags.qr);
        assert!(reply.header.flags.rd);
        assert_eq!(reply.rcode(), RCODE_REFUSED);
        assert_eq!(rcode_to_str(reply.rcode()), "REFUSED");
        assert_eq!(reply.questions, q.questions);
    }

    #[test]
    fn test_set_id_rewrites_wire_bytes() {
        let mut q = DnsMessage::query(1, vec![question("a.", QType::A)]);
        q.set_id(0x0102);
        assert_eq!(&q.raw[..2], &[0x01, 0x02]);
        assert_eq!(DnsMessage::from_wire(&q.raw).unwrap().id(), 0x0102);
    }

    #[test]
    fn test_format_questions() {
        assert_eq!(format_questions(&[]), "[]");
        let qs = vec![question("a.", QType::A), question("b.", QType::Other(65))];
        assert_eq!(format_questions(&qs), "[{a. 1 1} {b. 65 1}]");
    }

    #[test]
    fn test_root_name_round_trips() {
        let q = DnsMessage::query(3, vec![question(".", QType::NS)]);
        assert_eq!(DnsMessage::from_wire(&q.raw).unwrap().questions[0].name, ".");
    }
}

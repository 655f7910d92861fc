//! Just enough DNS to answer A queries locally.
//!
//! Only plain single-question queries are understood. Anything else (multiple questions,
//! compressed question names, non-QUERY opcodes, responses) is reported as unsupported so the
//! caller can forward the datagram untouched.

use core::net::Ipv4Addr;

use super::{ensure_len, ensure_out_buf_len, PacketError};

pub const DNS_HEADER_LEN: usize = 12;
pub const QTYPE_A: u16 = 1;
pub const QTYPE_AAAA: u16 = 28;
pub const QCLASS_IN: u16 = 1;

const FLAG_QR: u16 = 0x8000;
const OPCODE_MASK: u16 = 0x7800;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;

/// A single-question DNS query, borrowing the question from the datagram.
#[derive(Clone, Copy, Debug)]
pub struct DnsQuery<'a> {
    pub id: u16,
    pub flags: u16,
    /// Wire-format QNAME including the terminating zero-length label.
    pub qname: &'a [u8],
    pub qtype: u16,
    pub qclass: u16,
}

impl<'a> DnsQuery<'a> {
    pub fn recursion_desired(&self) -> bool {
        (self.flags & FLAG_RD) != 0
    }

    pub fn name(&self) -> Result<String, PacketError> {
        qname_to_string(self.qname)
    }
}

/// Decode a wire-format QNAME into dotted form (no trailing dot).
pub fn qname_to_string(qname: &[u8]) -> Result<String, PacketError> {
    // RFC 1035: names are limited to 255 bytes on the wire.
    if qname.len() > 255 {
        return Err(PacketError::Malformed("DNS QNAME too long"));
    }

    let mut out = String::with_capacity(qname.len());
    let mut off = 0usize;
    while off < qname.len() {
        let len = qname[off] as usize;
        off += 1;
        if len == 0 {
            return Ok(out);
        }
        if len > 63 {
            return Err(PacketError::Malformed("DNS label length > 63"));
        }
        ensure_len(qname, off + len)?;
        let label = core::str::from_utf8(&qname[off..off + len])
            .map_err(|_| PacketError::Malformed("DNS label is not UTF-8"))?;
        if !out.is_empty() {
            out.push('.');
        }
        out.push_str(label);
        off += len;
    }

    Err(PacketError::Malformed("DNS QNAME missing terminator"))
}

/// Parse a standard query (QR=0, OPCODE=QUERY) carrying exactly one question.
///
/// Answer/authority/additional sections (e.g. an EDNS OPT record) are ignored.
pub fn parse_single_query(packet: &[u8]) -> Result<DnsQuery<'_>, PacketError> {
    ensure_len(packet, DNS_HEADER_LEN)?;
    let id = u16::from_be_bytes([packet[0], packet[1]]);
    let flags = u16::from_be_bytes([packet[2], packet[3]]);
    if (flags & FLAG_QR) != 0 {
        return Err(PacketError::Malformed("DNS packet is not a query"));
    }
    if (flags & OPCODE_MASK) != 0 {
        return Err(PacketError::Unsupported("DNS opcode other than QUERY"));
    }
    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
    if qdcount != 1 {
        return Err(PacketError::Unsupported("DNS queries with qdcount != 1"));
    }

    let mut off = DNS_HEADER_LEN;
    loop {
        ensure_len(packet, off + 1)?;
        let len_byte = packet[off];
        off += 1;
        if (len_byte & 0xc0) == 0xc0 {
            return Err(PacketError::Unsupported("compressed DNS QNAME"));
        }
        if (len_byte & 0xc0) != 0 {
            return Err(PacketError::Malformed(
                "DNS label length has reserved bits set",
            ));
        }
        if len_byte == 0 {
            break;
        }
        off += len_byte as usize;
        if off - DNS_HEADER_LEN > 255 {
            return Err(PacketError::Malformed("DNS QNAME too long"));
        }
    }
    ensure_len(packet, off + 4)?;
    let qname = &packet[DNS_HEADER_LEN..off];
    if qname.len() > 255 {
        return Err(PacketError::Malformed("DNS QNAME too long"));
    }
    let qtype = u16::from_be_bytes([packet[off], packet[off + 1]]);
    let qclass = u16::from_be_bytes([packet[off + 2], packet[off + 3]]);
    Ok(DnsQuery {
        id,
        flags,
        qname,
        qtype,
        qclass,
    })
}

/// Encoder for a NOERROR response to a [`DnsQuery`]: the question is echoed, followed by at most
/// one A record whose owner name points back at the question. Without an address the response
/// is NODATA.
pub struct DnsAnswerBuilder<'a> {
    pub query: &'a DnsQuery<'a>,
    pub answer_a: Option<Ipv4Addr>,
    pub ttl: u32,
}

impl<'a> DnsAnswerBuilder<'a> {
    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        let mut len = DNS_HEADER_LEN + self.query.qname.len() + 4;
        if self.answer_a.is_some() {
            // name ptr 2 + type 2 + class 2 + ttl 4 + rdlen 2 + rdata 4
            len += 16;
        }
        len
    }

    pub fn write(&self, out: &mut [u8]) -> Result<usize, PacketError> {
        let len = self.encoded_len();
        ensure_out_buf_len(out, len)?;
        let q = self.query;

        out[0..2].copy_from_slice(&q.id.to_be_bytes());
        let mut flags = FLAG_QR | FLAG_RA;
        if q.recursion_desired() {
            flags |= FLAG_RD;
        }
        out[2..4].copy_from_slice(&flags.to_be_bytes());
        out[4..6].copy_from_slice(&1u16.to_be_bytes()); // QDCOUNT
        out[6..8].copy_from_slice(&(self.answer_a.is_some() as u16).to_be_bytes()); // ANCOUNT
        out[8..10].copy_from_slice(&0u16.to_be_bytes()); // NSCOUNT
        out[10..12].copy_from_slice(&0u16.to_be_bytes()); // ARCOUNT

        let mut off = DNS_HEADER_LEN;
        out[off..off + q.qname.len()].copy_from_slice(q.qname);
        off += q.qname.len();
        out[off..off + 2].copy_from_slice(&q.qtype.to_be_bytes());
        out[off + 2..off + 4].copy_from_slice(&q.qclass.to_be_bytes());
        off += 4;

        if let Some(addr) = self.answer_a {
            out[off..off + 2].copy_from_slice(&0xc00cu16.to_be_bytes()); // -> offset 12
            out[off + 2..off + 4].copy_from_slice(&QTYPE_A.to_be_bytes());
            out[off + 4..off + 6].copy_from_slice(&QCLASS_IN.to_be_bytes());
            out[off + 6..off + 10].copy_from_slice(&self.ttl.to_be_bytes());
            out[off + 10..off + 12].copy_from_slice(&4u16.to_be_bytes());
            out[off + 12..off + 16].copy_from_slice(&addr.octets());
            off += 16;
        }

        debug_assert_eq!(off, len);
        Ok(len)
    }
}

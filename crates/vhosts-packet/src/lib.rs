//! IPv4/UDP/DNS wire formats used by the vhosts relay.
//!
//! Everything here works over caller-owned byte buffers: parsing borrows, mutation happens in
//! place, and nothing allocates on the per-packet path. Socket and interface I/O live in
//! `vhosts-relay`.
#![forbid(unsafe_code)]

pub mod checksum;
pub mod dns;
pub mod ipv4;
pub mod udp;

pub use dns::{parse_single_query, qname_to_string, DnsAnswerBuilder, DnsQuery};
pub use ipv4::{Ipv4Packet, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP, IPV4_MIN_HEADER_LEN};
pub use udp::{UdpFrameBuilder, UdpPacket, UDP_HEADER_LEN};

/// Decode/encode failure for a single frame.
///
/// Callers on the packet path treat every variant the same way: drop the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("truncated packet: needed {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    #[error("unsupported packet: {0}")]
    Unsupported(&'static str),

    #[error("output buffer too small: needed {needed} bytes, got {actual}")]
    BufferTooSmall { needed: usize, actual: usize },
}

pub(crate) fn ensure_len(data: &[u8], needed: usize) -> Result<(), PacketError> {
    if data.len() < needed {
        return Err(PacketError::Truncated {
            needed,
            actual: data.len(),
        });
    }
    Ok(())
}

pub(crate) fn ensure_out_buf_len(out: &[u8], needed: usize) -> Result<(), PacketError> {
    if out.len() < needed {
        return Err(PacketError::BufferTooSmall {
            needed,
            actual: out.len(),
        });
    }
    Ok(())
}

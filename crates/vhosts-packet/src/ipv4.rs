use core::net::Ipv4Addr;

use super::{checksum, ensure_len, PacketError};
use crate::udp::UdpPacket;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

pub const IPV4_MIN_HEADER_LEN: usize = 20;

const FLAG_MORE_FRAGMENTS: u16 = 0x2000;
const FRAGMENT_OFFSET_MASK: u16 = 0x1fff;

/// An IPv4 datagram view over an owned buffer.
///
/// The buffer always starts at the IP header. It may be larger than the datagram (pooled buffers
/// are MTU-sized); only the first `total_len()` bytes belong to the packet.
#[derive(Debug, Clone)]
pub struct Ipv4Packet<B> {
    buf: B,
    header_len: usize,
    total_len: usize,
}

impl<B: AsRef<[u8]>> Ipv4Packet<B> {
    /// Validate the IPv4 header of the first `frame_len` bytes of `buf`.
    ///
    /// Bytes past the IP total length (link padding) are ignored.
    pub fn parse(buf: B, frame_len: usize) -> Result<Self, PacketError> {
        let data = buf.as_ref();
        if frame_len > data.len() {
            return Err(PacketError::Malformed("frame length exceeds buffer"));
        }
        let data = &data[..frame_len];
        ensure_len(data, IPV4_MIN_HEADER_LEN)?;
        let version = data[0] >> 4;
        if version != 4 {
            return Err(PacketError::Unsupported("non-IPv4 frame"));
        }
        let header_len = ((data[0] & 0x0f) as usize) * 4;
        if header_len < IPV4_MIN_HEADER_LEN {
            return Err(PacketError::Malformed("IPv4 IHL < 5"));
        }
        ensure_len(data, header_len)?;
        let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if total_len < header_len {
            return Err(PacketError::Malformed("IPv4 total length < header length"));
        }
        ensure_len(data, total_len)?;
        Ok(Self {
            buf,
            header_len,
            total_len,
        })
    }

    pub(crate) fn from_parts(buf: B, header_len: usize, total_len: usize) -> Self {
        Self {
            buf,
            header_len,
            total_len,
        }
    }

    pub fn version(&self) -> u8 {
        self.buf.as_ref()[0] >> 4
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }

    pub fn identification(&self) -> u16 {
        let b = self.buf.as_ref();
        u16::from_be_bytes([b[4], b[5]])
    }

    pub fn flags_fragment(&self) -> u16 {
        let b = self.buf.as_ref();
        u16::from_be_bytes([b[6], b[7]])
    }

    pub fn is_fragment(&self) -> bool {
        let ff = self.flags_fragment();
        (ff & FLAG_MORE_FRAGMENTS) != 0 || (ff & FRAGMENT_OFFSET_MASK) != 0
    }

    pub fn ttl(&self) -> u8 {
        self.buf.as_ref()[8]
    }

    pub fn protocol(&self) -> u8 {
        self.buf.as_ref()[9]
    }

    pub fn header_checksum(&self) -> u16 {
        let b = self.buf.as_ref();
        u16::from_be_bytes([b[10], b[11]])
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        let b = self.buf.as_ref();
        Ipv4Addr::new(b[12], b[13], b[14], b[15])
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        let b = self.buf.as_ref();
        Ipv4Addr::new(b[16], b[17], b[18], b[19])
    }

    pub fn is_udp(&self) -> bool {
        self.protocol() == IPPROTO_UDP
    }

    pub fn is_tcp(&self) -> bool {
        self.protocol() == IPPROTO_TCP
    }

    pub fn header_checksum_valid(&self) -> bool {
        checksum::ipv4_header_checksum(&self.buf.as_ref()[..self.header_len]) == 0
    }

    /// The datagram bytes (header + payload), excluding any trailing buffer space.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf.as_ref()[..self.total_len]
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf.as_ref()[self.header_len..self.total_len]
    }

    pub fn into_inner(self) -> B {
        self.buf
    }

    /// Narrow to a UDP view. Fails (consuming the buffer) for other protocols, fragments and
    /// malformed UDP headers.
    pub fn into_udp(self) -> Result<UdpPacket<B>, PacketError> {
        if !self.is_udp() {
            return Err(PacketError::Unsupported("not a UDP datagram"));
        }
        if self.is_fragment() {
            return Err(PacketError::Unsupported("fragmented IPv4 datagram"));
        }
        UdpPacket::from_ipv4(self)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Ipv4Packet<B> {
    pub(crate) fn buf_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    pub(crate) fn set_total_len(&mut self, total_len: usize) {
        self.total_len = total_len;
        self.buf.as_mut()[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    }

    /// Recompute the header checksum after a field change.
    pub fn fill_header_checksum(&mut self) {
        let header_len = self.header_len;
        let b = self.buf.as_mut();
        b[10..12].copy_from_slice(&[0, 0]);
        let csum = checksum::ipv4_header_checksum(&b[..header_len]);
        b[10..12].copy_from_slice(&csum.to_be_bytes());
    }

    /// Exchange source and destination addresses in place.
    ///
    /// The ones' complement sum is order independent, so the stored header checksum stays valid.
    pub fn swap_addrs(&mut self) {
        let b = self.buf.as_mut();
        for i in 0..4 {
            b.swap(12 + i, 16 + i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::udp::UdpFrameBuilder;

    fn frame() -> Vec<u8> {
        UdpFrameBuilder {
            src_addr: Ipv4Addr::new(10, 0, 0, 2),
            dst_addr: Ipv4Addr::new(8, 8, 8, 8),
            src_port: 40000,
            dst_port: 53,
            identification: 7,
            ttl: 64,
            payload: b"abc",
        }
        .build_vec()
        .unwrap()
    }

    #[test]
    fn parse_reads_header_fields() {
        let bytes = frame();
        let len = bytes.len();
        let pkt = Ipv4Packet::parse(bytes, len).unwrap();
        assert_eq!(pkt.version(), 4);
        assert_eq!(pkt.header_len(), 20);
        assert_eq!(pkt.total_len(), 31);
        assert_eq!(pkt.src_addr(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(pkt.dst_addr(), Ipv4Addr::new(8, 8, 8, 8));
        assert!(pkt.is_udp());
        assert!(!pkt.is_tcp());
        assert!(pkt.header_checksum_valid());
    }

    #[test]
    fn trailing_buffer_space_is_not_part_of_the_packet() {
        let mut bytes = frame();
        let len = bytes.len();
        bytes.resize(1500, 0xee);
        let pkt = Ipv4Packet::parse(bytes, len).unwrap();
        assert_eq!(pkt.as_bytes().len(), len);
    }

    #[test]
    fn rejects_truncated_and_non_ipv4() {
        let bytes = frame();
        assert!(matches!(
            Ipv4Packet::parse(&bytes[..], 10),
            Err(PacketError::Truncated { .. })
        ));
        // Claimed total length longer than what was read.
        assert!(matches!(
            Ipv4Packet::parse(&bytes[..], 25),
            Err(PacketError::Truncated { .. })
        ));

        let mut v6 = bytes.clone();
        v6[0] = 0x60;
        assert_eq!(
            Ipv4Packet::parse(&v6[..], v6.len()).unwrap_err(),
            PacketError::Unsupported("non-IPv4 frame")
        );

        let mut bad_ihl = bytes.clone();
        bad_ihl[0] = 0x44;
        assert_eq!(
            Ipv4Packet::parse(&bad_ihl[..], bad_ihl.len()).unwrap_err(),
            PacketError::Malformed("IPv4 IHL < 5")
        );
    }

    #[test]
    fn fragments_are_not_narrowed_to_udp() {
        let mut bytes = frame();
        bytes[6] = 0x20; // MF
        let len = bytes.len();
        let pkt = Ipv4Packet::parse(bytes, len).unwrap();
        assert_eq!(
            pkt.into_udp().unwrap_err(),
            PacketError::Unsupported("fragmented IPv4 datagram")
        );
    }

    #[test]
    fn swap_addrs_keeps_header_checksum_valid() {
        let bytes = frame();
        let len = bytes.len();
        let mut pkt = Ipv4Packet::parse(bytes, len).unwrap();
        pkt.swap_addrs();
        assert_eq!(pkt.src_addr(), Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(pkt.dst_addr(), Ipv4Addr::new(10, 0, 0, 2));
        assert!(pkt.header_checksum_valid());
    }
}

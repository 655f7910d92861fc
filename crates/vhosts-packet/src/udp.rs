use core::net::Ipv4Addr;

use super::{checksum, ensure_len, ensure_out_buf_len, PacketError};
use crate::ipv4::{Ipv4Packet, IPPROTO_UDP, IPV4_MIN_HEADER_LEN};

pub const UDP_HEADER_LEN: usize = 8;

/// An IPv4 + UDP datagram view over an owned buffer, mutable in place.
///
/// All rewriting keeps the payload at a fixed offset (`payload_offset()`); only lengths and
/// checksums change. This lets a relay read a socket datagram straight into the payload slot of a
/// pooled buffer and then stamp a header in front of it.
#[derive(Debug, Clone)]
pub struct UdpPacket<B> {
    ip: Ipv4Packet<B>,
    udp_len: usize,
}

impl<B: AsRef<[u8]>> UdpPacket<B> {
    pub(crate) fn from_ipv4(ip: Ipv4Packet<B>) -> Result<Self, PacketError> {
        let segment = ip.payload();
        ensure_len(segment, UDP_HEADER_LEN)?;
        let udp_len = u16::from_be_bytes([segment[4], segment[5]]) as usize;
        if udp_len < UDP_HEADER_LEN {
            return Err(PacketError::Malformed("UDP length < header length"));
        }
        ensure_len(segment, udp_len)?;
        Ok(Self { ip, udp_len })
    }

    /// Parse an IPv4 frame and narrow it to UDP in one step.
    pub fn parse(buf: B, frame_len: usize) -> Result<Self, PacketError> {
        Ipv4Packet::parse(buf, frame_len)?.into_udp()
    }

    pub fn ip(&self) -> &Ipv4Packet<B> {
        &self.ip
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        self.ip.src_addr()
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        self.ip.dst_addr()
    }

    fn udp_header(&self) -> &[u8] {
        let off = self.ip.header_len();
        &self.ip.as_bytes()[off..off + UDP_HEADER_LEN]
    }

    pub fn src_port(&self) -> u16 {
        let h = self.udp_header();
        u16::from_be_bytes([h[0], h[1]])
    }

    pub fn dst_port(&self) -> u16 {
        let h = self.udp_header();
        u16::from_be_bytes([h[2], h[3]])
    }

    pub fn udp_len(&self) -> usize {
        self.udp_len
    }

    pub fn checksum(&self) -> u16 {
        let h = self.udp_header();
        u16::from_be_bytes([h[6], h[7]])
    }

    pub fn payload_offset(&self) -> usize {
        self.ip.header_len() + UDP_HEADER_LEN
    }

    pub fn payload_len(&self) -> usize {
        self.udp_len - UDP_HEADER_LEN
    }

    pub fn payload(&self) -> &[u8] {
        let off = self.payload_offset();
        &self.ip.as_bytes()[off..off + self.payload_len()]
    }

    /// Header bytes (IP header including options, plus the UDP header).
    pub fn header_bytes(&self) -> &[u8] {
        &self.ip.as_bytes()[..self.payload_offset()]
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.ip.as_bytes()
    }

    /// True if the UDP checksum is absent (0) or verifies against the pseudo-header.
    pub fn checksum_valid(&self) -> bool {
        if self.checksum() == 0 {
            return true;
        }
        let off = self.ip.header_len();
        let segment = &self.ip.as_bytes()[off..off + self.udp_len];
        checksum::transport_checksum_ipv4(self.src_addr(), self.dst_addr(), IPPROTO_UDP, segment)
            == 0
    }

    pub fn into_inner(self) -> B {
        self.ip.into_inner()
    }

    /// Rebuild the encoder input for this datagram. Emitting it reproduces `as_bytes()` for
    /// option-less headers with DF set, which is what [`UdpFrameBuilder`] emits.
    pub fn to_builder(&self) -> UdpFrameBuilder<'_> {
        UdpFrameBuilder {
            src_addr: self.src_addr(),
            dst_addr: self.dst_addr(),
            src_port: self.src_port(),
            dst_port: self.dst_port(),
            identification: self.ip.identification(),
            ttl: self.ip.ttl(),
            payload: self.payload(),
        }
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> UdpPacket<B> {
    /// Exchange source/destination addresses and ports in place.
    ///
    /// This is a pure field exchange: both checksums are order independent and remain valid.
    pub fn swap_direction(&mut self) {
        self.ip.swap_addrs();
        let off = self.ip.header_len();
        let b = self.ip.buf_mut();
        b.swap(off, off + 2);
        b.swap(off + 1, off + 3);
    }

    /// Replace the payload, updating UDP length, IP total length and both checksums.
    pub fn rewrite_payload(&mut self, payload: &[u8]) -> Result<(), PacketError> {
        let off = self.payload_offset();
        let needed = off + payload.len();
        if needed > u16::MAX as usize {
            return Err(PacketError::Malformed("IPv4 total length > 65535"));
        }
        let buf = self.ip.buf_mut();
        ensure_out_buf_len(buf, needed)?;
        buf[off..needed].copy_from_slice(payload);
        self.set_payload_len(payload.len())
    }

    /// Declare that `len` payload bytes are already in place at `payload_offset()`, and fix up
    /// lengths and checksums accordingly.
    pub fn set_payload_len(&mut self, len: usize) -> Result<(), PacketError> {
        let header_len = self.ip.header_len();
        let udp_len = UDP_HEADER_LEN + len;
        let total_len = header_len + udp_len;
        if total_len > u16::MAX as usize {
            return Err(PacketError::Malformed("IPv4 total length > 65535"));
        }
        let capacity = self.ip.buf_mut().len();
        if total_len > capacity {
            return Err(PacketError::BufferTooSmall {
                needed: total_len,
                actual: capacity,
            });
        }

        self.udp_len = udp_len;
        self.ip.set_total_len(total_len);
        self.ip.fill_header_checksum();

        let (src, dst) = (self.src_addr(), self.dst_addr());
        let b = self.ip.buf_mut();
        b[header_len + 4..header_len + 6].copy_from_slice(&(udp_len as u16).to_be_bytes());
        b[header_len + 6..header_len + 8].copy_from_slice(&[0, 0]);
        let mut csum = checksum::transport_checksum_ipv4(
            src,
            dst,
            IPPROTO_UDP,
            &b[header_len..header_len + udp_len],
        );
        if csum == 0 {
            csum = 0xffff;
        }
        b[header_len + 6..header_len + 8].copy_from_slice(&csum.to_be_bytes());
        Ok(())
    }

    /// Build a datagram in `buf` whose header is copied from `template` and whose payload
    /// (`payload_len` bytes) is already in place at `template.payload_offset()`.
    pub fn from_template<T: AsRef<[u8]>>(
        template: &UdpPacket<T>,
        mut buf: B,
        payload_len: usize,
    ) -> Result<Self, PacketError> {
        let header = template.header_bytes();
        ensure_out_buf_len(buf.as_ref(), header.len() + payload_len)?;
        buf.as_mut()[..header.len()].copy_from_slice(header);
        let header_len = template.ip().header_len();
        let mut pkt = Self {
            ip: Ipv4Packet::from_parts(buf, header_len, header.len()),
            udp_len: UDP_HEADER_LEN,
        };
        pkt.set_payload_len(payload_len)?;
        Ok(pkt)
    }
}

/// Encoder for an option-less IPv4 header (DF set) followed by a UDP header and payload.
#[derive(Debug, Clone, Copy)]
pub struct UdpFrameBuilder<'a> {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub identification: u16,
    pub ttl: u8,
    pub payload: &'a [u8],
}

impl<'a> UdpFrameBuilder<'a> {
    pub fn len(&self) -> Result<usize, PacketError> {
        let len = IPV4_MIN_HEADER_LEN + UDP_HEADER_LEN + self.payload.len();
        if len > u16::MAX as usize {
            return Err(PacketError::Malformed("IPv4 total length > 65535"));
        }
        Ok(len)
    }

    pub fn write(&self, out: &mut [u8]) -> Result<usize, PacketError> {
        let len = self.len()?;
        ensure_out_buf_len(out, len)?;
        let udp_len = len - IPV4_MIN_HEADER_LEN;

        out[0] = (4u8 << 4) | 5; // version + IHL
        out[1] = 0; // DSCP/ECN
        out[2..4].copy_from_slice(&(len as u16).to_be_bytes());
        out[4..6].copy_from_slice(&self.identification.to_be_bytes());
        out[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // DF
        out[8] = self.ttl;
        out[9] = IPPROTO_UDP;
        out[10..12].copy_from_slice(&0u16.to_be_bytes());
        out[12..16].copy_from_slice(&self.src_addr.octets());
        out[16..20].copy_from_slice(&self.dst_addr.octets());
        let ip_csum = checksum::ipv4_header_checksum(&out[..IPV4_MIN_HEADER_LEN]);
        out[10..12].copy_from_slice(&ip_csum.to_be_bytes());

        let udp = &mut out[IPV4_MIN_HEADER_LEN..len];
        udp[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        udp[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
        udp[6..8].copy_from_slice(&0u16.to_be_bytes());
        udp[8..].copy_from_slice(self.payload);
        let mut csum =
            checksum::transport_checksum_ipv4(self.src_addr, self.dst_addr, IPPROTO_UDP, udp);
        if csum == 0 {
            csum = 0xffff;
        }
        udp[6..8].copy_from_slice(&csum.to_be_bytes());
        Ok(len)
    }

    pub fn build_vec(&self) -> Result<Vec<u8>, PacketError> {
        let mut buf = vec![0u8; self.len()?];
        let written = self.write(&mut buf)?;
        debug_assert_eq!(written, buf.len());
        Ok(buf)
    }
}

//! RFC 1071 Internet checksum helpers.

use core::net::Ipv4Addr;

fn sum_u16_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let Some(&last) = chunks.remainder().first() {
        sum += (last as u32) << 8;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Ones' complement checksum over `data`.
pub fn internet_checksum(data: &[u8]) -> u16 {
    fold(sum_u16_words(data, 0))
}

/// IPv4 header checksum. The checksum field (bytes 10..12) must be zeroed by the caller, or the
/// result is 0 for a header whose stored checksum is already correct.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    internet_checksum(header)
}

/// TCP/UDP checksum including the IPv4 pseudo-header.
///
/// `segment` is the full transport header plus payload with its checksum field zeroed (or intact,
/// for verification, in which case a valid segment yields 0).
pub fn transport_checksum_ipv4(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let mut sum = 0u32;
    sum = sum_u16_words(&src.octets(), sum);
    sum = sum_u16_words(&dst.octets(), sum);
    sum += protocol as u32;
    sum += segment.len() as u32;
    sum = sum_u16_words(segment, sum);
    fold(sum)
}

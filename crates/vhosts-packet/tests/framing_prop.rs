use core::net::Ipv4Addr;

use proptest::prelude::*;
use vhosts_packet::{Ipv4Packet, UdpFrameBuilder, UdpPacket};

fn addrs() -> impl Strategy<Value = Ipv4Addr> {
    any::<u32>().prop_map(Ipv4Addr::from)
}

proptest! {
    #[test]
    fn parse_then_encode_reproduces_bytes(
        src_addr in addrs(),
        dst_addr in addrs(),
        src_port in any::<u16>(),
        dst_port in any::<u16>(),
        identification in any::<u16>(),
        ttl in any::<u8>(),
        payload in proptest::collection::vec(any::<u8>(), 0..1472),
    ) {
        let bytes = UdpFrameBuilder {
            src_addr,
            dst_addr,
            src_port,
            dst_port,
            identification,
            ttl,
            payload: &payload,
        }
        .build_vec()
        .unwrap();

        let pkt = UdpPacket::parse(&bytes[..], bytes.len()).unwrap();
        prop_assert_eq!(pkt.payload(), &payload[..]);
        prop_assert!(pkt.checksum_valid());
        prop_assert!(pkt.ip().header_checksum_valid());

        let reencoded = pkt.to_builder().build_vec().unwrap();
        prop_assert_eq!(reencoded, bytes);
    }

    #[test]
    fn swap_direction_twice_is_identity(
        src_addr in addrs(),
        dst_addr in addrs(),
        src_port in any::<u16>(),
        dst_port in any::<u16>(),
        payload in proptest::collection::vec(any::<u8>(), 0..256),
    ) {
        let bytes = UdpFrameBuilder {
            src_addr,
            dst_addr,
            src_port,
            dst_port,
            identification: 1,
            ttl: 64,
            payload: &payload,
        }
        .build_vec()
        .unwrap();

        let len = bytes.len();
        let mut pkt = UdpPacket::parse(bytes.clone(), len).unwrap();
        pkt.swap_direction();
        prop_assert_eq!(pkt.src_addr(), dst_addr);
        prop_assert_eq!(pkt.dst_port(), src_port);
        prop_assert!(pkt.checksum_valid());
        pkt.swap_direction();
        prop_assert_eq!(pkt.into_inner(), bytes);
    }

    #[test]
    fn arbitrary_bytes_never_panic(data in proptest::collection::vec(any::<u8>(), 0..128)) {
        let len = data.len();
        if let Ok(ip) = Ipv4Packet::parse(&data[..], len) {
            prop_assert!(ip.total_len() <= len);
            if let Ok(udp) = ip.into_udp() {
                prop_assert!(udp.payload_offset() + udp.payload_len() <= len);
            }
        }
    }
}

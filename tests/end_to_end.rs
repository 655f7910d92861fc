//! Whole-engine scenarios over an in-memory interface and real loopback sockets.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use vhosts_packet::{UdpFrameBuilder, UdpPacket};
use vhosts_relay::{
    Engine, EngineConfig, HostsTable, MemoryInterface, SocketProtector, State, StatsSnapshot,
    VirtualInterface,
};

const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const RESOLVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Protector that allows every socket and counts the calls.
#[derive(Default)]
struct CountingProtector(AtomicUsize);

impl CountingProtector {
    fn calls(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl SocketProtector for CountingProtector {
    fn protect(&self, _socket: &socket2::Socket) -> bool {
        self.0.fetch_add(1, Ordering::SeqCst);
        true
    }
}

struct Setup {
    engine: Engine,
    iface: Arc<MemoryInterface>,
    protector: Arc<CountingProtector>,
}

fn start(config: EngineConfig, hosts: HostsTable) -> Setup {
    init_tracing();
    let iface = Arc::new(MemoryInterface::new());
    let protector = Arc::new(CountingProtector::default());
    let engine = Engine::start(config, hosts, iface.clone(), protector.clone()).unwrap();
    assert!(engine.is_running());
    Setup {
        engine,
        iface,
        protector,
    }
}

/// Shut down and check that every pooled buffer came back.
fn finish(engine: Engine) -> StatsSnapshot {
    let lifecycle = engine.lifecycle().clone();
    let pool = engine.pool().clone();
    let stats = engine.shutdown();
    assert_eq!(lifecycle.state(), State::Stopped);
    let pool = pool.stats();
    assert_eq!(pool.outstanding(), 0, "pooled buffers leaked: {pool:?}");
    stats
}

fn v4(addr: SocketAddr) -> SocketAddrV4 {
    match addr {
        SocketAddr::V4(addr) => addr,
        other => panic!("unexpected address {other}"),
    }
}

fn echo_server() -> SocketAddrV4 {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    let addr = v4(socket.local_addr().unwrap());
    std::thread::spawn(move || {
        let mut buf = [0u8; 2048];
        while let Ok((n, peer)) = socket.recv_from(&mut buf) {
            let _ = socket.send_to(&buf[..n], peer);
        }
    });
    addr
}

/// Counts datagrams and never answers.
fn sink_server() -> (SocketAddrV4, Arc<AtomicUsize>) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    let addr = v4(socket.local_addr().unwrap());
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    std::thread::spawn(move || {
        let mut buf = [0u8; 2048];
        while socket.recv_from(&mut buf).is_ok() {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    (addr, received)
}

fn udp_frame(src_port: u16, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    UdpFrameBuilder {
        src_addr: CLIENT,
        dst_addr: *dst.ip(),
        src_port,
        dst_port: dst.port(),
        identification: 0x1234,
        ttl: 64,
        payload,
    }
    .build_vec()
    .unwrap()
}

fn dns_query(id: u16, name: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    out.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    out.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    for label in name.split('.') {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out.extend_from_slice(&1u16.to_be_bytes()); // A
    out.extend_from_slice(&1u16.to_be_bytes()); // IN
    out
}

fn blocklist() -> HostsTable {
    [("blocked.example.com", Ipv4Addr::UNSPECIFIED)]
        .into_iter()
        .collect()
}

#[test]
fn blocked_name_is_answered_without_relaying() {
    let s = start(EngineConfig::default(), blocklist());

    let query = dns_query(0x4242, "blocked.example.com");
    let frame = udp_frame(40000, SocketAddrV4::new(RESOLVER, 53), &query);
    s.iface.inject(frame);

    let written = s.iface.next_written(WAIT).expect("DNS answer");
    let answer = UdpPacket::parse(&written[..], written.len()).unwrap();
    assert_eq!(answer.src_addr(), RESOLVER);
    assert_eq!(answer.src_port(), 53);
    assert_eq!(answer.dst_addr(), CLIENT);
    assert_eq!(answer.dst_port(), 40000);
    assert!(answer.ip().header_checksum_valid());
    assert!(answer.checksum_valid());

    let msg = answer.payload();
    assert_eq!(&msg[0..2], &0x4242u16.to_be_bytes());
    assert_eq!(msg[2] & 0x80, 0x80, "QR bit");
    assert_eq!(&msg[6..8], &1u16.to_be_bytes(), "ANCOUNT");
    assert_eq!(&msg[msg.len() - 4..], &[0, 0, 0, 0]);

    assert_eq!(s.protector.calls(), 0);
    let stats = finish(s.engine);
    assert_eq!(stats.dns_answered, 1);
    assert_eq!(stats.sessions_created, 0);
}

#[test]
fn udp_flow_is_relayed_and_reply_is_addressed_back() {
    let echo = echo_server();
    let s = start(EngineConfig::default(), blocklist());

    s.iface.inject(udp_frame(41000, echo, b"hello over the relay"));

    let written = s.iface.next_written(WAIT).expect("relayed reply");
    let reply = UdpPacket::parse(&written[..], written.len()).unwrap();
    assert_eq!(reply.src_addr(), *echo.ip());
    assert_eq!(reply.src_port(), echo.port());
    assert_eq!(reply.dst_addr(), CLIENT);
    assert_eq!(reply.dst_port(), 41000);
    assert_eq!(reply.payload(), b"hello over the relay");
    assert!(reply.ip().header_checksum_valid());
    assert!(reply.checksum_valid());

    assert_eq!(s.protector.calls(), 1);
    let stats = finish(s.engine);
    assert_eq!(stats.sessions_created, 1);
    assert_eq!(stats.sessions_closed, 1);
    assert_eq!(stats.packets_in, 1);
}

#[test]
fn unmapped_dns_query_goes_upstream() {
    let upstream = echo_server();
    let config = EngineConfig {
        dns_port: upstream.port(),
        ..Default::default()
    };
    let s = start(config, blocklist());

    let query = dns_query(7, "example.org");
    s.iface.inject(udp_frame(40001, upstream, &query));

    let written = s.iface.next_written(WAIT).expect("upstream reply");
    let reply = UdpPacket::parse(&written[..], written.len()).unwrap();
    assert_eq!(reply.payload(), &query[..]);
    assert_eq!(s.protector.calls(), 1);

    let stats = finish(s.engine);
    assert_eq!(stats.dns_answered, 0);
    assert_eq!(stats.sessions_created, 1);
}

#[test]
fn session_cap_evicts_exactly_one_flow() {
    let (sink, received) = sink_server();
    let config = EngineConfig {
        max_sessions: 50,
        ..Default::default()
    };
    let s = start(config, HostsTable::new());

    for n in 0..51u16 {
        s.iface.inject(udp_frame(20000 + n, sink, &n.to_be_bytes()));
    }
    wait_until("51 datagrams relayed", || s.engine.stats().packets_out == 51);
    wait_until("51 datagrams delivered", || {
        received.load(Ordering::SeqCst) == 51
    });

    let snap = s.engine.stats();
    assert_eq!(snap.sessions_created, 51);
    assert_eq!(snap.sessions_evicted, 1);
    assert_eq!(snap.sessions_closed, 1);
    assert_eq!(snap.sessions_active(), 50);
    assert_eq!(s.protector.calls(), 51);

    let stats = finish(s.engine);
    assert_eq!(stats.sessions_closed, 51);
    assert_eq!(stats.sessions_evicted, 1);
}

#[test]
fn failed_session_is_replaced_not_reused() {
    // Nothing listens here, so the kernel refuses the flow and the pending error surfaces on the
    // session's next send.
    let closed = v4(UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap());
    let s = start(EngineConfig::default(), HostsTable::new());

    let mut probes = 0u64;
    while s.engine.stats().socket_errors == 0 {
        assert!(probes < 50, "refusal never reported");
        probes += 1;
        s.iface.inject(udp_frame(42000, closed, b"probe"));
        wait_until("probe handled", || {
            let snap = s.engine.stats();
            snap.packets_out + snap.socket_errors == probes
        });
        std::thread::sleep(Duration::from_millis(20));
    }
    let snap = s.engine.stats();
    assert_eq!(snap.sessions_created, 1);
    assert_eq!(snap.sessions_closed, 1);
    assert_eq!(snap.sessions_active(), 0);
    assert_eq!(s.protector.calls(), 1);

    s.iface.inject(udp_frame(42000, closed, b"after"));
    wait_until("replacement session", || {
        s.engine.stats().sessions_created == 2
    });
    assert_eq!(s.protector.calls(), 2);

    finish(s.engine);
}

#[test]
fn junk_frames_are_dropped_and_processing_continues() {
    let s = start(EngineConfig::default(), blocklist());
    let resolver = SocketAddrV4::new(RESOLVER, 53);

    s.iface.inject(vec![0xffu8; 10]);
    s.iface.inject(Vec::new());

    let mut tcp = udp_frame(43000, resolver, b"not really tcp");
    tcp[9] = 6;
    s.iface.inject(tcp);

    let mut icmp = udp_frame(43000, resolver, b"ping");
    icmp[9] = 1;
    s.iface.inject(icmp);

    let mut truncated = udp_frame(43000, resolver, b"short");
    truncated.truncate(24);
    s.iface.inject(truncated);

    let query = dns_query(9, "blocked.example.com");
    s.iface.inject(udp_frame(43001, resolver, &query));

    let written = s.iface.next_written(WAIT).expect("answer after junk");
    let answer = UdpPacket::parse(&written[..], written.len()).unwrap();
    assert_eq!(answer.dst_port(), 43001);
    assert_eq!(s.iface.written_len(), 0);

    let stats = finish(s.engine);
    assert_eq!(stats.frames_dropped, 4);
    assert_eq!(stats.dns_answered, 1);
    assert_eq!(stats.sessions_created, 0);
}

#[test]
fn interface_close_stops_the_whole_engine() {
    let s = start(EngineConfig::default(), HostsTable::new());
    let mut state = s.engine.lifecycle().subscribe();

    s.iface.close();
    wait_until("engine stopped", || {
        *state.borrow_and_update() == State::Stopped
    });
    assert!(!s.engine.is_running());

    finish(s.engine);
}

//! UDP NAT relay loop.
//!
//! One OS thread drives a current-thread tokio runtime. The loop alone owns the session cache
//! and every relay socket; the dispatcher hands it packets over an unbounded channel whose send
//! also wakes the loop. Socket readiness is multiplexed by polling each session socket from a
//! single future, so closing a session is a plain synchronous drop.

use std::future::poll_fn;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::task::{Context, Poll};

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::io::ReadBuf;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use vhosts_packet::UdpPacket;

use crate::config::EngineConfig;
use crate::error::{RelayError, Result};
use crate::interface::InterfaceWriter;
use crate::lifecycle::{Lifecycle, State};
use crate::pool::{BufferPool, PooledBuf};
use crate::protect::SocketProtector;
use crate::session::{CloseReason, SessionCache, SessionCloser, SessionKey};
use crate::stats::RelayStats;

/// A parsed IPv4/UDP datagram living in a pooled buffer.
pub type Packet = UdpPacket<PooledBuf>;

/// Sending side of the relay's outbound queue. Cheap to clone.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<Packet>,
}

impl RelayHandle {
    /// Queue an outbound datagram and wake the relay loop.
    ///
    /// Ownership moves to the relay. If the relay is no longer accepting work the packet is handed
    /// back.
    pub fn submit(&self, packet: Packet) -> std::result::Result<(), Packet> {
        self.tx.send(packet).map_err(|mpsc::error::SendError(packet)| packet)
    }
}

struct Session {
    id: u64,
    socket: UdpSocket,
    /// Most recent outbound datagram of the flow, direction already swapped. Replies reuse its
    /// header.
    template: Packet,
}

/// Closes sessions leaving the cache and accounts for them.
struct Reaper<'a> {
    stats: &'a RelayStats,
}

impl SessionCloser<Session> for Reaper<'_> {
    fn close(&mut self, key: SessionKey, session: Session, reason: CloseReason) {
        if reason == CloseReason::Evicted {
            self.stats.session_evicted();
        }
        self.stats.session_closed();
        debug!(session = session.id, flow = %key, ?reason, "closing relay session");
        // Dropping closes the socket and returns the template buffer to the pool.
        drop(session);
    }
}

/// The relay thread's body: a runtime plus the state it drives.
pub struct RelayLoop {
    runtime: tokio::runtime::Runtime,
    core: RelayCore,
}

struct RelayCore {
    rx: mpsc::UnboundedReceiver<Packet>,
    max_outbound_per_cycle: usize,
    sessions: SessionCache<Session>,
    next_session_id: u64,
    /// Receive buffer for whichever session socket turns readable next.
    spare: PooledBuf,
    pool: BufferPool,
    writer: InterfaceWriter,
    protector: Arc<dyn SocketProtector>,
    stats: RelayStats,
    lifecycle: Lifecycle,
}

impl RelayLoop {
    pub fn new(
        config: &EngineConfig,
        pool: BufferPool,
        writer: InterfaceWriter,
        protector: Arc<dyn SocketProtector>,
        stats: RelayStats,
        lifecycle: Lifecycle,
    ) -> Result<(RelayHandle, RelayLoop)> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.max_sessions)
            .ok_or(RelayError::Config("max_sessions must be > 0"))?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .map_err(RelayError::Spawn)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let spare = pool.acquire();
        let core = RelayCore {
            rx,
            max_outbound_per_cycle: config.max_outbound_per_cycle,
            sessions: SessionCache::new(capacity),
            next_session_id: 1,
            spare,
            pool,
            writer,
            protector,
            stats,
            lifecycle,
        };
        Ok((RelayHandle { tx }, RelayLoop { runtime, core }))
    }

    /// Run until the lifecycle leaves `Running`, every [`RelayHandle`] is dropped, or an interface
    /// write fails. Blocks the calling thread.
    pub fn run(self) -> Result<()> {
        let RelayLoop { runtime, mut core } = self;
        let result = runtime.block_on(core.event_loop());
        core.drain();
        result
    }
}

impl RelayCore {
    async fn event_loop(&mut self) -> Result<()> {
        let mut state = self.lifecycle.subscribe();
        info!("relay loop started");
        loop {
            if *state.borrow_and_update() >= State::Draining {
                return Ok(());
            }

            let event = {
                let sessions = &self.sessions;
                let spare = &mut self.spare;
                tokio::select! {
                    biased;
                    changed = state.changed() => Event::StateChanged(changed.is_ok()),
                    (key, res) = poll_fn(|cx| poll_sessions(sessions, spare, cx)) => {
                        Event::Inbound(key, res)
                    }
                    packet = self.rx.recv() => Event::Outbound(packet),
                }
            };

            let budget = match event {
                Event::Outbound(Some(_)) => self.max_outbound_per_cycle - 1,
                _ => self.max_outbound_per_cycle,
            };
            let flow = match event {
                Event::StateChanged(true) => continue,
                Event::StateChanged(false) => return Ok(()),
                Event::Inbound(key, res) => self.handle_inbound(key, res),
                Event::Outbound(None) => return Ok(()),
                Event::Outbound(Some(packet)) => {
                    self.handle_outbound(packet);
                    ControlFlow::Continue(())
                }
            };
            if let ControlFlow::Break(err) = flow {
                return Err(err);
            }
            self.drain_outbound(budget);
        }
    }

    /// Handle up to `budget` queued outbound packets.
    fn drain_outbound(&mut self, budget: usize) {
        for _ in 0..budget {
            match self.rx.try_recv() {
                Ok(packet) => self.handle_outbound(packet),
                Err(_) => break,
            }
        }
    }

    fn handle_outbound(&mut self, mut packet: Packet) {
        let key = SessionKey::outbound(&packet);

        let fresh = if self.sessions.contains(&key) {
            None
        } else {
            match self.open_socket(key) {
                Ok(socket) => Some(socket),
                Err(RelayError::Protect) => {
                    warn!(flow = %key, "socket protection refused; dropping flow");
                    self.stats.protect_failed();
                    return;
                }
                Err(err) => {
                    warn!(flow = %key, error = %err, "failed to open relay socket");
                    self.stats.socket_error();
                    return;
                }
            }
        };

        let sent = match (&fresh, self.sessions.get(&key)) {
            (Some(socket), _) => send_now(socket, packet.payload()),
            (None, Some(session)) => send_now(&session.socket, packet.payload()),
            (None, None) => return,
        };
        match sent {
            Ok(_) => self.stats.packet_out(),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                debug!(flow = %key, "relay socket send buffer full; dropping datagram");
                self.stats.frame_dropped();
            }
            Err(err) => {
                warn!(flow = %key, error = %err, "relay socket send failed; closing session");
                self.stats.socket_error();
                if let Some(session) = self.sessions.remove(&key) {
                    Reaper { stats: &self.stats }.close(key, session, CloseReason::Failed);
                }
                return;
            }
        }

        packet.swap_direction();
        match fresh {
            Some(socket) => {
                let id = self.next_session_id;
                self.next_session_id += 1;
                self.stats.session_created();
                debug!(session = id, flow = %key, "opened relay session");
                let session = Session {
                    id,
                    socket,
                    template: packet,
                };
                self.sessions
                    .put(key, session, &mut Reaper { stats: &self.stats });
            }
            None => {
                if let Some(session) = self.sessions.get(&key) {
                    session.template = packet;
                }
            }
        }
    }

    fn handle_inbound(
        &mut self,
        key: SessionKey,
        res: io::Result<usize>,
    ) -> ControlFlow<RelayError> {
        let len = match res {
            Ok(len) => len,
            Err(err) => {
                warn!(flow = %key, error = %err, "relay socket receive failed; closing session");
                self.stats.socket_error();
                if let Some(session) = self.sessions.remove(&key) {
                    Reaper { stats: &self.stats }.close(key, session, CloseReason::Failed);
                }
                return ControlFlow::Continue(());
            }
        };

        let buf = std::mem::replace(&mut self.spare, self.pool.acquire());
        let Some(session) = self.sessions.get(&key) else {
            return ControlFlow::Continue(());
        };
        let reply = match Packet::from_template(&session.template, buf, len) {
            Ok(reply) => reply,
            Err(err) => {
                debug!(flow = %key, error = %err, "dropping relay reply");
                self.stats.frame_dropped();
                return ControlFlow::Continue(());
            }
        };
        if let Err(err) = self.writer.write(reply.as_bytes()) {
            error!(error = %err, "failed to write relay reply to interface");
            return ControlFlow::Break(err);
        }
        self.stats.packet_in();
        ControlFlow::Continue(())
    }

    fn open_socket(&self, key: SessionKey) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(RelayError::Socket)?;
        if !self.protector.protect(&socket) {
            return Err(RelayError::Protect);
        }
        let dst = SocketAddr::V4(SocketAddrV4::new(key.dst_addr, key.dst_port));
        socket.connect(&dst.into()).map_err(RelayError::Socket)?;
        socket.set_nonblocking(true).map_err(RelayError::Socket)?;
        UdpSocket::from_std(socket.into()).map_err(RelayError::Socket)
    }

    /// Stop accepting work, discard whatever is still queued and close every session.
    fn drain(&mut self) {
        self.lifecycle.advance(State::Draining);
        self.rx.close();
        let mut discarded = 0u64;
        while let Ok(packet) = self.rx.try_recv() {
            drop(packet);
            self.stats.frame_dropped();
            discarded += 1;
        }
        let open = self.sessions.len();
        self.sessions.drain_all(&mut Reaper { stats: &self.stats });
        info!(discarded, sessions = open, "relay loop stopped");
    }
}

enum Event {
    /// `false` when the lifecycle was dropped.
    StateChanged(bool),
    Inbound(SessionKey, io::Result<usize>),
    Outbound(Option<Packet>),
}

/// Send straight to the kernel. Tokio's `try_send` waits for the reactor to report write
/// readiness, which a freshly registered socket does not have yet; the loop never awaits
/// writability, so a non-blocking send either goes out or fails with `WouldBlock`.
fn send_now(socket: &UdpSocket, payload: &[u8]) -> io::Result<usize> {
    SockRef::from(socket).send(payload)
}

/// Receive from the first readable session socket into `spare`, right after the session's
/// template header so the reply can be completed in place.
fn poll_sessions(
    sessions: &SessionCache<Session>,
    spare: &mut PooledBuf,
    cx: &mut Context<'_>,
) -> Poll<(SessionKey, io::Result<usize>)> {
    for (key, session) in sessions.iter() {
        let offset = session.template.payload_offset();
        let mut read = ReadBuf::new(&mut spare[offset..]);
        match session.socket.poll_recv(cx, &mut read) {
            Poll::Ready(Ok(())) => return Poll::Ready((*key, Ok(read.filled().len()))),
            Poll::Ready(Err(err)) => return Poll::Ready((*key, Err(err))),
            Poll::Pending => {}
        }
    }
    Poll::Pending
}

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::error::{RelayError, Result};
use crate::hosts::DnsInterceptor;
use crate::interface::{InterfaceWriter, VirtualInterface};
use crate::lifecycle::{Lifecycle, State};
use crate::pool::{BufferPool, PooledBuf};
use crate::relay::{Packet, RelayHandle};
use crate::stats::RelayStats;

/// Blocking read loop over the virtual interface.
///
/// DNS queries for mapped names are answered on this thread; every other UDP datagram is handed
/// to the relay. Anything that is not IPv4/UDP is dropped.
pub struct Dispatcher {
    pub(crate) iface: Arc<dyn VirtualInterface>,
    pub(crate) writer: InterfaceWriter,
    pub(crate) pool: BufferPool,
    pub(crate) dns: DnsInterceptor,
    pub(crate) dns_port: u16,
    pub(crate) relay: RelayHandle,
    pub(crate) stats: RelayStats,
    pub(crate) lifecycle: Lifecycle,
}

impl Dispatcher {
    /// Run until the interface reports EOF, a read or write on it fails, or the lifecycle leaves
    /// `Running`.
    pub fn run(self) -> Result<()> {
        info!(hosts = self.dns.hosts().len(), "dispatcher started");
        loop {
            if self.stopping() {
                return Ok(());
            }

            let mut buf = self.pool.acquire();
            let len = match self.iface.read_frame(&mut buf) {
                Ok(None) => {
                    info!("virtual interface closed");
                    return Ok(());
                }
                Ok(Some(0)) => continue,
                Ok(Some(len)) => len,
                Err(err) => {
                    error!(error = %err, "virtual interface read failed");
                    return Err(RelayError::Interface(err));
                }
            };

            // A read may have been released by shutdown.
            if self.stopping() {
                return Ok(());
            }

            if let Err(err) = self.dispatch(buf, len) {
                error!(error = %err, "virtual interface write failed");
                return Err(err);
            }
        }
    }

    fn stopping(&self) -> bool {
        self.lifecycle.state() >= State::Draining
    }

    fn dispatch(&self, buf: PooledBuf, len: usize) -> Result<()> {
        let packet = match Packet::parse(buf, len) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(len, error = %err, "dropping frame");
                self.stats.frame_dropped();
                return Ok(());
            }
        };

        let packet = if packet.dst_port() == self.dns_port && self.dns.is_active() {
            match self.dns.answer(packet) {
                Ok(response) => {
                    self.writer.write(response.as_bytes())?;
                    self.stats.dns_answered();
                    return Ok(());
                }
                Err(query) => query,
            }
        } else {
            packet
        };

        if let Err(packet) = self.relay.submit(packet) {
            debug!(dst = %packet.dst_addr(), "relay not accepting packets; dropping");
            self.stats.frame_dropped();
        }
        Ok(())
    }
}

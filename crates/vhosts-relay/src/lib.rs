//! Packet dispatch and UDP NAT relay for a tun-style virtual interface.
//!
//! Frames read from the interface are classified on a dedicated dispatcher thread: DNS queries
//! for names in the [`HostsTable`] are answered in place, other UDP datagrams are relayed through
//! real sockets by a single-threaded relay loop, and everything else is dropped. [`Engine`] ties
//! the two threads to one [`Lifecycle`].

pub mod config;
mod dispatcher;
pub mod engine;
pub mod error;
pub mod hosts;
pub mod interface;
pub mod lifecycle;
pub mod pool;
pub mod protect;
pub mod relay;
pub mod session;
pub mod stats;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{RelayError, Result};
pub use hosts::{DnsInterceptor, HostsError, HostsTable};
pub use interface::{InterfaceWriter, MemoryInterface, VirtualInterface};
pub use lifecycle::{Lifecycle, State};
pub use pool::{BufferPool, PoolStats, PooledBuf};
#[cfg(any(target_os = "android", target_os = "linux"))]
pub use protect::FwMark;
pub use protect::{NoProtection, SocketProtector};
pub use relay::{Packet, RelayHandle, RelayLoop};
pub use session::{CloseReason, SessionCache, SessionCloser, SessionKey};
pub use stats::{RelayStats, StatsSnapshot};

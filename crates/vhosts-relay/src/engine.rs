use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{RelayError, Result};
use crate::hosts::{DnsInterceptor, HostsTable};
use crate::interface::{InterfaceWriter, VirtualInterface};
use crate::lifecycle::{Lifecycle, State};
use crate::pool::BufferPool;
use crate::protect::SocketProtector;
use crate::relay::RelayLoop;
use crate::stats::{RelayStats, StatsSnapshot};

/// Owns the dispatcher and relay threads for one interface activation.
///
/// The two threads share fate: when either exits, for whatever reason, the other is stopped
/// too. The lifecycle reaches [`State::Stopped`] once both have exited and released their
/// sockets and buffers.
pub struct Engine {
    lifecycle: Lifecycle,
    iface: Arc<dyn VirtualInterface>,
    pool: BufferPool,
    stats: RelayStats,
    threads: Vec<JoinHandle<()>>,
}

impl Engine {
    pub fn start(
        config: EngineConfig,
        hosts: HostsTable,
        iface: Arc<dyn VirtualInterface>,
        protector: Arc<dyn SocketProtector>,
    ) -> Result<Self> {
        Self::start_with(config, hosts, iface, protector, Lifecycle::new())
    }

    /// Start on a caller-supplied lifecycle, which must still be `Idle`.
    pub fn start_with(
        config: EngineConfig,
        hosts: HostsTable,
        iface: Arc<dyn VirtualInterface>,
        protector: Arc<dyn SocketProtector>,
        lifecycle: Lifecycle,
    ) -> Result<Self> {
        config.validate()?;
        if lifecycle.state() != State::Idle {
            return Err(RelayError::Stopped);
        }

        let pool = BufferPool::new(config.mtu);
        let stats = RelayStats::new();
        let writer = InterfaceWriter::new(Arc::clone(&iface));

        let (relay, relay_loop) = RelayLoop::new(
            &config,
            pool.clone(),
            writer.clone(),
            protector,
            stats.clone(),
            lifecycle.clone(),
        )?;
        let dispatcher = Dispatcher {
            iface: Arc::clone(&iface),
            writer,
            pool: pool.clone(),
            dns: DnsInterceptor::new(hosts, config.dns_ttl_secs),
            dns_port: config.dns_port,
            relay,
            stats: stats.clone(),
            lifecycle: lifecycle.clone(),
        };

        let mut engine = Engine {
            lifecycle: lifecycle.clone(),
            iface: Arc::clone(&iface),
            pool,
            stats,
            threads: Vec::with_capacity(2),
        };
        let live = Arc::new(AtomicUsize::new(2));
        lifecycle.advance(State::Running);

        let relay_thread = {
            let exit = ThreadExit::new(&live, &lifecycle, &iface);
            std::thread::Builder::new()
                .name("vhosts-relay".to_string())
                .spawn(move || {
                    if let Err(err) = relay_loop.run() {
                        error!(error = %err, "relay loop failed");
                    }
                    exit.finish();
                })
        };
        match relay_thread {
            Ok(handle) => engine.threads.push(handle),
            Err(err) => {
                // Neither thread runs; the unstarted dispatcher still holds a buffer and drops it
                // here.
                drop(dispatcher);
                lifecycle.advance(State::Stopped);
                return Err(RelayError::Spawn(err));
            }
        }

        let dispatcher_thread = {
            let exit = ThreadExit::new(&live, &lifecycle, &iface);
            std::thread::Builder::new()
                .name("vhosts-dispatch".to_string())
                .spawn(move || {
                    // Errors are logged by the dispatcher itself.
                    let _ = dispatcher.run();
                    exit.finish();
                })
        };
        match dispatcher_thread {
            Ok(handle) => engine.threads.push(handle),
            Err(err) => {
                ThreadExit::new(&live, &lifecycle, &iface).finish();
                engine.stop_and_join();
                return Err(RelayError::Spawn(err));
            }
        }

        info!(
            mtu = config.mtu,
            max_sessions = config.max_sessions,
            "engine started"
        );
        Ok(engine)
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The engine's packet buffer pool. Its counters stay readable after shutdown.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Stop both threads and wait for them. On return every relay socket is closed and every
    /// pooled buffer is back in the pool.
    pub fn shutdown(mut self) -> StatsSnapshot {
        self.stop_and_join();
        self.stats.snapshot()
    }

    fn stop_and_join(&mut self) {
        self.lifecycle.advance(State::Draining);
        self.iface.close();
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("engine").to_string();
            if handle.join().is_err() {
                error!(thread = %name, "engine thread panicked");
            }
        }
        // Covers threads that panicked before reporting their exit.
        self.lifecycle.advance(State::Stopped);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            warn!("engine dropped without shutdown; stopping");
            self.stop_and_join();
        }
    }
}

/// Run on each engine thread's way out: stop the sibling, and mark the engine stopped once both
/// threads are gone.
struct ThreadExit {
    live: Arc<AtomicUsize>,
    lifecycle: Lifecycle,
    iface: Arc<dyn VirtualInterface>,
}

impl ThreadExit {
    fn new(
        live: &Arc<AtomicUsize>,
        lifecycle: &Lifecycle,
        iface: &Arc<dyn VirtualInterface>,
    ) -> Self {
        Self {
            live: Arc::clone(live),
            lifecycle: lifecycle.clone(),
            iface: Arc::clone(iface),
        }
    }

    fn finish(self) {
        // Stops the relay loop, and releases a dispatcher blocked in `read_frame`.
        self.lifecycle.advance(State::Draining);
        self.iface.close();
        if self.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.lifecycle.advance(State::Stopped);
        }
    }
}

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Point-in-time copy of [`RelayStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sessions_created: u64,
    pub sessions_closed: u64,
    pub sessions_evicted: u64,
    pub protect_failures: u64,
    pub socket_errors: u64,
    pub packets_out: u64,
    pub packets_in: u64,
    pub dns_answered: u64,
    pub frames_dropped: u64,
}

impl StatsSnapshot {
    pub fn sessions_active(&self) -> u64 {
        self.sessions_created.saturating_sub(self.sessions_closed)
    }
}

#[derive(Clone, Default)]
pub struct RelayStats {
    inner: Arc<StatsInner>,
}

#[derive(Default)]
struct StatsInner {
    // Sessions
    sessions_created: AtomicU64,
    sessions_closed: AtomicU64,
    sessions_evicted: AtomicU64,

    // Per-flow failures
    protect_failures: AtomicU64,
    socket_errors: AtomicU64,

    // Datagrams
    packets_out: AtomicU64,
    packets_in: AtomicU64,
    dns_answered: AtomicU64,
    frames_dropped: AtomicU64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_created(&self) {
        self.inner.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.inner.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_evicted(&self) {
        self.inner.sessions_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protect_failed(&self) {
        self.inner.protect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn socket_error(&self) {
        self.inner.socket_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_out(&self) {
        self.inner.packets_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_in(&self) {
        self.inner.packets_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dns_answered(&self) {
        self.inner.dns_answered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let i = &self.inner;
        StatsSnapshot {
            sessions_created: i.sessions_created.load(Ordering::Relaxed),
            sessions_closed: i.sessions_closed.load(Ordering::Relaxed),
            sessions_evicted: i.sessions_evicted.load(Ordering::Relaxed),
            protect_failures: i.protect_failures.load(Ordering::Relaxed),
            socket_errors: i.socket_errors.load(Ordering::Relaxed),
            packets_out: i.packets_out.load(Ordering::Relaxed),
            packets_in: i.packets_in.load(Ordering::Relaxed),
            dns_answered: i.dns_answered.load(Ordering::Relaxed),
            frames_dropped: i.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

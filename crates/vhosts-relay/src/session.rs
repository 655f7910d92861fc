use std::fmt;
use std::net::Ipv4Addr;
use std::num::NonZeroUsize;

use lru::LruCache;
use vhosts_packet::UdpPacket;

/// One outbound UDP flow as seen from the virtual interface.
///
/// Replies are correlated through the mirrored tuple: the reply's source is `dst_addr:dst_port`
/// and its destination port is `src_port`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub dst_addr: Ipv4Addr,
    pub dst_port: u16,
    pub src_port: u16,
}

impl SessionKey {
    /// The flow an outbound datagram belongs to.
    pub fn outbound<B: AsRef<[u8]>>(packet: &UdpPacket<B>) -> Self {
        Self {
            dst_addr: packet.dst_addr(),
            dst_port: packet.dst_port(),
            src_port: packet.src_port(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{} -> {}:{}", self.src_port, self.dst_addr, self.dst_port)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Capacity overflow on insert.
    Evicted,
    /// A newer handle was stored under the same key.
    Replaced,
    /// Shutdown.
    Drained,
    /// Socket failure; the caller removed the entry itself.
    Failed,
}

/// Receives every handle leaving a [`SessionCache`] other than through [`SessionCache::remove`].
///
/// The handle is moved in, so a given handle reaches the closer at most once.
pub trait SessionCloser<H> {
    fn close(&mut self, key: SessionKey, handle: H, reason: CloseReason);
}

impl<H, F> SessionCloser<H> for F
where
    F: FnMut(SessionKey, H, CloseReason),
{
    fn close(&mut self, key: SessionKey, handle: H, reason: CloseReason) {
        self(key, handle, reason)
    }
}

/// Fixed-capacity LRU map from [`SessionKey`] to a live session handle.
pub struct SessionCache<H> {
    entries: LruCache<SessionKey, H>,
}

impl<H> SessionCache<H> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a session, marking it most recently used.
    pub fn get(&mut self, key: &SessionKey) -> Option<&mut H> {
        self.entries.get_mut(key)
    }

    /// Look up a session without touching recency.
    pub fn peek(&self, key: &SessionKey) -> Option<&H> {
        self.entries.peek(key)
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.entries.contains(key)
    }

    /// Entries from most to least recently used. Does not touch recency.
    pub fn iter(&self) -> impl Iterator<Item = (&SessionKey, &H)> {
        self.entries.iter()
    }

    /// Insert a session. At capacity, the least recently used entry is handed to `closer` first.
    pub fn put<C: SessionCloser<H>>(&mut self, key: SessionKey, handle: H, closer: &mut C) {
        if let Some(old) = self.entries.pop(&key) {
            closer.close(key, old, CloseReason::Replaced);
        }
        while self.entries.len() >= self.capacity() {
            let Some((evicted_key, evicted)) = self.entries.pop_lru() else {
                break;
            };
            closer.close(evicted_key, evicted, CloseReason::Evicted);
        }
        self.entries.put(key, handle);
    }

    /// Remove a session, giving the handle back to the caller to close.
    pub fn remove(&mut self, key: &SessionKey) -> Option<H> {
        self.entries.pop(key)
    }

    /// Hand every entry to `closer`, least recently used first, leaving the cache empty.
    pub fn drain_all<C: SessionCloser<H>>(&mut self, closer: &mut C) {
        while let Some((key, handle)) = self.entries.pop_lru() {
            closer.close(key, handle, CloseReason::Drained);
        }
    }
}

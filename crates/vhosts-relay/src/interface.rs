//! The virtual interface seam: a blocking byte-frame duplex supplied by the host.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{RelayError, Result};

/// A tun-style device carrying raw IPv4 frames.
///
/// Implementations are shared between the dispatcher thread (reads and DNS writes) and the relay
/// thread (reply writes), so every method takes `&self`.
pub trait VirtualInterface: Send + Sync {
    /// Block until a frame arrives and copy it into `buf`.
    ///
    /// `Ok(None)` means the interface is closed (EOF, or [`close`](Self::close) was called).
    /// `Ok(Some(0))` is a spurious wakeup and should be retried.
    fn read_frame(&self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    /// Write one complete frame.
    fn write_frame(&self, frame: &[u8]) -> io::Result<usize>;

    /// Close the interface. Must force a blocked [`read_frame`](Self::read_frame) to return.
    fn close(&self);
}

impl<T: VirtualInterface + ?Sized> VirtualInterface for Arc<T> {
    fn read_frame(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        <T as VirtualInterface>::read_frame(&**self, buf)
    }

    fn write_frame(&self, frame: &[u8]) -> io::Result<usize> {
        <T as VirtualInterface>::write_frame(&**self, frame)
    }

    fn close(&self) {
        <T as VirtualInterface>::close(&**self)
    }
}

impl<T: VirtualInterface + ?Sized> VirtualInterface for Box<T> {
    fn read_frame(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        <T as VirtualInterface>::read_frame(&**self, buf)
    }

    fn write_frame(&self, frame: &[u8]) -> io::Result<usize> {
        <T as VirtualInterface>::write_frame(&**self, frame)
    }

    fn close(&self) {
        <T as VirtualInterface>::close(&**self)
    }
}

/// Write half of the interface shared by the dispatcher and the relay loop.
///
/// Writes are serialized so frames from the two threads never interleave.
#[derive(Clone)]
pub struct InterfaceWriter {
    iface: Arc<dyn VirtualInterface>,
    lock: Arc<Mutex<()>>,
}

impl InterfaceWriter {
    pub fn new(iface: Arc<dyn VirtualInterface>) -> Self {
        Self {
            iface,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn write(&self, frame: &[u8]) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let written = self.iface.write_frame(frame).map_err(RelayError::Interface)?;
        if written != frame.len() {
            return Err(RelayError::Interface(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short interface write: {written} of {} bytes", frame.len()),
            )));
        }
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    inbound: VecDeque<Vec<u8>>,
    written: VecDeque<Vec<u8>>,
    closed: bool,
}

/// In-process [`VirtualInterface`]: frames are injected by hand and written frames are collected.
#[derive(Default)]
pub struct MemoryInterface {
    state: Mutex<MemoryState>,
    readable: Condvar,
    writable: Condvar,
}

impl MemoryInterface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame for the reader. Ignored once closed.
    pub fn inject(&self, frame: impl Into<Vec<u8>>) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.inbound.push_back(frame.into());
        self.readable.notify_one();
    }

    /// Pop the oldest written frame, waiting up to `timeout` for one to appear.
    pub fn next_written(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(frame) = state.written.pop_front() {
                return Some(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .writable
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
    }

    /// Frames written so far and not yet taken.
    pub fn written_len(&self) -> usize {
        self.lock().written.len()
    }

    /// Frames injected but not yet read.
    pub fn pending_len(&self) -> usize {
        self.lock().inbound.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl VirtualInterface for MemoryInterface {
    fn read_frame(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Ok(None);
            }
            if let Some(frame) = state.inbound.pop_front() {
                // Oversized frames are truncated like a tun read into a short buffer.
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                return Ok(Some(n));
            }
            state = self
                .readable
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn write_frame(&self, frame: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if state.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "interface closed",
            ));
        }
        state.written.push_back(frame.to_vec());
        self.writable.notify_all();
        Ok(frame.len())
    }

    fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.inbound.clear();
        self.readable.notify_all();
        self.writable.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_unblocks_reader() {
        let iface = Arc::new(MemoryInterface::new());
        let reader = {
            let iface = Arc::clone(&iface);
            std::thread::spawn(move || {
                let mut buf = [0u8; 64];
                iface.read_frame(&mut buf).unwrap()
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        iface.close();
        assert_eq!(reader.join().unwrap(), None);
    }

    #[test]
    fn frames_flow_through_shared_handles() {
        let mem = Arc::new(MemoryInterface::new());
        let iface: Arc<dyn VirtualInterface> = mem.clone();

        mem.inject(vec![1, 2, 3]);
        mem.inject(Vec::new());
        let mut buf = [0u8; 2];
        assert_eq!(iface.read_frame(&mut buf).unwrap(), Some(2));
        assert_eq!(buf, [1, 2]);
        assert_eq!(iface.read_frame(&mut buf).unwrap(), Some(0));

        let writer = InterfaceWriter::new(iface);
        writer.write(&[9, 9]).unwrap();
        assert_eq!(
            mem.next_written(Duration::from_millis(10)),
            Some(vec![9, 9])
        );
        assert_eq!(mem.next_written(Duration::from_millis(10)), None);

        mem.close();
        assert!(matches!(writer.write(&[1]), Err(RelayError::Interface(_))));
    }
}

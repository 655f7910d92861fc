//! Inherited tun descriptor as a [`VirtualInterface`].

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};

use vhosts_relay::VirtualInterface;

/// A tun device whose descriptor was opened (and configured) by the parent process.
///
/// Reads wait on the device and on an internal wake socket, so [`close`](VirtualInterface::close)
/// releases a blocked reader without racing the descriptor being closed underneath it.
pub struct TunFd {
    file: File,
    wake_rx: UnixStream,
    wake_tx: UnixStream,
    closed: AtomicBool,
}

impl TunFd {
    /// Take ownership of an inherited descriptor.
    pub fn adopt(fd: RawFd) -> io::Result<Self> {
        if fd < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid tun descriptor {fd}"),
            ));
        }
        // SAFETY: the descriptor is handed over by the parent process and nothing else in this
        // process owns it.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        Self::new(owned)
    }

    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        let (wake_rx, wake_tx) = UnixStream::pair()?;
        Ok(Self {
            file: File::from(fd),
            wake_rx,
            wake_tx,
            closed: AtomicBool::new(false),
        })
    }

    /// Wait until the device is readable. Returns false if woken by `close`.
    fn wait_readable(&self) -> io::Result<bool> {
        let mut fds = [
            libc::pollfd {
                fd: self.file.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.wake_rx.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(false);
            }
            // SAFETY: `fds` is a valid array of two initialized pollfd structs that outlives the
            // call, and both descriptors stay open for the lifetime of `self`.
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if fds[1].revents != 0 || self.closed.load(Ordering::Acquire) {
                return Ok(false);
            }
            if fds[0].revents & libc::POLLNVAL != 0 {
                return Err(io::Error::from_raw_os_error(libc::EBADF));
            }
            if fds[0].revents != 0 {
                return Ok(true);
            }
        }
    }
}

impl VirtualInterface for TunFd {
    fn read_frame(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        if !self.wait_readable()? {
            return Ok(None);
        }
        match (&self.file).read(buf) {
            // A tun device never reports EOF while up; a zero read after a hangup means the peer
            // end is gone.
            Ok(0) => Ok(None),
            Ok(n) => Ok(Some(n)),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(Some(0)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(Some(0)),
            Err(err) => Err(err),
        }
    }

    fn write_frame(&self, frame: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "tun closed"));
        }
        (&self.file).write(frame)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // Best effort: the flag alone is enough for any reader not yet in poll(2).
            let _ = (&self.wake_tx).write(&[1]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixDatagram;
    use std::sync::Arc;
    use std::time::Duration;

    fn pair() -> (TunFd, UnixDatagram) {
        let (ours, theirs) = UnixDatagram::pair().unwrap();
        (TunFd::new(OwnedFd::from(ours)).unwrap(), theirs)
    }

    #[test]
    fn frames_pass_both_ways() {
        let (tun, peer) = pair();
        peer.send(&[0x45, 1, 2, 3]).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(tun.read_frame(&mut buf).unwrap(), Some(4));
        assert_eq!(&buf[..4], &[0x45, 1, 2, 3]);

        assert_eq!(tun.write_frame(&[9, 8, 7]).unwrap(), 3);
        let mut out = [0u8; 8];
        assert_eq!(peer.recv(&mut out).unwrap(), 3);
    }

    #[test]
    fn close_releases_blocked_reader() {
        let (tun, _peer) = pair();
        let tun = Arc::new(tun);
        let reader = {
            let tun = Arc::clone(&tun);
            std::thread::spawn(move || {
                let mut buf = [0u8; 64];
                tun.read_frame(&mut buf).unwrap()
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        tun.close();
        assert_eq!(reader.join().unwrap(), None);
        assert!(tun.write_frame(&[1]).is_err());
    }

    #[test]
    fn negative_descriptor_is_rejected() {
        assert!(TunFd::adopt(-1).is_err());
    }
}

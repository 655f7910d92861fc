use socket2::Socket;
use tracing::warn;

/// Host capability that exempts a relay socket from the virtual interface's routes.
///
/// Called right after the socket is created and before it is connected. Returning `false`
/// abandons the flow; a relay socket that is not protected would be routed straight back into
/// the interface.
pub trait SocketProtector: Send + Sync {
    fn protect(&self, socket: &Socket) -> bool;
}

impl<F> SocketProtector for F
where
    F: Fn(&Socket) -> bool + Send + Sync,
{
    fn protect(&self, socket: &Socket) -> bool {
        self(socket)
    }
}

/// For hosts whose routing already keeps relay traffic off the interface.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProtection;

impl SocketProtector for NoProtection {
    fn protect(&self, _socket: &Socket) -> bool {
        true
    }
}

/// Tags relay sockets with `SO_MARK` so a policy-routing rule can send them around the interface.
#[cfg(any(target_os = "android", target_os = "linux"))]
#[derive(Debug, Clone, Copy)]
pub struct FwMark(pub u32);

#[cfg(any(target_os = "android", target_os = "linux"))]
impl SocketProtector for FwMark {
    fn protect(&self, socket: &Socket) -> bool {
        match socket.set_mark(self.0) {
            Ok(()) => true,
            Err(err) => {
                warn!(mark = self.0, error = %err, "failed to set SO_MARK on relay socket");
                false
            }
        }
    }
}

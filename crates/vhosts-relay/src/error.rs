use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

/// Failures surfaced by the relay engine.
///
/// Per-packet decode failures never show up here: they are `vhosts_packet::PacketError`s and the
/// frame is simply dropped. Everything below is scoped to one flow (`Protect`, `Socket`), one
/// thread (`Interface`), or the engine as a whole (`Config`, `Stopped`).
#[derive(Debug, Error)]
pub enum RelayError {
    /// The host declined to exempt a relay socket from the virtual interface's routes.
    #[error("host refused to protect relay socket")]
    Protect,

    /// I/O failure on a relay socket.
    #[error("relay socket error: {0}")]
    Socket(#[source] std::io::Error),

    /// Read or write failure on the virtual interface.
    #[error("virtual interface error: {0}")]
    Interface(#[source] std::io::Error),

    #[error("failed to start engine thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(&'static str),

    #[error("relay is not running")]
    Stopped,
}

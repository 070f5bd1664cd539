use std::net::SocketAddr;

use bytes::Bytes;

/// What the transport thinks of the write it was just handed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Keep going.
    Ready,
    /// The transport's buffer is full: the connection pauses itself until
    /// [crate::H2Connection::resume_producing] is called.
    Full,
}

/// The byte sink under an [crate::H2Connection]. Writes never fail: a
/// transport that can't deliver any more reports it through
/// [crate::H2Connection::connection_lost].
pub trait Transport {
    fn write(&mut self, data: Bytes) -> Backpressure;

    /// Polite close: flush what was written, then disconnect.
    fn lose_connection(&mut self);

    /// Immediate close, discarding anything not yet delivered.
    fn abort_connection(&mut self);

    fn host(&self) -> Option<SocketAddr> {
        None
    }

    fn peer(&self) -> Option<SocketAddr> {
        None
    }
}

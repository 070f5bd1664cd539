use std::{collections::VecDeque, net::SocketAddr};

use bytes::{Buf, Bytes};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::{sleep_until, timeout_at, Instant},
};
use tracing::{debug, trace};

use super::{Backpressure, H2Config, H2Connection, RequestFactory, StreamError, Transport};
use crate::error::ServeError;

/// Outbound bytes the connection may queue before it's asked to pause
const HIGH_WATER_MARK: usize = 64 * 1024;

const READ_BUF_SIZE: usize = 16 * 1024;

/// Addresses of both ends of the connection, if known. Handed to every
/// [crate::StreamHandle].
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnAddrs {
    pub host: Option<SocketAddr>,
    pub peer: Option<SocketAddr>,
}

/// Serves one HTTP/2 connection (prior knowledge, the client preface is
/// expected first) until either side closes it.
pub async fn serve<IO, F>(
    mut io: IO,
    addrs: ConnAddrs,
    factory: F,
    config: H2Config,
) -> Result<(), ServeError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
    F: RequestFactory,
{
    let transport = BufferedTransport::new(addrs);
    let mut conn = H2Connection::new(transport, factory, config);
    conn.connection_made();

    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        conn.send_prioritised_data();

        // a peer that doesn't read must not keep us from timing out
        let flushed = match conn.next_timeout() {
            Some(deadline) => timeout_at(deadline, flush(&mut io, &mut conn)).await.ok(),
            None => Some(flush(&mut io, &mut conn).await),
        };
        match flushed {
            Some(res) => res?,
            None => {
                conn.handle_timeout();
                continue;
            }
        }

        match conn.transport().closing {
            Closing::Open => {}
            Closing::Lose => {
                debug!("closing connection");
                io.shutdown().await.map_err(ServeError::DownstreamWrite)?;
                conn.connection_lost(StreamError::ConnectionLost);
                return Ok(());
            }
            Closing::Abort => {
                debug!("connection aborted");
                conn.connection_lost(StreamError::ConnectionLost);
                return Ok(());
            }
        }

        let deadline = conn.next_timeout();
        tokio::select! {
            res = io.read(&mut buf) => {
                let n = match res {
                    Ok(n) => n,
                    Err(e) => {
                        conn.connection_lost(StreamError::ConnectionLost);
                        return Err(ServeError::DownstreamRead(e));
                    }
                };
                if n == 0 {
                    debug!("peer hung up");
                    conn.connection_lost(StreamError::ConnectionLost);
                    return Ok(());
                }
                trace!(%n, "read from peer");
                conn.data_received(&buf[..n]);
            }
            _ = conn.process_events() => {}
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                conn.handle_timeout();
            }
        }
    }
}

/// Writes out everything the connection queued, resuming it whenever it
/// paused itself for lack of room.
async fn flush<IO, F>(
    io: &mut IO,
    conn: &mut H2Connection<BufferedTransport, F>,
) -> Result<(), ServeError>
where
    IO: AsyncWrite + Unpin,
    F: RequestFactory,
{
    loop {
        if conn.transport().closing == Closing::Abort {
            return Ok(());
        }

        let Some(chunk) = conn.transport().front() else {
            if conn.is_paused() {
                conn.resume_producing();
                continue;
            }
            io.flush().await.map_err(ServeError::DownstreamWrite)?;
            return Ok(());
        };

        // single writes (rather than `write_all`) so that a flush cut short
        // by a timer never leaves half a chunk unaccounted for
        let n = io.write(&chunk).await.map_err(ServeError::DownstreamWrite)?;
        if n == 0 {
            return Err(ServeError::DownstreamWrite(
                std::io::ErrorKind::WriteZero.into(),
            ));
        }
        conn.transport_mut().advance(n);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closing {
    Open,
    Lose,
    Abort,
}

/// Holds the connection's writes until [serve] gets them onto the socket.
struct BufferedTransport {
    out: VecDeque<Bytes>,
    buffered: usize,
    closing: Closing,
    addrs: ConnAddrs,
}

impl BufferedTransport {
    fn new(addrs: ConnAddrs) -> Self {
        Self {
            out: Default::default(),
            buffered: 0,
            closing: Closing::Open,
            addrs,
        }
    }

    fn front(&self) -> Option<Bytes> {
        self.out.front().cloned()
    }

    fn advance(&mut self, n: usize) {
        let Some(front) = self.out.front_mut() else {
            return;
        };
        front.advance(n);
        self.buffered -= n;
        if front.is_empty() {
            self.out.pop_front();
        }
    }
}

impl Transport for BufferedTransport {
    fn write(&mut self, data: Bytes) -> Backpressure {
        if self.closing == Closing::Abort || data.is_empty() {
            return Backpressure::Ready;
        }
        self.buffered += data.len();
        self.out.push_back(data);

        if self.buffered >= HIGH_WATER_MARK {
            Backpressure::Full
        } else {
            Backpressure::Ready
        }
    }

    fn lose_connection(&mut self) {
        if self.closing == Closing::Open {
            self.closing = Closing::Lose;
        }
    }

    fn abort_connection(&mut self) {
        self.closing = Closing::Abort;
        self.out.clear();
        self.buffered = 0;
    }

    fn host(&self) -> Option<SocketAddr> {
        self.addrs.host
    }

    fn peer(&self) -> Option<SocketAddr> {
        self.addrs.peer
    }
}

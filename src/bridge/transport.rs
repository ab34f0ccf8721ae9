//! Loopback socket transport between the bridge and its worker.
//!
//! The bridge binds an ephemeral loopback port before the worker starts so
//! the port number can be handed over in the handshake preamble, then
//! accepts exactly one connection. The accepted stream is split into framed
//! halves; [`Connection`] is generic over them so a fake worker can be
//! scripted over in-memory duplex streams.

use std::io;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::{FrameCodec, SignalCodec};
use super::protocol::Frame;

/// Listener for the single worker connection of one bridge instance.
pub struct BridgeListener {
    inner: TcpListener,
    port: u16,
}

impl BridgeListener {
    /// Bind an ephemeral loopback port.
    pub async fn bind() -> io::Result<Self> {
        let inner = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = inner.local_addr()?.port();
        tracing::trace!(port, "Bound bridge listener");
        Ok(Self { inner, port })
    }

    /// Port to announce in the handshake preamble.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept the worker connection, bounded by `limit` unless `None`
    /// (debug mode, where the worker lifecycle is managed externally).
    pub async fn accept(self, limit: Option<Duration>) -> io::Result<BridgeConnection> {
        let accept = self.inner.accept();
        let (stream, peer) = match limit {
            Some(window) => tokio::time::timeout(window, accept).await.map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    "worker did not connect within the accept window",
                )
            })??,
            None => accept.await?,
        };
        stream.set_nodelay(true)?;
        tracing::debug!(%peer, "Worker connected");
        Ok(Connection::from_stream(stream))
    }
}

/// The bridge end of an established worker connection.
///
/// Frames are strictly half-duplex per turn: one signal read, then at most
/// one response frame, never pipelined.
#[derive(Debug)]
pub struct Connection<R, W> {
    signals: FramedRead<R, SignalCodec>,
    frames: FramedWrite<W, FrameCodec>,
}

/// Connection type produced by [`BridgeListener::accept`].
pub type BridgeConnection = Connection<OwnedReadHalf, OwnedWriteHalf>;

impl BridgeConnection {
    fn from_stream(stream: TcpStream) -> Self {
        let (read, write) = stream.into_split();
        Self::from_parts(read, write)
    }
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn from_parts(read: R, write: W) -> Self {
        Self {
            signals: FramedRead::new(read, SignalCodec),
            frames: FramedWrite::new(write, FrameCodec),
        }
    }

    /// Read the next control integer, bounded by `limit` unless `None`.
    ///
    /// `ErrorKind::TimedOut` marks a worker that stopped responding,
    /// `ErrorKind::UnexpectedEof` one that closed the socket mid-protocol.
    pub async fn read_signal(&mut self, limit: Option<Duration>) -> io::Result<i32> {
        let next = self.signals.next();
        let item = match limit {
            Some(window) => tokio::time::timeout(window, next).await.map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no signal from worker within the read timeout",
                )
            })?,
            None => next.await,
        };
        match item {
            Some(result) => result,
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "worker closed the connection",
            )),
        }
    }

    /// Announce `size` payload bytes; `has_next` is false exactly on the
    /// last chunk of a logical unit.
    pub async fn notify_write(&mut self, size: usize, has_next: bool) -> io::Result<()> {
        self.frames.send(Frame::Buffer { size, has_next }).await
    }

    /// Confirm consumption of one result unit.
    pub async fn confirm_read(&mut self) -> io::Result<()> {
        self.frames.send(Frame::ReadConfirmation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    #[tokio::test]
    async fn accepts_worker_and_reads_signal() {
        let listener = BridgeListener::bind().await.unwrap();
        let port = listener.port();

        let worker = tokio::spawn(async move {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            stream.write_all(&(-1i32).to_be_bytes()).await.unwrap();
            stream
        });

        let mut conn = listener.accept(Some(Duration::from_secs(5))).await.unwrap();
        let signal = conn
            .read_signal(Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(signal, -1);

        let _ = worker.await.unwrap();
    }

    #[tokio::test]
    async fn accept_times_out_without_worker() {
        let listener = BridgeListener::bind().await.unwrap();
        let err = listener
            .accept(Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn signal_read_times_out() {
        let (ours, _theirs) = duplex(64);
        let (read, write) = tokio::io::split(ours);
        let mut conn = Connection::from_parts(read, write);

        let err = conn
            .read_signal(Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn closed_peer_reads_as_eof() {
        let (ours, theirs) = duplex(64);
        drop(theirs);
        let (read, write) = tokio::io::split(ours);
        let mut conn = Connection::from_parts(read, write);

        let err = conn.read_signal(None).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn frames_reach_the_peer() {
        let (ours, mut theirs) = duplex(64);
        let (read, write) = tokio::io::split(ours);
        let mut conn = Connection::from_parts(read, write);

        conn.notify_write(7, false).await.unwrap();
        conn.confirm_read().await.unwrap();

        let mut bytes = [0u8; 6];
        theirs.read_exact(&mut bytes).await.unwrap();
        assert_eq!(bytes, [0, 0, 0, 7, 32, 0]);
    }
}

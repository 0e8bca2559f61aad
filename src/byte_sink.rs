use std::io;
use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

/// This is an abstraction for writing to a connection without blocking, introduced to decouple
///  the send path from concrete sockets and to facilitate mocking the I/O part away for testing.
///
/// `send_vectored` returns the number of bytes the connection accepted, which may be fewer than
///  offered. It signals
/// * backpressure as `Err` with `ErrorKind::WouldBlock`
/// * an orderly close by the peer as `Ok(0)` for a non-empty write
/// * any other failure as `Err`
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ByteSink: Send + Sync + 'static {
    fn send_vectored(&self, bufs: &[Bytes]) -> io::Result<usize>;

    /// Waits until the connection is likely to accept more bytes.
    async fn writable(&self) -> io::Result<()>;
}

/// The receive side counterpart of `ByteSink`. `try_read` returns `Ok(0)` on an orderly close by
///  the peer, and `WouldBlock` if no bytes are available right now.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ByteSource: Send + Sync + 'static {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;

    async fn readable(&self) -> io::Result<()>;
}

/// Both halves of an established connection
#[derive(Clone)]
pub struct Connection {
    pub sink: Arc<dyn ByteSink>,
    pub source: Arc<dyn ByteSource>,
}

impl Connection {
    pub fn new<T: ByteSink + ByteSource>(connection: Arc<T>) -> Connection {
        Connection {
            sink: connection.clone(),
            source: connection,
        }
    }
}

pub(crate) fn is_backpressure(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

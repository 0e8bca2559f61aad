use std::io;
use std::io::IoSlice;
use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;
use tracing::{debug, trace};
use crate::byte_sink::{ByteSink, ByteSource, Connection};
use crate::reconnect::Reconnector;

/// A TCP connection carrying one data link's packets in both directions
pub struct TcpConnection {
    stream: TcpStream,
    peer_addr: SocketAddr,
}

impl TcpConnection {
    pub async fn connect(addr: SocketAddr) -> io::Result<TcpConnection> {
        let stream = TcpStream::connect(addr).await?;
        TcpConnection::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> io::Result<TcpConnection> {
        // packets are written as a whole
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        debug!("TCP connection to {:?} established", peer_addr);
        Ok(TcpConnection {
            stream,
            peer_addr,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

#[async_trait]
impl ByteSink for TcpConnection {
    fn send_vectored(&self, bufs: &[Bytes]) -> io::Result<usize> {
        let slices = bufs.iter()
            .map(|b| IoSlice::new(b))
            .collect::<Vec<_>>();
        let result = self.stream.try_write_vectored(&slices);
        trace!("TCP write to {:?}: {:?}", self.peer_addr, result);
        result
    }

    async fn writable(&self) -> io::Result<()> {
        self.stream.writable().await
    }
}

#[async_trait]
impl ByteSource for TcpConnection {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }

    async fn readable(&self) -> io::Result<()> {
        self.stream.readable().await
    }
}

/// Re-establishes a link's connection by dialing the remote address again. This is used on the
///  active (connecting) side of a link.
pub struct TcpReconnector {
    remote_addr: SocketAddr,
}

impl TcpReconnector {
    pub fn new(remote_addr: SocketAddr) -> TcpReconnector {
        TcpReconnector { remote_addr }
    }
}

#[async_trait]
impl Reconnector for TcpReconnector {
    async fn attempt_reconnect(&self) -> anyhow::Result<Connection> {
        let connection = TcpConnection::connect(self.remote_addr).await?;
        Ok(Connection::new(Arc::new(connection)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::runtime::Builder;

    #[test]
    fn test_tcp_round_trip() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();

            let client = TcpReconnector::new(addr);
            let (connection, accepted) = tokio::join!(client.attempt_reconnect(), listener.accept());
            let connection = connection.unwrap();
            let server = TcpConnection::from_stream(accepted.unwrap().0).unwrap();

            connection.sink.writable().await.unwrap();
            let n = connection.sink.send_vectored(&[Bytes::from_static(b"abc"), Bytes::from_static(b"de")]).unwrap();
            assert_eq!(n, 5);

            let mut buf = [0u8; 16];
            let mut received = Vec::new();
            while received.len() < 5 {
                tokio::time::timeout(Duration::from_secs(5), server.readable()).await.unwrap().unwrap();
                match server.try_read(&mut buf) {
                    Ok(n) => received.extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => panic!("{}", e),
                }
            }
            assert_eq!(received, b"abcde");
        });
    }

    #[test]
    fn test_reconnect_fails_without_listener() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            drop(listener);

            assert!(TcpReconnector::new(addr).attempt_reconnect().await.is_err());
        });
    }
}

use crate::errors::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// The transport a `PeerConnection` drives. TCP is implemented here; a
/// uTP (BEP-29) implementation would satisfy the same trait.
#[async_trait]
pub trait PeerTransport: Send {
    async fn connect(addr: SocketAddr) -> Result<Self>
    where
        Self: Sized;

    /// Reads at least one byte into `buf`, returning how many were read.
    /// `0` means the peer closed the connection.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    async fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    fn close(&mut self);
}

pub struct TcpPeerTransport {
    stream: Option<TcpStream>,
}

#[async_trait]
impl PeerTransport for TcpPeerTransport {
    async fn connect(addr: SocketAddr) -> Result<TcpPeerTransport> {
        let stream = TcpStream::connect(addr).await?;
        Ok(TcpPeerTransport {
            stream: Some(stream),
        })
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match &mut self.stream {
            Some(stream) => Ok(stream.read(buf).await?),
            None => Ok(0),
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match &mut self.stream {
            Some(stream) => {
                stream.write_all(buf).await?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn close(&mut self) {
        self.stream = None;
    }
}

impl TcpPeerTransport {
    pub fn from_stream(stream: TcpStream) -> TcpPeerTransport {
        TcpPeerTransport {
            stream: Some(stream),
        }
    }
}


use std::any::Any;
use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::*;

/// `TcpConn` exposes a TCP stream through the [`Conn`] interface, so peer and
/// client data connections are relayed like any other transport.
pub struct TcpConn {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    close_notify: CancellationToken,
}

impl TcpConn {
    pub fn new(stream: TcpStream) -> Result<Self> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        Ok(TcpConn {
            local_addr,
            peer_addr,
            reader: Mutex::new(reader),
            writer: Mutex::new(Some(writer)),
            close_notify: CancellationToken::new(),
        })
    }

    /// Dials `addr`.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::new(stream)
    }
}

#[async_trait]
impl Conn for TcpConn {
    async fn connect(&self, _addr: SocketAddr) -> util::Result<()> {
        Err(io::Error::new(io::ErrorKind::Other, "Not applicable").into())
    }

    /// Reads from the stream. Returns 0 once the peer has finished sending.
    async fn recv(&self, buf: &mut [u8]) -> util::Result<usize> {
        if self.close_notify.is_cancelled() {
            return Err(util::Error::ErrUseClosedNetworkConn);
        }

        let mut reader = self.reader.lock().await;
        tokio::select! {
            result = reader.read(buf) => Ok(result?),
            _ = self.close_notify.cancelled() => Err(util::Error::ErrUseClosedNetworkConn),
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> util::Result<(usize, SocketAddr)> {
        let n = self.recv(buf).await?;
        Ok((n, self.peer_addr))
    }

    async fn send(&self, buf: &[u8]) -> util::Result<usize> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => {
                writer.write_all(buf).await?;
                Ok(buf.len())
            }
            None => Err(util::Error::ErrUseClosedNetworkConn),
        }
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> util::Result<usize> {
        if target != self.peer_addr {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("stream is connected to {}, not {}", self.peer_addr, target),
            )
            .into());
        }
        self.send(buf).await
    }

    fn local_addr(&self) -> util::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.peer_addr)
    }

    /// Shuts the write side down and unblocks pending reads.
    async fn close(&self) -> util::Result<()> {
        if self.close_notify.is_cancelled() {
            return Err(util::Error::ErrAlreadyClosed);
        }
        self.close_notify.cancel();

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            // The peer may already be gone.
            let _ = writer.shutdown().await;
        }

        Ok(())
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

/// `TcpRelayListener` exposes a [`TcpListener`] through the [`Listener`]
/// interface used by stream allocations.
pub struct TcpRelayListener {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    close_notify: CancellationToken,
}

impl TcpRelayListener {
    /// Binds to the first address `addr` resolves to.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        Ok(TcpRelayListener {
            listener: Mutex::new(Some(listener)),
            local_addr,
            close_notify: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Listener for TcpRelayListener {
    async fn accept(&self) -> util::Result<(Arc<dyn Conn + Send + Sync>, SocketAddr)> {
        let guard = self.listener.lock().await;
        let listener = match guard.as_ref() {
            Some(listener) if !self.close_notify.is_cancelled() => listener,
            _ => return Err(util::Error::ErrClosedListener),
        };

        tokio::select! {
            result = listener.accept() => {
                let (stream, peer) = result?;
                let conn = TcpConn::new(stream).map_err(|err| util::Error::Other(err.to_string()))?;
                Ok((Arc::new(conn), peer))
            }
            _ = self.close_notify.cancelled() => Err(util::Error::ErrClosedListener),
        }
    }

    /// Unblocks pending accepts and releases the port.
    async fn close(&self) -> util::Result<()> {
        if self.close_notify.is_cancelled() {
            return Err(util::Error::ErrClosedListener);
        }
        self.close_notify.cancel();
        self.listener.lock().await.take();

        Ok(())
    }

    async fn addr(&self) -> util::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

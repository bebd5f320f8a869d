use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use portable_atomic::AtomicBool;
use tokio_util::sync::CancellationToken;
use util::Conn;

use super::scheduler::{Command, Scheduler};
use crate::error::*;

const RELAY_BUFFER_SIZE: usize = 64 * 1024;

/// A TCP connection between the relayed transport address of an allocation
/// and a peer, identified by its connection id.
///
/// [RFC 6062 Section 2](https://www.rfc-editor.org/rfc/rfc6062#section-2).
pub struct PeerConnection {
    id: u32,
    peer_addr: SocketAddr,
    conn: Arc<dyn Conn + Send + Sync>,
    close_notify: CancellationToken,
    scheduler: Option<Scheduler>,
    bound: AtomicBool,
}

impl PeerConnection {
    pub(crate) fn new(
        id: u32,
        peer_addr: SocketAddr,
        conn: Arc<dyn Conn + Send + Sync>,
        close_notify: CancellationToken,
        scheduler: Option<Scheduler>,
    ) -> Self {
        PeerConnection {
            id,
            peer_addr,
            conn,
            close_notify,
            scheduler,
            bound: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Pipes bytes both ways between `client`, the client data connection
    /// that sent ConnectionBind, and the peer. Both connections are closed
    /// once either side stops.
    pub fn relay(&self, client: Arc<dyn Conn + Send + Sync>) -> Result<()> {
        if self.close_notify.is_cancelled() {
            return Err(Error::ErrClosed);
        }
        if self.bound.swap(true, Ordering::AcqRel) {
            return Err(Error::ErrConnectionAlreadyBound);
        }

        let id = self.id;
        let peer = Arc::clone(&self.conn);
        let close_notify = self.close_notify.clone();
        let scheduler = self.scheduler.clone();

        tokio::spawn(async move {
            tokio::select! {
                result = pipe(&client, &peer) => {
                    log::debug!("client side of connection {} finished: {:?}", id, result);
                }
                result = pipe(&peer, &client) => {
                    log::debug!("peer side of connection {} finished: {:?}", id, result);
                }
                _ = close_notify.cancelled() => {
                    log::trace!("connection {} closed", id);
                }
            }

            close_notify.cancel();
            let _ = client.close().await;
            let _ = peer.close().await;

            if let Some(scheduler) = &scheduler {
                scheduler.send(Command::ConnectionClosed(id));
            }
        });

        Ok(())
    }

    pub(crate) async fn close(&self) -> Result<()> {
        self.close_notify.cancel();
        Ok(self.conn.close().await?)
    }
}

async fn pipe(from: &Arc<dyn Conn + Send + Sync>, to: &Arc<dyn Conn + Send + Sync>) -> Result<()> {
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = from.recv(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        to.send(&buf[..n]).await?;
    }
}


pub mod allocation_manager;
pub mod channel_bind;
pub mod five_tuple;
pub mod peer_conn;
pub mod permission;
pub(crate) mod scheduler;

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use channel_bind::*;
use five_tuple::*;
use peer_conn::*;
use permission::*;
use portable_atomic::{AtomicBool, AtomicUsize};
use scheduler::*;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use util::conn::Listener;
use util::Conn;

use crate::error::*;
use crate::proto::channum::*;
use crate::relay::tcp::TcpConn;

const INBOUND_MTU: usize = 1500;

/// `CONNECT_TIMEOUT` bounds an outbound peer connection attempt.
///
/// [RFC 6062 Section 5.2](https://www.rfc-editor.org/rfc/rfc6062#section-5.2).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// The relay-side transport owned by an [`Allocation`].
#[derive(Clone)]
pub enum RelaySocket {
    /// Connectionless relaying, RFC 5766.
    Packet(Arc<dyn Conn + Send + Sync>),
    /// Connection-oriented relaying, RFC 6062.
    Listener(Arc<dyn Listener + Send + Sync>),
}

/// Information about an [`Allocation`].
#[derive(Debug, Clone)]
pub struct AllocationInfo {
    /// [`FiveTuple`] of this [`Allocation`].
    pub five_tuple: FiveTuple,

    /// Relayed transport address of this [`Allocation`].
    pub relay_addr: SocketAddr,

    /// Relayed bytes with this [`Allocation`].
    #[cfg(feature = "metrics")]
    pub relayed_bytes: usize,
}

/// What an [`Allocation`] hands over to the protocol front-end, which frames
/// it and sends it to the client over the allocation's turn socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// A permitted peer sent `data` to the relayed transport address.
    /// `channel` is set when a channel is bound to the peer, in which case
    /// the data goes out as ChannelData instead of a Data indication.
    Data {
        five_tuple: FiveTuple,
        peer: SocketAddr,
        channel: Option<ChannelNumber>,
        data: Vec<u8>,
    },
    /// A permitted peer connected to a stream relay.
    ///
    /// [RFC 6062 Section 5.3](https://www.rfc-editor.org/rfc/rfc6062#section-5.3).
    ConnectionAttempt {
        five_tuple: FiveTuple,
        peer: SocketAddr,
        connection_id: u32,
    },
}

/// `Allocation` is tied to a FiveTuple and relays traffic
/// use create_allocation and get_allocation to operate.
pub struct Allocation {
    pub(crate) id: u64,
    five_tuple: FiveTuple,
    turn_socket: Arc<dyn Conn + Send + Sync>,
    pub(crate) relay_addr: SocketAddr,
    pub(crate) relay_socket: RelaySocket,
    permissions: Arc<Mutex<HashMap<IpAddr, Permission>>>,
    channel_bindings: Arc<Mutex<HashMap<ChannelNumber, ChannelBind>>>,
    peer_conns: Mutex<HashMap<u32, Arc<PeerConnection>>>,
    pub(crate) scheduler: Option<Scheduler>,
    pub(crate) relay_event_notify: Option<mpsc::Sender<RelayEvent>>,
    pub(crate) alloc_close_notify: Option<mpsc::Sender<AllocationInfo>>,
    pub(crate) close_notify: CancellationToken,
    closed: AtomicBool,
    pub(crate) relayed_bytes: Arc<AtomicUsize>,
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("id", &self.id)
            .field("five_tuple", &self.five_tuple)
            .field("relay_addr", &self.relay_addr)
            .finish()
    }
}

impl Allocation {
    /// Creates a new [`Allocation`].
    pub fn new(
        turn_socket: Arc<dyn Conn + Send + Sync>,
        relay_socket: RelaySocket,
        relay_addr: SocketAddr,
        five_tuple: FiveTuple,
    ) -> Self {
        Allocation {
            id: 0,
            five_tuple,
            turn_socket,
            relay_addr,
            relay_socket,
            permissions: Arc::new(Mutex::new(HashMap::new())),
            channel_bindings: Arc::new(Mutex::new(HashMap::new())),
            peer_conns: Mutex::new(HashMap::new()),
            scheduler: None,
            relay_event_notify: None,
            alloc_close_notify: None,
            close_notify: CancellationToken::new(),
            closed: AtomicBool::new(false),
            relayed_bytes: Default::default(),
        }
    }

    pub fn five_tuple(&self) -> FiveTuple {
        self.five_tuple
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    /// The client-facing socket the allocation request arrived on.
    pub fn turn_socket(&self) -> Arc<dyn Conn + Send + Sync> {
        Arc::clone(&self.turn_socket)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn info(&self) -> AllocationInfo {
        AllocationInfo {
            five_tuple: self.five_tuple,
            relay_addr: self.relay_addr,
            #[cfg(feature = "metrics")]
            relayed_bytes: self.relayed_bytes.load(Ordering::Acquire),
        }
    }

    /// Checks the Permission for the `addr`.
    pub async fn has_permission(&self, addr: &SocketAddr) -> bool {
        is_permitted(&self.permissions, addr).await
    }

    /// Adds a new [`Permission`] to this [`Allocation`], refreshing the one
    /// already installed for the same IP.
    pub async fn add_permission(&self, p: Permission) {
        let mut permissions = self.permissions.lock().await;
        permissions
            .entry(p.addr.ip())
            .and_modify(|existed| existed.refresh(PERMISSION_TIMEOUT))
            .or_insert(p);
    }

    /// Removes the `addr`'s IP from this [`Allocation`]'s permissions.
    pub async fn remove_permission(&self, addr: &SocketAddr) -> bool {
        let mut permissions = self.permissions.lock().await;
        permissions.remove(&addr.ip()).is_some()
    }

    /// Adds a new [`ChannelBind`] to this [`Allocation`], it also updates the
    /// permissions needed for this [`ChannelBind`].
    pub async fn add_channel_bind(&self, c: ChannelBind, lifetime: Duration) -> Result<()> {
        if !c.number.valid() {
            return Err(Error::ErrInvalidChannelNumber);
        }

        let peer = c.peer;
        {
            let mut channel_bindings = self.channel_bindings.lock().await;
            let now = Instant::now();
            channel_bindings.retain(|_, cb| !cb.is_expired(now));

            if let Some(cb) = channel_bindings.get(&c.number) {
                if cb.peer != c.peer {
                    return Err(Error::ErrSameChannelDifferentPeer);
                }
            }
            if channel_bindings
                .values()
                .any(|cb| cb.peer == c.peer && cb.number != c.number)
            {
                return Err(Error::ErrSameChannelDifferentPeer);
            }

            // Add or refresh this channel.
            channel_bindings
                .entry(c.number)
                .or_insert(c)
                .refresh(lifetime);
        }

        // Channel binds also refresh permissions.
        self.add_permission(Permission::new(peer)).await;

        Ok(())
    }

    /// Removes the [`ChannelBind`] from this [`Allocation`] by `number`.
    pub async fn remove_channel_bind(&self, number: ChannelNumber) -> bool {
        let mut channel_bindings = self.channel_bindings.lock().await;
        channel_bindings.remove(&number).is_some()
    }

    /// Gets the [`ChannelBind`]'s address by `number`.
    pub async fn get_channel_addr(&self, number: &ChannelNumber) -> Option<SocketAddr> {
        let channel_bindings = self.channel_bindings.lock().await;
        let now = Instant::now();
        channel_bindings
            .get(number)
            .filter(|cb| !cb.is_expired(now))
            .map(|cb| cb.peer)
    }

    /// Gets the [`ChannelBind`]'s number from this [`Allocation`] by `addr`.
    pub async fn get_channel_number(&self, addr: &SocketAddr) -> Option<ChannelNumber> {
        channel_for_peer(&self.channel_bindings, addr).await
    }

    /// Re-arms the lifetime of this [`Allocation`]. A zero `lifetime` makes
    /// the manager delete it.
    pub fn refresh(&self, lifetime: Duration) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.schedule(self.lifetime_deadline(), lifetime);
        }
    }

    pub(crate) fn lifetime_deadline(&self) -> Deadline {
        Deadline::Allocation {
            five_tuple: self.five_tuple,
            id: self.id,
        }
    }

    /// Sends `data` from the relayed transport address to `peer`. The peer
    /// must have a permission installed.
    ///
    /// [RFC 5766 Section 10.2](https://www.rfc-editor.org/rfc/rfc5766#section-10.2).
    pub async fn send_to_peer(&self, data: &[u8], peer: SocketAddr) -> Result<usize> {
        let relay_socket = self.packet_socket()?;
        if !self.has_permission(&peer).await {
            return Err(Error::ErrNoPermission);
        }

        self.relay_to(relay_socket, data, peer).await
    }

    /// Sends `data` to the peer bound to channel `number`.
    ///
    /// [RFC 5766 Section 11.6](https://www.rfc-editor.org/rfc/rfc5766#section-11.6).
    pub async fn send_channel_data(&self, number: ChannelNumber, data: &[u8]) -> Result<usize> {
        let relay_socket = self.packet_socket()?;
        let peer = self
            .get_channel_addr(&number)
            .await
            .ok_or(Error::ErrNoSuchChannelBind)?;

        self.relay_to(relay_socket, data, peer).await
    }

    fn packet_socket(&self) -> Result<&Arc<dyn Conn + Send + Sync>> {
        match &self.relay_socket {
            RelaySocket::Packet(conn) => Ok(conn),
            RelaySocket::Listener(_) => Err(Error::ErrNotPacketRelay),
        }
    }

    async fn relay_to(
        &self,
        relay_socket: &Arc<dyn Conn + Send + Sync>,
        data: &[u8],
        peer: SocketAddr,
    ) -> Result<usize> {
        let n = relay_socket.send_to(data, peer).await?;
        if n != data.len() {
            return Err(Error::ErrShortWrite);
        }
        self.relayed_bytes.fetch_add(n, Ordering::AcqRel);

        Ok(n)
    }

    /// Opens a connection from the relay to `peer` and registers it under
    /// connection id `cid`.
    ///
    /// [RFC 6062 Section 5.2](https://www.rfc-editor.org/rfc/rfc6062#section-5.2).
    pub async fn connect(&self, cid: u32, peer: SocketAddr) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ErrClosed);
        }
        if !matches!(self.relay_socket, RelaySocket::Listener(_)) {
            return Err(Error::ErrNotStreamRelay);
        }
        if !self.has_permission(&peer).await {
            return Err(Error::ErrNoPermission);
        }
        {
            let peer_conns = self.peer_conns.lock().await;
            if peer_conns.values().any(|c| c.peer_addr() == peer) {
                return Err(Error::ErrConnectionAlreadyExists);
            }
        }

        let conn = match tokio::time::timeout(CONNECT_TIMEOUT, TcpConn::connect(peer)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(err)) => {
                log::debug!("failed to connect to peer {}: {}", peer, err);
                return Err(Error::ErrConnectionTimeoutOrFailure);
            }
            Err(_) => {
                log::debug!("connecting to peer {} timed out", peer);
                return Err(Error::ErrConnectionTimeoutOrFailure);
            }
        };

        self.add_connection(cid, peer, Arc::new(conn)).await
    }

    pub(crate) async fn add_connection(
        &self,
        cid: u32,
        peer: SocketAddr,
        conn: Arc<dyn Conn + Send + Sync>,
    ) -> Result<()> {
        let pc = Arc::new(PeerConnection::new(
            cid,
            peer,
            conn,
            self.close_notify.child_token(),
            self.scheduler.clone(),
        ));

        let mut peer_conns = self.peer_conns.lock().await;
        if self.is_closed() {
            drop(peer_conns);
            let _ = pc.close().await;
            return Err(Error::ErrClosed);
        }
        peer_conns.insert(cid, pc);

        Ok(())
    }

    /// Returns the peer connection registered under `cid`.
    pub async fn get_connection(&self, cid: u32) -> Option<Arc<PeerConnection>> {
        let peer_conns = self.peer_conns.lock().await;
        peer_conns.get(&cid).cloned()
    }

    /// Closes and forgets the peer connection registered under `cid`.
    pub async fn remove_connection(&self, cid: u32) -> bool {
        let pc = self.peer_conns.lock().await.remove(&cid);
        match pc {
            Some(pc) => {
                if let Err(err) = pc.close().await {
                    log::debug!("peer connection {} was already closed: {}", cid, err);
                }
                true
            }
            None => false,
        }
    }

    /// Closes the [`Allocation`].
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::ErrClosed);
        }

        self.close_notify.cancel();

        self.permissions.lock().await.clear();
        self.channel_bindings.lock().await.clear();

        let peer_conns: Vec<Arc<PeerConnection>> = {
            let mut peer_conns = self.peer_conns.lock().await;
            peer_conns.drain().map(|(_, pc)| pc).collect()
        };
        for pc in peer_conns {
            if let Err(err) = pc.close().await {
                log::debug!("peer connection {} was already closed: {}", pc.id(), err);
            }
        }

        log::trace!("allocation with {} closed!", self.five_tuple);

        let result = match &self.relay_socket {
            RelaySocket::Packet(conn) => conn.close().await,
            RelaySocket::Listener(listener) => listener.close().await,
        };

        if let Some(notify_tx) = &self.alloc_close_notify {
            let _ = notify_tx.send(self.info()).await;
        }

        result.map_err(Error::from)
    }

    /// Starts relaying on the relay socket. Called once, by the manager,
    /// after the allocation is visible in the directory.
    pub(crate) fn start(&self) {
        match &self.relay_socket {
            RelaySocket::Packet(conn) => self.packet_handler(Arc::clone(conn)),
            RelaySocket::Listener(listener) => self.listen_handler(Arc::clone(listener)),
        }
    }

    fn teardown(&self) -> Teardown {
        Teardown {
            scheduler: self.scheduler.clone(),
            deadline: self.lifetime_deadline(),
            close_notify: self.close_notify.clone(),
        }
    }

    //  https://tools.ietf.org/html/rfc5766#section-10.3
    //  When the server receives a UDP datagram at a currently allocated
    //  relayed transport address, the server looks up the allocation
    //  associated with the relayed transport address.  The server then
    //  checks to see whether the set of permissions for the allocation allow
    //  the relaying of the UDP datagram as described in Section 8.
    //
    //  If relaying is permitted, then the server checks if there is a
    //  channel bound to the peer that sent the UDP datagram (see
    //  Section 11).  If a channel is bound, then processing proceeds as
    //  described in Section 11.7.
    //
    //  If relaying is permitted but no channel is bound to the peer, then
    //  the server forms and sends a Data indication.
    fn packet_handler(&self, relay_socket: Arc<dyn Conn + Send + Sync>) {
        let five_tuple = self.five_tuple;
        let relay_addr = self.relay_addr;
        let permissions = Arc::clone(&self.permissions);
        let channel_bindings = Arc::clone(&self.channel_bindings);
        let relay_event_notify = self.relay_event_notify.clone();
        let relayed_bytes = Arc::clone(&self.relayed_bytes);
        let close_notify = self.close_notify.clone();
        let teardown = self.teardown();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; INBOUND_MTU];

            loop {
                let (n, src_addr) = tokio::select! {
                    result = relay_socket.recv_from(&mut buffer) => {
                        match result {
                            Ok((n, src_addr)) => (n, src_addr),
                            Err(err) => {
                                teardown.on_failure("packet_handler", err);
                                break;
                            }
                        }
                    }
                    _ = close_notify.cancelled() => {
                        log::trace!("allocation has stopped, stop packet_handler. five_tuple: {:?}", five_tuple);
                        break;
                    }
                };

                log::debug!(
                    "relay socket {} received {} bytes from {}",
                    relay_addr,
                    n,
                    src_addr
                );

                // A channel binding only chooses the framing; the peer still
                // needs a live permission.
                if !is_permitted(&permissions, &src_addr).await {
                    log::info!(
                        "No Permission exists for {} on allocation {}",
                        src_addr,
                        relay_addr
                    );
                    continue;
                }
                let channel = channel_for_peer(&channel_bindings, &src_addr).await;

                relayed_bytes.fetch_add(n, Ordering::AcqRel);

                if let Some(tx) = &relay_event_notify {
                    let event = RelayEvent::Data {
                        five_tuple,
                        peer: src_addr,
                        channel,
                        data: buffer[..n].to_vec(),
                    };
                    if let Err(err) = tx.send(event).await {
                        log::error!(
                            "Failed to deliver data from {} on allocation {}: {}",
                            src_addr,
                            relay_addr,
                            err
                        );
                    }
                }
            }
        });
    }

    //  https://tools.ietf.org/html/rfc6062#section-5.3
    //  When a server receives an incoming TCP connection on a relayed
    //  transport address, it processes the request as follows. The server
    //  MUST accept the connection. If it is not successful, nothing is sent
    //  to the client over the control connection. If the connection is
    //  successfully accepted, it is now called a peer data connection. The
    //  server MUST buffer any data received from the peer. The server
    //  adjusts its advertised TCP receive window to reflect the amount of
    //  empty buffer space. If no permission for this peer has been
    //  installed for this allocation, the server MUST close the connection
    //  with the peer immediately after it has been accepted.
    fn listen_handler(&self, listener: Arc<dyn Listener + Send + Sync>) {
        let id = self.id;
        let five_tuple = self.five_tuple;
        let relay_addr = self.relay_addr;
        let permissions = Arc::clone(&self.permissions);
        let scheduler = self.scheduler.clone();
        let close_notify = self.close_notify.clone();
        let teardown = self.teardown();

        tokio::spawn(async move {
            loop {
                let (conn, peer) = tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((conn, peer)) => (conn, peer),
                            Err(err) => {
                                teardown.on_failure("listen_handler", err);
                                break;
                            }
                        }
                    }
                    _ = close_notify.cancelled() => {
                        log::trace!("allocation has stopped, stop listen_handler. five_tuple: {:?}", five_tuple);
                        break;
                    }
                };

                if !is_permitted(&permissions, &peer).await {
                    log::info!(
                        "No Permission exists for connection from {} on allocation {}",
                        peer,
                        relay_addr
                    );
                    let _ = conn.close().await;
                    continue;
                }

                match &scheduler {
                    Some(scheduler) => scheduler.send(Command::PeerAccepted {
                        five_tuple,
                        allocation_id: id,
                        peer,
                        conn,
                    }),
                    None => {
                        let _ = conn.close().await;
                    }
                }
            }
        });
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.close_notify.cancel();
    }
}

/// Turns the failure of a relay task into a zero-delay lifetime deadline, so
/// the allocation is torn down through the manager like any expiry.
struct Teardown {
    scheduler: Option<Scheduler>,
    deadline: Deadline,
    close_notify: CancellationToken,
}

impl Teardown {
    fn on_failure(&self, task: &str, err: impl fmt::Display) {
        if self.close_notify.is_cancelled() {
            return;
        }

        log::warn!("{} of {:?} failed, tearing down: {}", task, self.deadline, err);
        if let Some(scheduler) = &self.scheduler {
            scheduler.schedule(self.deadline.clone(), Duration::from_secs(0));
        }
    }
}

async fn is_permitted(permissions: &Mutex<HashMap<IpAddr, Permission>>, addr: &SocketAddr) -> bool {
    let mut permissions = permissions.lock().await;
    match permissions.get(&addr.ip()) {
        Some(p) if !p.is_expired(Instant::now()) => true,
        Some(_) => {
            permissions.remove(&addr.ip());
            false
        }
        None => false,
    }
}

async fn channel_for_peer(
    channel_bindings: &Mutex<HashMap<ChannelNumber, ChannelBind>>,
    addr: &SocketAddr,
) -> Option<ChannelNumber> {
    let mut channel_bindings = channel_bindings.lock().await;
    let now = Instant::now();
    channel_bindings.retain(|_, cb| !cb.is_expired(now));
    channel_bindings
        .values()
        .find(|cb| cb.peer == *addr)
        .map(|cb| cb.number)
}

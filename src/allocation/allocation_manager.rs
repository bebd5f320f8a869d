
use std::collections::HashMap;
use std::sync::atomic::Ordering;

use portable_atomic::AtomicU64;
use tokio::runtime::Handle;
use tokio::sync::RwLock;
use util::Conn;

use super::*;
use crate::proto::*;
use crate::relay::*;

/// How long a reserved port is held for a later allocation.
///
/// [RFC 5766 Section 6.2](https://www.rfc-editor.org/rfc/rfc5766#section-6.2).
pub const RESERVATION_LIFETIME: Duration = Duration::from_secs(30);

/// How long a connection id waits for its ConnectionBind.
///
/// [RFC 6062 Section 5.2](https://www.rfc-editor.org/rfc/rfc6062#section-5.2).
pub const CONNECTION_CLAIM_TIMEOUT: Duration = Duration::from_secs(30);

/// `ManagerConfig` a bag of config params for `Manager`.
pub struct ManagerConfig {
    pub relay_addr_generator: Box<dyn RelayAddressGenerator + Send + Sync>,
    pub relay_event_notify: Option<mpsc::Sender<RelayEvent>>,
    pub alloc_close_notify: Option<mpsc::Sender<AllocationInfo>>,
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<()> {
        self.relay_addr_generator.validate()
    }
}

/// A port held for `RESERVATION_LIFETIME`. `id` tells a reservation apart
/// from a later one under the same token.
struct Reservation {
    port: u16,
    id: u64,
}

#[derive(Default)]
struct ManagerState {
    allocations: HashMap<String, Arc<Allocation>>,
    reservations: HashMap<String, Reservation>,
    waiting_conns: HashMap<u32, Arc<Allocation>>,
    running_conns: HashMap<u32, Arc<Allocation>>,
    closed: bool,
}

impl ManagerState {
    fn forget_connections_of(&mut self, a: &Arc<Allocation>) -> Vec<u32> {
        let mut forgotten = vec![];
        for conns in [&mut self.waiting_conns, &mut self.running_conns] {
            conns.retain(|cid, owner| {
                let owned = Arc::ptr_eq(owner, a);
                if owned {
                    forgotten.push(*cid);
                }
                !owned
            });
        }
        forgotten
    }
}

/// `Manager` is used to hold active allocations.
pub struct Manager {
    state: RwLock<ManagerState>,
    relay_addr_generator: Box<dyn RelayAddressGenerator + Send + Sync>,
    scheduler: Scheduler,
    close_notify: CancellationToken,
    next_id: AtomicU64,
    relay_event_notify: Option<mpsc::Sender<RelayEvent>>,
    alloc_close_notify: Option<mpsc::Sender<AllocationInfo>>,
}

impl Manager {
    /// Creates a new [`Manager`] and starts its event loop.
    ///
    /// Must be called from within a Tokio runtime, which keeps driving the
    /// event loop; otherwise [`Error::ErrNoRuntime`] is returned.
    pub fn new(config: ManagerConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| Error::ErrNoRuntime)?;

        let (scheduler, command_rx) = Scheduler::new();
        let close_notify = CancellationToken::new();

        let m = Arc::new_cyclic(|weak| {
            runtime.spawn(scheduler::run(
                weak.clone(),
                command_rx,
                close_notify.clone(),
            ));

            Manager {
                state: RwLock::new(ManagerState::default()),
                relay_addr_generator: config.relay_addr_generator,
                scheduler,
                close_notify,
                next_id: AtomicU64::new(1),
                relay_event_notify: config.relay_event_notify,
                alloc_close_notify: config.alloc_close_notify,
            }
        });

        Ok(m)
    }

    /// Closes this [`Manager`] and closes all [`Allocation`]s it manages.
    ///
    /// Every allocation is closed even if some fail; the failures are
    /// returned together.
    pub async fn close(&self) -> Result<()> {
        let allocations: Vec<Arc<Allocation>> = {
            let mut state = self.state.write().await;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.reservations.clear();
            state.waiting_conns.clear();
            state.running_conns.clear();
            state.allocations.drain().map(|(_, a)| a).collect()
        };

        let mut errs = vec![];
        for a in allocations {
            if let Err(err) = a.close().await {
                log::error!("Failed to close allocation {}: {}", a.five_tuple(), err);
                errs.push(err);
            }
        }

        self.close_notify.cancel();

        flatten_errs(errs)
    }

    /// Returns the information about the all [`Allocation`]s associated with
    /// the specified [`FiveTuple`]s.
    pub async fn get_allocations_info(
        &self,
        five_tuples: Option<Vec<FiveTuple>>,
    ) -> HashMap<FiveTuple, AllocationInfo> {
        let state = self.state.read().await;

        state
            .allocations
            .values()
            .filter(|a| match &five_tuples {
                Some(five_tuples) => five_tuples.contains(&a.five_tuple()),
                None => true,
            })
            .map(|a| (a.five_tuple(), a.info()))
            .collect()
    }

    /// Fetches the [`Allocation`] matching the passed [`FiveTuple`].
    pub async fn get_allocation(&self, five_tuple: &FiveTuple) -> Option<Arc<Allocation>> {
        let state = self.state.read().await;
        state.allocations.get(&five_tuple.fingerprint()).cloned()
    }

    /// Creates a new [`Allocation`] and starts relaying.
    pub async fn create_allocation(
        &self,
        five_tuple: FiveTuple,
        turn_socket: Arc<dyn Conn + Send + Sync>,
        requested_port: u16,
        lifetime: Duration,
    ) -> Result<Arc<Allocation>> {
        five_tuple.validate()?;
        if lifetime == Duration::from_secs(0) {
            return Err(Error::ErrLifetimeZero);
        }

        let a = {
            let mut state = self.state.write().await;
            if state.closed {
                return Err(Error::ErrManagerClosed);
            }

            let fingerprint = five_tuple.fingerprint();
            if state.allocations.contains_key(&fingerprint) {
                return Err(Error::ErrDupeFiveTuple);
            }

            let use_ipv4 = five_tuple.src_addr.is_ipv4();
            let (relay_socket, relay_addr) = match five_tuple.protocol {
                PROTO_UDP => {
                    let (conn, addr) = self
                        .relay_addr_generator
                        .allocate_conn(use_ipv4, requested_port)
                        .await?;
                    (RelaySocket::Packet(conn), addr)
                }
                PROTO_TCP => {
                    let (listener, addr) = self
                        .relay_addr_generator
                        .allocate_listener(use_ipv4, requested_port)
                        .await?;
                    (RelaySocket::Listener(listener), addr)
                }
                _ => return Err(Error::ErrUnsupportedRelayProtocol),
            };

            let mut a = Allocation::new(turn_socket, relay_socket, relay_addr, five_tuple);
            a.id = self.next_id.fetch_add(1, Ordering::Relaxed);
            a.scheduler = Some(self.scheduler.clone());
            a.relay_event_notify = self.relay_event_notify.clone();
            a.alloc_close_notify = self.alloc_close_notify.clone();
            a.close_notify = self.close_notify.child_token();

            log::debug!(
                "listening on relay addr: {:?} for {}",
                a.relay_addr,
                five_tuple
            );

            let a = Arc::new(a);
            self.scheduler.schedule(a.lifetime_deadline(), lifetime);
            state.allocations.insert(fingerprint, Arc::clone(&a));
            a
        };

        a.start();

        Ok(a)
    }

    /// Removes an [`Allocation`].
    pub async fn delete_allocation(&self, five_tuple: &FiveTuple) {
        let removed = {
            let mut state = self.state.write().await;
            self.remove_allocation(&mut state, five_tuple, None)
        };

        if let Some(a) = removed {
            if let Err(err) = a.close().await {
                log::error!("Failed to close allocation: {}", err);
            }
        }
    }

    /// Removes the allocation registered under `five_tuple`. With `id` set,
    /// only removes it when it is that exact allocation.
    fn remove_allocation(
        &self,
        state: &mut ManagerState,
        five_tuple: &FiveTuple,
        id: Option<u64>,
    ) -> Option<Arc<Allocation>> {
        let fingerprint = five_tuple.fingerprint();
        match (state.allocations.get(&fingerprint), id) {
            (None, _) => return None,
            (Some(a), Some(id)) if a.id != id => return None,
            _ => {}
        }

        let a = state.allocations.remove(&fingerprint)?;
        for cid in state.forget_connections_of(&a) {
            self.scheduler.cancel(Deadline::ConnectionClaim(cid));
        }
        self.scheduler.cancel(a.lifetime_deadline());

        Some(a)
    }

    /// Stores the reservation for the token+port.
    pub async fn create_reservation(&self, reservation_token: String, port: u16) {
        let mut state = self.state.write().await;
        if state.closed || state.reservations.contains_key(&reservation_token) {
            return;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.scheduler.schedule(
            Deadline::Reservation {
                token: reservation_token.clone(),
                id,
            },
            RESERVATION_LIFETIME,
        );
        state
            .reservations
            .insert(reservation_token, Reservation { port, id });
    }

    /// Returns the port for a given reservation if it exists.
    pub async fn get_reservation(&self, reservation_token: &str) -> Option<u16> {
        let state = self.state.read().await;
        state.reservations.get(reservation_token).map(|r| r.port)
    }

    /// Claims the reservation for `reservation_token`, removing it.
    pub async fn take_reservation(&self, reservation_token: &str) -> Option<u16> {
        let mut state = self.state.write().await;
        let reservation = state.reservations.remove(reservation_token)?;
        self.scheduler.cancel(Deadline::Reservation {
            token: reservation_token.to_owned(),
            id: reservation.id,
        });

        Some(reservation.port)
    }

    /// Returns a random un-allocated even udp4 port. The port is released
    /// before returning.
    pub async fn get_random_even_port(&self) -> Result<u16> {
        loop {
            let (conn, addr) = self.relay_addr_generator.allocate_conn(true, 0).await?;
            if let Err(err) = conn.close().await {
                log::debug!("failed to release candidate port {}: {}", addr.port(), err);
            }
            drop(conn);

            if addr.port() % 2 == 0 {
                return Ok(addr.port());
            }
        }
    }

    /// Opens a connection from `a`'s relayed address to `peer` and returns
    /// its connection id. The id has to be claimed with
    /// [`Manager::bind_connection`] within [`CONNECTION_CLAIM_TIMEOUT`].
    pub async fn connect(&self, a: &Arc<Allocation>, peer: SocketAddr) -> Result<u32> {
        let cid = self.new_cid(a).await?;

        if let Err(err) = a.connect(cid, peer).await {
            let mut state = self.state.write().await;
            state.waiting_conns.remove(&cid);
            state.running_conns.remove(&cid);
            return Err(err);
        }

        self.scheduler
            .schedule(Deadline::ConnectionClaim(cid), CONNECTION_CLAIM_TIMEOUT);

        Ok(cid)
    }

    /// Draws a fresh connection id for `a` and registers it as waiting.
    pub(crate) async fn new_cid(&self, a: &Arc<Allocation>) -> Result<u32> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(Error::ErrManagerClosed);
        }

        loop {
            let cid = rand::random::<u32>();
            if cid == 0
                || state.waiting_conns.contains_key(&cid)
                || state.running_conns.contains_key(&cid)
            {
                continue;
            }

            state.waiting_conns.insert(cid, Arc::clone(a));
            return Ok(cid);
        }
    }

    /// Claims the waiting connection `cid`. Returns the peer connection to
    /// relay the client data connection to, or `None` when `cid` is unknown,
    /// expired or already claimed.
    pub async fn bind_connection(&self, cid: u32) -> Option<Arc<PeerConnection>> {
        let mut state = self.state.write().await;
        let a = state.waiting_conns.remove(&cid)?;
        self.scheduler.cancel(Deadline::ConnectionClaim(cid));

        let pc = a.get_connection(cid).await?;
        state.running_conns.insert(cid, a);
        log::debug!("connection {} to {} bound", cid, pc.peer_addr());

        Some(pc)
    }

    pub(crate) async fn handle_command(&self, command: Command) {
        match command {
            Command::PeerAccepted {
                five_tuple,
                allocation_id,
                peer,
                conn,
            } => {
                let a = self
                    .get_allocation(&five_tuple)
                    .await
                    .filter(|a| a.id == allocation_id);
                let a = match a {
                    Some(a) => a,
                    None => {
                        let _ = conn.close().await;
                        return;
                    }
                };

                let cid = match self.new_cid(&a).await {
                    Ok(cid) => cid,
                    Err(err) => {
                        log::debug!("dropping connection from {}: {}", peer, err);
                        let _ = conn.close().await;
                        return;
                    }
                };

                if let Err(err) = a.add_connection(cid, peer, conn).await {
                    log::debug!("dropping connection from {}: {}", peer, err);
                    self.state.write().await.waiting_conns.remove(&cid);
                    return;
                }
                self.scheduler
                    .schedule(Deadline::ConnectionClaim(cid), CONNECTION_CLAIM_TIMEOUT);

                if let Some(tx) = &self.relay_event_notify {
                    let event = RelayEvent::ConnectionAttempt {
                        five_tuple,
                        peer,
                        connection_id: cid,
                    };
                    if let Err(err) = tx.send(event).await {
                        log::error!("Failed to deliver connection attempt from {}: {}", peer, err);
                    }
                }
            }
            Command::ConnectionClosed(cid) => {
                let a = {
                    let mut state = self.state.write().await;
                    let running = state.running_conns.remove(&cid);
                    running.or_else(|| state.waiting_conns.remove(&cid))
                };
                if let Some(a) = a {
                    a.remove_connection(cid).await;
                }
            }
            Command::Schedule(..) | Command::Cancel(..) => {}
        }
    }

    pub(crate) async fn on_deadline(&self, deadline: Deadline) {
        match deadline {
            Deadline::Allocation { five_tuple, id } => {
                let removed = {
                    let mut state = self.state.write().await;
                    self.remove_allocation(&mut state, &five_tuple, Some(id))
                };

                if let Some(a) = removed {
                    log::trace!("allocation {} expired", five_tuple);
                    if let Err(err) = a.close().await {
                        log::error!("Failed to close allocation: {}", err);
                    }
                }
            }
            Deadline::Reservation { token, id } => {
                let mut state = self.state.write().await;
                if state.reservations.get(&token).map(|r| r.id) == Some(id) {
                    state.reservations.remove(&token);
                }
            }
            Deadline::ConnectionClaim(cid) => {
                let a = self.state.write().await.waiting_conns.remove(&cid);
                if let Some(a) = a {
                    log::debug!("connection {} was not bound in time", cid);
                    a.remove_connection(cid).await;
                }
            }
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.close_notify.cancel();
    }
}

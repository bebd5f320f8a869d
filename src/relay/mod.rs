pub mod relay_none;
pub mod relay_range;
pub mod relay_static;
pub mod tcp;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use util::conn::Listener;
use util::Conn;

use crate::error::*;

/// `RelayAddressGenerator` is used to generate a RelayAddress when creating an allocation.
/// You can use one of the provided ones or provide your own.
#[async_trait]
pub trait RelayAddressGenerator {
    /// Confirms that this is properly initialized
    fn validate(&self) -> Result<()>;

    /// Allocates a packet (UDP) relay endpoint.
    async fn allocate_conn(
        &self,
        use_ipv4: bool,
        requested_port: u16,
    ) -> Result<(Arc<dyn Conn + Send + Sync>, SocketAddr)>;

    /// Allocates a stream (TCP) relay listener. Generators that only relay
    /// packets keep the default, which disables RFC 6062 allocations.
    async fn allocate_listener(
        &self,
        _use_ipv4: bool,
        _requested_port: u16,
    ) -> Result<(Arc<dyn Listener + Send + Sync>, SocketAddr)> {
        Err(Error::ErrStreamRelayUnsupported)
    }
}

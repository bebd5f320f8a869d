#[cfg(test)]
mod relay_range_test;

use std::net::IpAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use super::tcp::TcpRelayListener;
use super::*;

const DEFAULT_MAX_RETRIES: u16 = 10;

/// `RelayAddressGeneratorRanges` can be used to only allocate connections inside a defined port range.
pub struct RelayAddressGeneratorRanges {
    /// `relay_address` is the IP returned to the user when the relay is created.
    pub relay_address: IpAddr,

    /// `min_port` the minimum port to allocate.
    pub min_port: u16,

    /// `max_port` the maximum (inclusive) port to allocate.
    pub max_port: u16,

    /// `max_retries` the amount of tries to allocate a random port in the defined range.
    /// Zero means 10.
    pub max_retries: u16,

    /// `address` is passed to Listen/ListenPacket when creating the Relay.
    pub address: String,
}

impl RelayAddressGeneratorRanges {
    fn candidate_ports(&self, requested_port: u16) -> Vec<u16> {
        if requested_port != 0 {
            return vec![requested_port];
        }

        let max_retries = if self.max_retries == 0 {
            DEFAULT_MAX_RETRIES
        } else {
            self.max_retries
        };

        (0..max_retries)
            .map(|_| rand::random_range(self.min_port..=self.max_port))
            .collect()
    }
}

#[async_trait]
impl RelayAddressGenerator for RelayAddressGeneratorRanges {
    fn validate(&self) -> Result<()> {
        if self.min_port == 0 {
            Err(Error::ErrMinPortNotZero)
        } else if self.max_port == 0 {
            Err(Error::ErrMaxPortNotZero)
        } else if self.max_port < self.min_port {
            Err(Error::ErrMaxPortLessThanMinPort)
        } else if self.address.is_empty() {
            Err(Error::ErrListeningAddressInvalid)
        } else {
            Ok(())
        }
    }

    async fn allocate_conn(
        &self,
        _use_ipv4: bool,
        requested_port: u16,
    ) -> Result<(Arc<dyn Conn + Send + Sync>, SocketAddr)> {
        let explicit = requested_port != 0;
        for port in self.candidate_ports(requested_port) {
            let conn = match UdpSocket::bind(format!("{}:{}", self.address, port)).await {
                Ok(conn) => conn,
                Err(err) if explicit => return Err(err.into()),
                Err(_) => continue,
            };

            let mut relay_addr = conn.local_addr()?;
            relay_addr.set_ip(self.relay_address);
            return Ok((Arc::new(conn), relay_addr));
        }

        Err(Error::ErrMaxRetriesExceeded)
    }

    async fn allocate_listener(
        &self,
        _use_ipv4: bool,
        requested_port: u16,
    ) -> Result<(Arc<dyn Listener + Send + Sync>, SocketAddr)> {
        let explicit = requested_port != 0;
        for port in self.candidate_ports(requested_port) {
            let addr = format!("{}:{}", self.address, port);
            let listener = match TcpRelayListener::bind(addr).await {
                Ok(listener) => listener,
                Err(err) if explicit => return Err(err),
                Err(_) => continue,
            };

            let mut relay_addr = listener.local_addr();
            relay_addr.set_ip(self.relay_address);
            return Ok((Arc::new(listener), relay_addr));
        }

        Err(Error::ErrMaxRetriesExceeded)
    }
}

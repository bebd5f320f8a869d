#[cfg(test)]
mod five_tuple_test;

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

use crate::error::*;
use crate::proto::*;

/// `FiveTuple` is the combination (client IP address and port, server IP
/// address and port, and transport protocol (currently one of UDP,
/// TCP, or TLS)) used to communicate between the client and the
/// server.  The 5-tuple uniquely identifies this communication
/// stream.  The 5-tuple also uniquely identifies the Allocation on
/// the server.
#[derive(PartialEq, Eq, Clone, Copy, Hash)]
pub struct FiveTuple {
    pub protocol: Protocol,
    pub src_addr: SocketAddr,
    pub dst_addr: SocketAddr,
}

impl Default for FiveTuple {
    fn default() -> Self {
        FiveTuple {
            protocol: PROTO_UDP,
            src_addr: SocketAddr::new(Ipv4Addr::new(0, 0, 0, 0).into(), 0),
            dst_addr: SocketAddr::new(Ipv4Addr::new(0, 0, 0, 0).into(), 0),
        }
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.protocol, self.src_addr, self.dst_addr)
    }
}

impl fmt::Debug for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiveTuple")
            .field("protocol", &self.protocol)
            .field("src_addr", &self.src_addr)
            .field("dst_addr", &self.dst_addr)
            .finish()
    }
}

impl FiveTuple {
    /// Returns the identity of this [`FiveTuple`], used to key the allocation
    /// directory. IPv6 addresses are bracketed by their `Display` form, so the
    /// `_` separator can never be confused with address text.
    pub fn fingerprint(&self) -> String {
        self.to_string()
    }

    /// Checks that both addresses are set. An address is unset when it is the
    /// unspecified IP with port 0.
    pub fn validate(&self) -> Result<()> {
        if is_unset(&self.src_addr) {
            Err(Error::ErrNilFiveTupleSrcAddr)
        } else if is_unset(&self.dst_addr) {
            Err(Error::ErrNilFiveTupleDstAddr)
        } else {
            Ok(())
        }
    }
}

fn is_unset(addr: &SocketAddr) -> bool {
    addr.ip().is_unspecified() && addr.port() == 0
}

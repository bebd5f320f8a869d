use std::net::SocketAddr;

use tokio::time::{Duration, Instant};

pub(crate) const PERMISSION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// `Permission` represents a TURN permission. TURN permissions mimic the address-restricted
/// filtering mechanism of NATs that comply with [RFC4787].
///
/// https://tools.ietf.org/html/rfc5766#section-2.3
#[derive(Debug, Clone)]
pub struct Permission {
    pub(crate) addr: SocketAddr,
    expires_at: Instant,
}

impl Permission {
    /// Creates a new [`Permission`] valid for [`PERMISSION_TIMEOUT`].
    pub fn new(addr: SocketAddr) -> Self {
        Permission {
            addr,
            expires_at: Instant::now() + PERMISSION_TIMEOUT,
        }
    }

    pub(crate) fn refresh(&mut self, lifetime: Duration) {
        self.expires_at = Instant::now() + lifetime;
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

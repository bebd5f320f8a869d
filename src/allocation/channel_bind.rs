#[cfg(test)]
mod channel_bind_test;

use std::net::SocketAddr;

use tokio::time::{Duration, Instant};

use crate::proto::channum::*;

/// `ChannelBind` represents a TURN Channel.
///
/// https://tools.ietf.org/html/rfc5766#section-2.5.
#[derive(Debug, Clone)]
pub struct ChannelBind {
    pub(crate) peer: SocketAddr,
    pub(crate) number: ChannelNumber,
    expires_at: Option<Instant>,
}

impl ChannelBind {
    /// Creates a new [`ChannelBind`]. It starts counting down once added to
    /// an allocation.
    pub fn new(number: ChannelNumber, peer: SocketAddr) -> Self {
        ChannelBind {
            number,
            peer,
            expires_at: None,
        }
    }

    pub(crate) fn refresh(&mut self, lifetime: Duration) {
        self.expires_at = Some(Instant::now() + lifetime);
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(t) if t <= now)
    }
}

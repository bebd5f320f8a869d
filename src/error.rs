use std::{io, net};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("turn: RelayAddress must be valid IP to use RelayAddressGeneratorStatic")]
    ErrRelayAddressInvalid,
    #[error("turn: RelayAddressGenerator has invalid ListeningAddress")]
    ErrListeningAddressInvalid,
    #[error("turn: max retries exceeded")]
    ErrMaxRetriesExceeded,
    #[error("turn: MaxPort must be not 0")]
    ErrMaxPortNotZero,
    #[error("turn: MinPort must be not 0")]
    ErrMinPortNotZero,
    #[error("turn: MaxPort less than MinPort")]
    ErrMaxPortLessThanMinPort,
    #[error("turn: RelayAddressGenerator does not support connection-oriented relaying")]
    ErrStreamRelayUnsupported,
    #[error("use of closed network connection")]
    ErrClosed,
    #[error("allocation manager is closed")]
    ErrManagerClosed,
    #[error("allocation manager must be created inside a Tokio runtime")]
    ErrNoRuntime,
    #[error("allocations must not be created with an unset FiveTuple.src_addr")]
    ErrNilFiveTupleSrcAddr,
    #[error("allocations must not be created with an unset FiveTuple.dst_addr")]
    ErrNilFiveTupleDstAddr,
    #[error("allocations must not be created with a lifetime of 0")]
    ErrLifetimeZero,
    #[error("allocations can only relay over UDP or TCP")]
    ErrUnsupportedRelayProtocol,
    #[error("allocation attempt created with duplicate FiveTuple")]
    ErrDupeFiveTuple,
    #[error("operation requires a packet relay")]
    ErrNotPacketRelay,
    #[error("operation requires a stream relay")]
    ErrNotStreamRelay,
    #[error("unable to relay to peer, no permission added")]
    ErrNoPermission,
    #[error("no such channel bind")]
    ErrNoSuchChannelBind,
    #[error("you cannot use the same channel number with different peer")]
    ErrSameChannelDifferentPeer,
    #[error("channel number not in [0x4000, 0x7FFF]")]
    ErrInvalidChannelNumber,
    #[error("error code 446: connection already exists")]
    ErrConnectionAlreadyExists,
    #[error("error code 447: connection timeout or failure")]
    ErrConnectionTimeoutOrFailure,
    #[error("connection is already bound")]
    ErrConnectionAlreadyBound,
    #[error("packet write smaller than packet")]
    ErrShortWrite,
    #[error("failed to close allocations: {}", flatten_msgs(.0))]
    ErrCloseAllocations(Vec<Error>),
    #[error("parse addr: {0}")]
    ParseIp(#[from] net::AddrParseError),
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("{0}")]
    Util(#[from] util::Error),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}

/// flatten_errs folds the failures of a batch operation into one error.
pub fn flatten_errs(errs: Vec<Error>) -> Result<()> {
    if errs.is_empty() {
        Ok(())
    } else {
        Err(Error::ErrCloseAllocations(errs))
    }
}

fn flatten_msgs(errs: &[Error]) -> String {
    let errs_strs: Vec<String> = errs.iter().map(|e| e.to_string()).collect();
    errs_strs.join("\n")
}

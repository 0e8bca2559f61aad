use std::io;
use thiserror::Error;

/// Errors decoding packet or sample headers.
///
/// `Truncated` is not an error in the usual sense: it means that more bytes are needed before
///  the header can be decoded, and the caller is expected to wait for more input. `Malformed` is
///  fatal for the connection that delivered the bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed header: {0}")]
    Malformed(String),
    #[error("truncated header - more bytes required")]
    Truncated,
}

/// Connection-fatal conditions on the receive path
#[derive(Error, Debug)]
pub enum ReceiveError {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("I/O error on connection: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("receive buffer management corrupted: {0}")]
    Corrupted(&'static str),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReservationError {
    /// The association exists already. This happens with re-sent acknowledgements and is not
    ///  harmful.
    #[error("association is already reserved")]
    AlreadyReserved,
    /// The second half of a reservation failed, and the first half was rolled back
    #[error("reservation failed and was rolled back")]
    Rollback,
    #[error("link is shut down")]
    LinkShutDown,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid sequence range {low}..={high}")]
pub struct InvalidRange {
    pub low: u64,
    pub high: u64,
}

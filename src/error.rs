//! The error types used by all parts of the engine.

use crate::PieceIndex;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The crate-wide error type.
///
/// Session-level variants (`BadHandshake`, `ProtocolViolation`,
/// `PeerDisconnected`) are contained by the supervisor: they tear down the
/// offending session and nothing else. IO errors are fatal to the engine.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The metainfo file (or other bencoded input) could not be decoded, or
    /// violated canonical form.
    #[error("malformed metainfo: {0}")]
    MalformedMetainfo(String),

    /// The remote's handshake was not a valid BitTorrent v1 handshake or
    /// advertised an info hash we don't serve.
    #[error("bad handshake")]
    BadHandshake,

    /// The remote sent a frame that violates the message protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// The remote closed the connection, possibly mid-frame.
    #[error("peer disconnected")]
    PeerDisconnected,

    /// The remote turned out to be ourselves; closed silently and never
    /// redialed.
    #[error("connected to self")]
    SelfConnection,

    /// A block was requested from a piece that is not complete locally.
    #[error("piece {0} not available")]
    PieceNotAvailable(PieceIndex),

    /// A block reference escapes its piece, or names an invalid piece.
    #[error("block out of range")]
    OutOfRange,

    /// The block is already reserved by another session.
    #[error("block already reserved")]
    AlreadyReserved,

    /// The tracker could not be reached or returned garbage. Recovered by
    /// retrying at the next announce interval.
    #[error("tracker unavailable: {0}")]
    TrackerUnavailable(String),

    /// The tracker answered with an explicit failure reason.
    #[error("tracker failure: {0}")]
    TrackerFailure(String),

    /// The piece store could not read or write the backing file. Fatal to
    /// the engine, unlike socket-level IO errors.
    #[error("disk error: {0}")]
    Disk(std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::TrackerUnavailable(e.to_string())
    }
}

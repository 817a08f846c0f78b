//! The error types used throughout the engine.
//!
//! Only bencoding, metainfo, and disk failures are fatal for a torrent; peer,
//! tracker, and DHT failures are recovered by the supervisor with bounded,
//! silent retries.

use crate::bencode::BencodeError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The input could not be decoded as bencoding.
    #[error("malformed bencoding: {0}")]
    Bencode(#[from] BencodeError),

    /// The metainfo decoded as bencoding but doesn't describe a valid torrent.
    #[error("malformed metainfo: {0}")]
    Metainfo(String),

    /// The tracker could not be reached or its response could not be decoded.
    #[error("tracker unreachable: {0}")]
    TrackerUnreachable(String),

    /// The tracker answered with a `failure reason`.
    #[error("tracker refused announce: {0}")]
    TrackerRefused(String),

    /// The peer's handshake advertised a different infohash than ours.
    #[error("peer handshake infohash mismatch")]
    HandshakeMismatch,

    /// The peer closed the connection before completing an exchange.
    #[error("peer closed the connection")]
    PeerDisconnected,

    /// The peer sent bytes that don't frame as protocol messages.
    #[error("peer protocol violation: {0}")]
    PeerProtocolViolation(String),

    /// The peer did not answer within the allotted time.
    #[error("peer timed out")]
    PeerTimeout,

    /// No DHT node answered during bootstrap; peer discovery failed.
    #[error("DHT bootstrap produced no nodes")]
    DhtBootstrap,

    /// Network level IO failure on a peer or DHT socket.
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure to create, pre-allocate, or write the download files. Fatal
    /// for the torrent.
    #[error("disk error: {0}")]
    Disk(#[source] std::io::Error),
}

impl Error {
    /// Returns true if the failure must take the whole torrent down rather
    /// than just the session that observed it.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Bencode(_) | Error::Metainfo(_) | Error::Disk(_)
        )
    }
}

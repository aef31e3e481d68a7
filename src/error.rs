use thiserror::Error;

use crate::bencoding::BencodeError;

pub type Result<T> = std::result::Result<T, Error>;

// every failure the client can hit, grouped by the stage that produced it.
// callers match on the variant to decide whether another peer is worth a try.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed bencode: {0}")]
    MalformedInput(#[from] BencodeError),

    #[error("invalid torrent descriptor: {0}")]
    InvalidTorrentDescriptor(String),

    #[error("tracker unreachable: {0}")]
    TrackerUnreachable(#[source] reqwest::Error),

    #[error("tracker protocol error: {0}")]
    TrackerProtocolError(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("unexpected message: expected {expected}, got id {got}")]
    UnexpectedMessage { expected: &'static str, got: u8 },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("piece {index} failed hash verification")]
    PieceHashMismatch { index: usize },

    #[error("peer timed out")]
    PeerTimeout,

    #[error("piece index {index} out of range (torrent has {count} pieces)")]
    InvalidPieceIndex { index: usize, count: usize },

    #[error("tracker returned no peers")]
    NoPeers,

    // a call made out of order on our side, never the remote peer's doing
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    // failures that belong to one peer connection rather than to the piece
    // itself. these are worth retrying against a different peer.
    pub fn is_peer_failure(&self) -> bool {
        matches!(
            self,
            Error::PeerTimeout
                | Error::Io(_)
                | Error::HandshakeFailed(_)
                | Error::UnexpectedMessage { .. }
                | Error::InvalidMessage(_)
        )
    }
}

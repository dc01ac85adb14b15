//! The error type shared by all parts of the engine.
//!
//! The scheduler discriminates failures by blast radius: transient errors
//! requeue the piece but keep the peer in rotation, hard errors additionally
//! close the session and hand the peer back to the connection watcher.

use thiserror::Error;

use crate::PieceIndex;

/// The result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The handshake's protocol string length byte was zero or the handshake
    /// was otherwise malformed.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The info hash returned in the peer's handshake doesn't match the info
    /// hash of the torrent we announced.
    #[error("unexpected info hash in handshake")]
    UnexpectedInfoHash,

    /// The first message after the handshake was not a bitfield. Without a
    /// bitfield the peer has nothing we could download, so the session is
    /// dropped.
    #[error("peer did not send a bitfield")]
    MissingBitfield,

    /// The peer sent a keep-alive in the middle of a piece transfer. The
    /// piece is requeued but the peer stays in rotation.
    #[error("received keep alive message")]
    KeepAliveDuringTransfer,

    /// The peer sent a message id that is unknown or not valid in the current
    /// session state.
    #[error("received unexpected message ID")]
    UnexpectedMessageId,

    /// A message payload was too short or its block didn't fit in the piece.
    #[error("invalid message payload")]
    InvalidMessage,

    /// A piece message carried a different index than the one requested.
    #[error("expected piece index {expected}, got {got}")]
    UnexpectedPiece {
        expected: PieceIndex,
        got: PieceIndex,
    },

    /// The downloaded piece's SHA-1 digest doesn't match the digest in the
    /// metainfo.
    #[error("failed integrity check")]
    FailedIntegrityCheck,

    /// A socket operation did not complete within its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The metainfo describes multiple files, which this client doesn't
    /// support.
    #[error("multi-file torrents are not supported")]
    MultiFileTorrent,

    /// The metainfo's pieces string is not a multiple of the SHA-1 digest
    /// length.
    #[error("malformed piece hashes of length {0}")]
    MalformedPieceHashes(usize),

    /// The piece index is not within the bounds of the torrent.
    #[error("invalid piece index {0}")]
    InvalidPieceIndex(PieceIndex),

    /// The number of piece hashes doesn't cover the download length.
    #[error("piece count {0} does not match the download length")]
    PieceCountMismatch(usize),

    /// The tracker URL could not be parsed or announces over a protocol we
    /// don't speak.
    #[error("unsupported tracker URL {0}")]
    UnsupportedTrackerUrl(String),

    /// The tracker answered but its response could not be used.
    #[error("tracker error: {0}")]
    Tracker(String),

    /// An internal channel was closed while the engine was still running.
    #[error("engine shut down")]
    Shutdown,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Bencode(#[from] serde_bencode::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Returns true if the failure only invalidates the current piece
    /// attempt, not the peer connection it happened on.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::KeepAliveDuringTransfer
                | Error::UnexpectedMessageId
                | Error::UnexpectedPiece { .. }
                | Error::FailedIntegrityCheck
                | Error::Timeout
        )
    }
}

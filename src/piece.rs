use sha1::{Digest, Sha1};

use crate::{
    error::{Error, Result},
    PieceIndex, Sha1Hash,
};

/// A single piece of the torrent while it is being downloaded.
///
/// The buffer is absent until a download attempt begins; the session
/// allocates it to the piece's length and fills it block by block. A piece is
/// only considered valid once its buffer hashes to the expected digest.
#[derive(Debug)]
pub(crate) struct Piece {
    /// The piece's zero-based index within the torrent.
    pub index: PieceIndex,
    /// The expected SHA-1 digest of the whole piece, from the metainfo.
    pub expected_hash: Sha1Hash,
    /// The length of the piece, in bytes.
    pub len: u32,
    /// The download buffer. `None` until a session starts downloading the
    /// piece; cleared again when the piece is requeued after a failure.
    pub buf: Option<Vec<u8>>,
}

impl Piece {
    pub fn new(index: PieceIndex, expected_hash: Sha1Hash, len: u32) -> Self {
        Self {
            index,
            expected_hash,
            len,
            buf: None,
        }
    }

    /// Allocates the piece's download buffer, discarding any bytes from an
    /// earlier attempt.
    pub fn allocate(&mut self) {
        self.buf = Some(vec![0; self.len as usize]);
    }

    /// Drops the buffer so a requeued piece starts its next attempt from
    /// scratch.
    pub fn clear(&mut self) {
        self.buf = None;
    }

    /// Copies a received block into the piece's buffer and returns the number
    /// of bytes copied.
    ///
    /// The block must lie entirely within the piece.
    pub fn apply_block(&mut self, begin: u32, data: &[u8]) -> Result<usize> {
        let buf = self.buf.as_mut().ok_or(Error::InvalidMessage)?;
        let begin = begin as usize;
        if begin >= buf.len() || begin + data.len() > buf.len() {
            return Err(Error::InvalidMessage);
        }
        buf[begin..begin + data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    /// Verifies the downloaded bytes against the expected digest.
    pub fn check_integrity(&self) -> Result<()> {
        let buf = self.buf.as_deref().unwrap_or_default();
        let digest = Sha1::digest(buf);
        if digest.as_slice() == self.expected_hash {
            Ok(())
        } else {
            Err(Error::FailedIntegrityCheck)
        }
    }

    /// Takes the verified piece bytes out of the piece for persisting.
    pub fn take_buf(&mut self) -> Vec<u8> {
        self.buf.take().unwrap_or_default()
    }
}

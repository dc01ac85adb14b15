use std::path::PathBuf;

use crate::{
    error::{Error, Result},
    metainfo::Metainfo,
    PieceIndex,
};

/// Information about a torrent's storage details, such as the piece count and
/// length, download length, and the paths of the files backing the download.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of
    /// the piece length.
    pub last_piece_len: u32,
    /// The length of the downloaded file, in bytes.
    pub download_len: u64,
    /// The directory into which the file and its resume metadata are
    /// downloaded.
    pub download_dir: PathBuf,
    /// The name of the downloaded file within the download directory.
    pub name: String,
}

impl StorageInfo {
    /// Extracts storage related information from the torrent metainfo.
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Result<Self> {
        let piece_count = metainfo.piece_count();
        let download_len = metainfo.download_len()?;
        let piece_len = metainfo.info.piece_length as u32;
        let last_piece_len =
            download_len - piece_len as u64 * (piece_count - 1) as u64;
        let last_piece_len = last_piece_len as u32;

        Ok(Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir,
            name: metainfo.info.name.clone(),
        })
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index == self.piece_count - 1 {
            Ok(self.last_piece_len)
        } else if index < self.piece_count - 1 {
            Ok(self.piece_len)
        } else {
            log::error!("Piece {} is invalid for torrent: {:?}", index, self);
            Err(Error::InvalidPieceIndex(index))
        }
    }

    /// The byte offset of the piece within the downloaded file.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }

    /// The path of the downloaded file.
    pub fn download_path(&self) -> PathBuf {
        self.download_dir.join(&self.name)
    }

    /// The path of the resume metadata file kept next to the download.
    pub fn meta_path(&self) -> PathBuf {
        self.download_dir.join(format!("{}.meta", self.name))
    }
}

use sha1::{Digest, Sha1};

use crate::{
    error::{Error, Result},
    Sha1Hash,
};

/// The parsed .torrent metainfo.
///
/// Only the fields the download engine needs are decoded; everything else in
/// the file is ignored by serde.
#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub announce: Option<String>,
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
    pub info: Info,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Ok(serde_bencode::from_bytes(buf)?)
    }

    /// Computes the torrent's info hash by re-encoding the info dictionary
    /// and hashing the result.
    pub fn create_info_hash(&self) -> Result<Sha1Hash> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// The union of the primary announce URL and every URL in the announce
    /// tiers, sorted and deduplicated.
    pub fn announce_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self
            .announce
            .iter()
            .cloned()
            .chain(
                self.announce_list
                    .iter()
                    .flatten()
                    .flatten()
                    .cloned(),
            )
            .collect();
        urls.sort();
        urls.dedup();
        urls
    }

    /// The length of the downloaded file, in bytes.
    ///
    /// Fails for multi-file torrents, which this client doesn't support.
    pub fn download_len(&self) -> Result<u64> {
        if self.info.files.is_some() {
            return Err(Error::MultiFileTorrent);
        }
        self.info.length.ok_or(Error::MultiFileTorrent)
    }

    /// Splits the concatenated `pieces` string into 20 byte SHA-1 digests.
    pub fn piece_hashes(&self) -> Result<Vec<Sha1Hash>> {
        let buf = &self.info.pieces;
        if buf.len() % 20 != 0 {
            return Err(Error::MalformedPieceHashes(buf.len()));
        }
        let mut hashes = Vec::with_capacity(buf.len() / 20);
        for chunk in buf.chunks_exact(20) {
            let mut hash = [0; 20];
            hash.copy_from_slice(chunk);
            hashes.push(hash);
        }
        Ok(hashes)
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}

//! The engine driver: wires the components together and runs a download to
//! completion.

use std::sync::Arc;

use rand::Rng;

use crate::{
    conf::Conf,
    disk::Disk,
    error::{Error, Result},
    metainfo::Metainfo,
    registry::PeerRegistry,
    scheduler::Scheduler,
    storage_info::StorageInfo,
    tracker::TrackerPool,
    PeerId, Sha1Hash,
};

/// The torrent-wide facts every component needs: who we are and what we are
/// downloading.
pub(crate) struct SharedStatus {
    /// The SHA-1 hash of the torrent's bencoded info dictionary.
    pub info_hash: Sha1Hash,
    /// Our own peer id, freshly generated for every run.
    pub client_id: PeerId,
    /// The piece geometry and output paths of the download.
    pub storage: StorageInfo,
}

/// Downloads the torrent described by the metainfo into the configured
/// download directory, resuming any earlier partial download found there.
///
/// Returns once every piece has been verified and flushed to disk. The
/// absence of peers is not an error: the tracker pool keeps looking and the
/// scheduler waits for as long as it takes.
pub async fn download(conf: Conf, metainfo: Metainfo) -> Result<()> {
    let client_id = generate_client_id();
    let info_hash = metainfo.create_info_hash()?;
    log::info!(
        "Downloading torrent {} (info hash {})",
        metainfo.info.name,
        hex::encode(&info_hash)
    );

    let storage = StorageInfo::new(&metainfo, conf.download_dir.clone())?;
    let piece_hashes = metainfo.piece_hashes()?;
    let expected_piece_count = ((storage.download_len
        + storage.piece_len as u64
        - 1)
        / storage.piece_len as u64) as usize;
    if piece_hashes.len() != expected_piece_count {
        return Err(Error::PieceCountMismatch(piece_hashes.len()));
    }

    let conf = Arc::new(conf);
    let shared = Arc::new(SharedStatus {
        info_hash,
        client_id,
        storage: storage.clone(),
    });
    let disk = Arc::new(Disk::open(&storage)?);
    let registry = Arc::new(PeerRegistry::new());

    let pool = Arc::new(TrackerPool::new(
        metainfo.announce_urls(),
        Arc::clone(&shared),
        Arc::clone(&conf),
        Arc::clone(&registry),
    )?);
    let pool_task = tokio::spawn(Arc::clone(&pool).run());
    let watcher_task = tokio::spawn(Arc::clone(&pool).watch_unreachable());

    let mut scheduler = Scheduler::new(shared, conf, registry, disk);
    let result = scheduler.run(piece_hashes).await;

    // the pool and the watcher run forever by design
    pool_task.abort();
    watcher_task.abort();

    result
}

/// Generates the random 20 byte id this client announces itself with.
fn generate_client_id() -> PeerId {
    let mut client_id = [0; 20];
    rand::thread_rng().fill(&mut client_id[..]);
    client_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ids_are_random() {
        assert_ne!(generate_client_id(), generate_client_id());
    }
}

//! The resume store: the downloaded file itself plus the append-only `.meta`
//! journal that records which pieces already reached the disk.
//!
//! The journal holds one decimal piece index per line, in completion order,
//! which carries no meaning. A piece is only reported completed after both
//! its bytes and its journal line have been flushed, so a crash can never
//! leave the journal acknowledging a piece whose bytes were lost.

use std::{
    collections::HashSet,
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Seek, SeekFrom, Write},
    sync::Mutex,
};

use crate::{error::Result, storage_info::StorageInfo, PieceIndex};

/// The entity responsible for persisting verified pieces and remembering
/// them across restarts.
///
/// All IO here is synchronous; callers on the async runtime go through
/// [`Disk::write_piece`] inside `spawn_blocking`.
pub(crate) struct Disk {
    /// The downloaded file, opened for random access writes.
    output: Mutex<File>,
    /// The journal, opened in append mode.
    meta: Mutex<File>,
    /// The indices recorded in the journal.
    persisted: Mutex<HashSet<PieceIndex>>,
    piece_len: u32,
}

impl Disk {
    /// Opens (or creates) the download directory, the output file and the
    /// journal, and loads the set of already persisted pieces.
    pub fn open(storage: &StorageInfo) -> Result<Self> {
        fs::create_dir_all(&storage.download_dir)?;

        let output = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(storage.download_path())?;

        let meta_path = storage.meta_path();
        let meta = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&meta_path)?;

        let mut persisted = HashSet::new();
        for line in BufReader::new(&meta).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            match line.parse::<PieceIndex>() {
                Ok(index) => {
                    persisted.insert(index);
                }
                Err(_) => {
                    log::warn!(
                        "Skipping malformed resume entry {:?} in {:?}",
                        line,
                        meta_path
                    );
                }
            }
        }
        if !persisted.is_empty() {
            log::info!(
                "Resuming download, {} pieces already on disk",
                persisted.len()
            );
        }

        Ok(Self {
            output: Mutex::new(output),
            meta: Mutex::new(meta),
            persisted: Mutex::new(persisted),
            piece_len: storage.piece_len,
        })
    }

    /// Whether the piece's bytes are already on disk from an earlier run.
    pub fn is_persisted(&self, index: PieceIndex) -> bool {
        self.persisted.lock().unwrap().contains(&index)
    }

    pub fn persisted_count(&self) -> usize {
        self.persisted.lock().unwrap().len()
    }

    /// Writes a verified piece at its offset in the output file, then
    /// journals its index.
    ///
    /// The piece offset is always measured from the start of the file; the
    /// output is flushed before the journal line is written so the journal
    /// never gets ahead of the data.
    pub fn write_piece(&self, index: PieceIndex, data: &[u8]) -> Result<()> {
        {
            let mut output = self.output.lock().unwrap();
            output.seek(SeekFrom::Start(
                index as u64 * self.piece_len as u64,
            ))?;
            output.write_all(data)?;
            output.sync_data()?;
        }
        {
            let mut meta = self.meta.lock().unwrap();
            writeln!(meta, "{}", index)?;
            meta.sync_data()?;
        }
        self.persisted.lock().unwrap().insert(index);
        log::debug!("Persisted piece {} ({} bytes)", index, data.len());
        Ok(())
    }
}

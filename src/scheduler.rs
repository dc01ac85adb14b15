//! The piece scheduler: pairs outstanding pieces with idle peers and spawns
//! one short-lived download task per (peer, piece) unit.
//!
//! The scheduler owns two queues with channel semantics: the outstanding
//! piece queue (FIFO, requeued pieces go to the tail) and, through the
//! registry, the available peer pool. At any moment every piece index is in
//! exactly one of the outstanding queue, an in-flight download task, or the
//! completed set. A piece only enters the completed set after its bytes
//! passed the integrity check and were flushed by the resume store.

use std::{collections::HashSet, sync::Arc, time::Duration};

use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task, time,
};

use crate::{
    conf::Conf,
    disk::Disk,
    engine::SharedStatus,
    error::{Error, Result},
    piece::Piece,
    registry::{PeerHandle, PeerRegistry},
    PieceIndex, Sha1Hash,
};

/// How long the scheduler sleeps when it has nothing to hand out, before
/// looking at its queues again.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What download tasks report back to the scheduler's main loop.
enum Event {
    /// The piece was verified and persisted.
    Completed(PieceIndex),
    /// The engine cannot continue (disk failure).
    Fatal(Error),
}

pub(crate) struct Scheduler {
    shared: Arc<SharedStatus>,
    conf: Arc<Conf>,
    registry: Arc<PeerRegistry>,
    disk: Arc<Disk>,
    outstanding_tx: UnboundedSender<Piece>,
    outstanding_rx: UnboundedReceiver<Piece>,
    events_tx: UnboundedSender<Event>,
    events_rx: UnboundedReceiver<Event>,
    completed: HashSet<PieceIndex>,
}

impl Scheduler {
    pub fn new(
        shared: Arc<SharedStatus>,
        conf: Arc<Conf>,
        registry: Arc<PeerRegistry>,
        disk: Arc<Disk>,
    ) -> Self {
        let (outstanding_tx, outstanding_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            shared,
            conf,
            registry,
            disk,
            outstanding_tx,
            outstanding_rx,
            events_tx,
            events_rx,
            completed: HashSet::new(),
        }
    }

    /// Seeds the outstanding queue from the metainfo and the resume store,
    /// then runs until every piece is completed.
    pub async fn run(&mut self, piece_hashes: Vec<Sha1Hash>) -> Result<()> {
        let piece_count = self.shared.storage.piece_count;
        for (index, hash) in piece_hashes.into_iter().enumerate() {
            if self.disk.is_persisted(index) {
                self.completed.insert(index);
            } else {
                let len = self.shared.storage.piece_len(index)?;
                self.outstanding_tx
                    .send(Piece::new(index, hash, len))
                    .map_err(|_| Error::Shutdown)?;
            }
        }
        log::info!(
            "Starting download of {} pieces ({} already on disk)",
            piece_count,
            self.completed.len()
        );

        while self.completed.len() < piece_count {
            self.drain_events()?;
            if self.completed.len() == piece_count {
                break;
            }
            // pop the next outstanding piece, waking up periodically to
            // notice completions reported by the download tasks
            let piece = match time::timeout(
                POLL_INTERVAL,
                self.outstanding_rx.recv(),
            )
            .await
            {
                Ok(Some(piece)) => piece,
                // the scheduler holds its own sender, so the queue can only
                // close when the engine is torn down
                Ok(None) => return Err(Error::Shutdown),
                Err(_) => continue,
            };
            self.dispatch(piece).await?;
        }

        log::info!("Download complete, all {} pieces verified", piece_count);
        Ok(())
    }

    /// Hands the piece to an idle peer that advertises it, or requeues it if
    /// the idle peers all lack it.
    async fn dispatch(&mut self, piece: Piece) -> Result<()> {
        let handle = match self.select_peer(piece.index).await? {
            Some(handle) => handle,
            None => {
                // every idle peer lacks this piece right now; move it to
                // the back of the queue and let other pieces progress
                self.requeue(piece)?;
                time::sleep(POLL_INTERVAL).await;
                return Ok(());
            }
        };

        {
            let mut peer = handle.lock().await;
            // a peer that lost its session since it was pooled is
            // reconnected in place, as it may well be reachable again
            if !peer.is_connected() {
                if let Err(e) =
                    peer.connect(&self.shared, &self.conf).await
                {
                    log::warn!(
                        "Reconnecting to peer {} failed: {}",
                        peer.addr,
                        e
                    );
                    peer.connection_attempts += 1;
                    let retire = peer.connection_attempts
                        >= self.conf.max_connection_attempts;
                    drop(peer);
                    if !retire {
                        self.registry.mark_unreachable(handle);
                    }
                    return self.requeue(piece);
                }
            }
            peer.pieces_in_flight += 1;
            debug_assert!(
                peer.pieces_in_flight <= self.conf.max_pipeline_per_peer
            );
            log::info!(
                "Assigned piece {} to peer {} ({}/{} completed, {} peers known)",
                piece.index,
                peer.addr,
                self.completed.len(),
                self.shared.storage.piece_count,
                self.registry.len(),
            );
        }

        task::spawn(download_task(
            Arc::clone(&self.conf),
            Arc::clone(&self.registry),
            Arc::clone(&self.disk),
            self.outstanding_tx.clone(),
            self.events_tx.clone(),
            handle,
            piece,
        ));
        Ok(())
    }

    /// Picks the most promising idle peer that advertises the piece.
    ///
    /// Blocks (cooperatively) while the available pool is empty: peers may
    /// yet arrive from the trackers, so running dry is never an error. If
    /// there are idle peers but none of them has the piece, `None` is
    /// returned so the caller can requeue and move on.
    async fn select_peer(
        &mut self,
        index: PieceIndex,
    ) -> Result<Option<PeerHandle>> {
        loop {
            self.drain_events()?;

            let mut examined = 0;
            let mut skipped = Vec::new();
            let mut selected = None;
            while let Some(handle) = self.registry.take_available() {
                examined += 1;
                let peer = handle.lock().await;
                let has_piece =
                    peer.bitfield.get(index).map(|b| *b).unwrap_or(false);
                let has_capacity = peer.pieces_in_flight
                    < self.conf.max_pipeline_per_peer;
                let pieces_downloaded = peer.pieces_downloaded;
                drop(peer);
                if has_piece && has_capacity {
                    selected = Some(handle);
                    break;
                }
                skipped.push((handle, pieces_downloaded));
            }
            // the examined-but-unsuitable peers stay available, in order
            for (handle, pieces_downloaded) in skipped {
                self.registry.make_available(handle, pieces_downloaded);
            }

            if selected.is_some() {
                return Ok(selected);
            }
            if examined > 0 {
                // idle peers exist but none can serve this piece
                return Ok(None);
            }
            time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Returns a piece to the tail of the outstanding queue for another
    /// attempt, discarding any partially downloaded bytes.
    fn requeue(&self, mut piece: Piece) -> Result<()> {
        piece.clear();
        self.outstanding_tx
            .send(piece)
            .map_err(|_| Error::Shutdown)
    }

    /// Applies everything the download tasks have reported since the last
    /// look at the event queue.
    fn drain_events(&mut self) -> Result<()> {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                Event::Completed(index) => {
                    self.completed.insert(index);
                    log::info!(
                        "Piece {} done, {}/{} completed, {} peers idle",
                        index,
                        self.completed.len(),
                        self.shared.storage.piece_count,
                        self.registry.available_count(),
                    );
                }
                Event::Fatal(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Downloads one piece from one peer, then routes the peer and the piece to
/// wherever they belong next. This task is responsible for returning the
/// peer on every path.
async fn download_task(
    conf: Arc<Conf>,
    registry: Arc<PeerRegistry>,
    disk: Arc<Disk>,
    outstanding_tx: UnboundedSender<Piece>,
    events_tx: UnboundedSender<Event>,
    handle: PeerHandle,
    mut piece: Piece,
) {
    let mut peer = handle.lock().await;
    let addr = peer.addr;

    let result = match peer.download(&mut piece, &conf).await {
        Ok(()) => piece.check_integrity(),
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => {
            let index = piece.index;
            let data = piece.take_buf();
            let disk = Arc::clone(&disk);
            // hashing already happened; the remaining sync file IO still
            // doesn't belong on the executor
            let written =
                task::spawn_blocking(move || disk.write_piece(index, &data))
                    .await
                    .expect("disk write task panicked");
            if let Err(e) = written {
                log::error!("Failed to persist piece {}: {}", index, e);
                let _ = events_tx.send(Event::Fatal(e));
                return;
            }

            peer.pieces_downloaded += 1;
            peer.pieces_in_flight =
                peer.pieces_in_flight.saturating_sub(1);
            let pieces_downloaded = peer.pieces_downloaded;
            match peer.announce_have(index).await {
                Ok(()) => {
                    drop(peer);
                    registry.make_available(handle, pieces_downloaded);
                }
                // the piece is safe on disk, but the transport just failed
                // under us, so the session is no good to the pool
                Err(e) => {
                    log::warn!(
                        "Failed to announce piece {} to peer {} ({}), \
                         dropping connection",
                        index,
                        addr,
                        e
                    );
                    peer.close();
                    drop(peer);
                    registry.mark_unreachable(handle);
                }
            }
            let _ = events_tx.send(Event::Completed(index));
        }
        Err(e) if e.is_transient() => {
            // the piece attempt is void but the connection is still good
            log::warn!(
                "Piece {} from peer {} failed ({}), requeueing",
                piece.index,
                addr,
                e
            );
            piece.clear();
            let _ = outstanding_tx.send(piece);
            peer.pieces_in_flight =
                peer.pieces_in_flight.saturating_sub(1);
            let pieces_downloaded = peer.pieces_downloaded;
            drop(peer);
            registry.make_available(handle, pieces_downloaded);
        }
        Err(e) => {
            log::warn!(
                "Peer {} session failed ({}), dropping connection",
                addr,
                e
            );
            piece.clear();
            let _ = outstanding_tx.send(piece);
            peer.close();
            drop(peer);
            registry.mark_unreachable(handle);
        }
    }
}

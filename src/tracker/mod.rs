//! The tracker pool: keeps asking every announce URL of the torrent for
//! peers and feeds newly discovered addresses into the peer registry.
//!
//! A single pool task visits each URL in order, sleeping between rounds; a
//! companion watcher task periodically retries peers whose connections
//! failed, until their retry budget runs out. Failures of individual
//! trackers are logged and skipped, they never stop the pool.

mod http;
mod udp;

use std::{net::SocketAddr, sync::Arc};

use tokio::time;
use url::Url;

use crate::{
    conf::Conf,
    engine::SharedStatus,
    error::{Error, Result},
    registry::{PeerHandle, PeerRegistry},
};

pub(crate) struct TrackerPool {
    /// The deduplicated announce URLs from the metainfo.
    urls: Vec<String>,
    shared: Arc<SharedStatus>,
    conf: Arc<Conf>,
    registry: Arc<PeerRegistry>,
    client: reqwest::Client,
}

impl TrackerPool {
    pub fn new(
        urls: Vec<String>,
        shared: Arc<SharedStatus>,
        conf: Arc<Conf>,
        registry: Arc<PeerRegistry>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(conf.tracker_timeout)
            .build()?;
        Ok(Self {
            urls,
            shared,
            conf,
            registry,
            client,
        })
    }

    /// Runs the announce loop forever. The engine aborts the task once the
    /// download completes.
    pub async fn run(self: Arc<Self>) {
        loop {
            for url in &self.urls {
                match self.announce(url).await {
                    Ok(peers) => self.merge_peers(peers),
                    Err(e) => {
                        log::warn!("Announce to {} failed: {}", url, e);
                    }
                }
            }
            time::sleep(self.conf.announce_interval).await;
        }
    }

    /// Runs the unreachable-peer retry loop forever.
    pub async fn watch_unreachable(self: Arc<Self>) {
        loop {
            time::sleep(self.conf.retry_interval).await;
            let parked = self.registry.drain_unreachable();
            if parked.is_empty() {
                continue;
            }
            log::debug!("Retrying {} unreachable peers", parked.len());
            for peer in parked {
                tokio::spawn(establish_session(
                    Arc::clone(&self.shared),
                    Arc::clone(&self.conf),
                    Arc::clone(&self.registry),
                    peer,
                ));
            }
        }
    }

    /// Queries a single tracker, picking the protocol by URL scheme.
    async fn announce(&self, announce_url: &str) -> Result<Vec<SocketAddr>> {
        let url = Url::parse(announce_url)
            .map_err(|_| Error::UnsupportedTrackerUrl(announce_url.into()))?;
        match url.scheme() {
            "http" | "https" => {
                http::announce(
                    &self.client,
                    announce_url,
                    &self.shared.info_hash,
                    &self.shared.client_id,
                    self.shared.storage.download_len,
                )
                .await
            }
            "udp" => {
                udp::announce(
                    announce_url,
                    &self.shared.info_hash,
                    &self.shared.client_id,
                    &self.conf,
                )
                .await
            }
            _ => Err(Error::UnsupportedTrackerUrl(announce_url.into())),
        }
    }

    /// Registers every address we haven't seen before and starts a session
    /// establishment task for it.
    fn merge_peers(&self, peers: Vec<SocketAddr>) {
        for addr in peers {
            if let Some(peer) = self.registry.register(addr) {
                log::info!("Tracker reported new peer {}", addr);
                tokio::spawn(establish_session(
                    Arc::clone(&self.shared),
                    Arc::clone(&self.conf),
                    Arc::clone(&self.registry),
                    peer,
                ));
            }
        }
    }
}

/// Connects to a peer and, on success, hands it to the available pool.
///
/// On failure the peer's attempt counter is bumped and the peer is parked
/// for the watcher, until its retry budget is spent.
pub(crate) async fn establish_session(
    shared: Arc<SharedStatus>,
    conf: Arc<Conf>,
    registry: Arc<PeerRegistry>,
    handle: PeerHandle,
) {
    let mut peer = handle.lock().await;
    match peer.connect(&shared, &conf).await {
        Ok(()) => {
            let pieces_downloaded = peer.pieces_downloaded;
            drop(peer);
            registry.make_available(handle, pieces_downloaded);
        }
        Err(e) => {
            peer.connection_attempts += 1;
            log::warn!(
                "Connecting to peer {} failed (attempt {}): {}",
                peer.addr,
                peer.connection_attempts,
                e
            );
            if peer.connection_attempts < conf.max_connection_attempts {
                drop(peer);
                registry.mark_unreachable(handle);
            } else {
                log::info!("Retiring peer {}", peer.addr);
            }
        }
    }
}

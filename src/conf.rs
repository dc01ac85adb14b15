//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

/// The port advertised to HTTP trackers. The client never actually listens
/// on it as inbound connections are not accepted.
pub const HTTP_ANNOUNCE_PORT: u16 = 6881;

/// The port advertised to UDP trackers.
pub const UDP_ANNOUNCE_PORT: u16 = 6969;

/// The global configuration for the download engine and all its parts.
///
/// The defaults mirror the behavior of a stock client; tests shrink the
/// intervals to keep wall-clock time down.
#[derive(Clone, Debug)]
pub struct Conf {
    /// The directory in which the downloaded file and its resume metadata
    /// are placed.
    pub download_dir: PathBuf,

    /// After this many failed connection attempts a peer is no longer
    /// retried.
    pub max_connection_attempts: u32,

    /// The number of pieces a single peer session may have in flight at
    /// a time.
    pub max_pipeline_per_peer: u32,

    /// How long to wait for the TCP connection to a peer to be established.
    pub connect_timeout: Duration,

    /// How long to wait for either side's half of the handshake.
    pub handshake_timeout: Duration,

    /// How long to wait for the peer's bitfield right after the handshake.
    pub bitfield_timeout: Duration,

    /// How long to wait for any single message while downloading a piece.
    pub request_timeout: Duration,

    /// The pause between two rounds of visiting every announce URL.
    pub announce_interval: Duration,

    /// The pause between two rounds of retrying unreachable peers.
    pub retry_interval: Duration,

    /// The overall deadline of one HTTP tracker announce.
    pub tracker_timeout: Duration,

    /// How long to wait for a UDP tracker's connect response.
    pub udp_connect_timeout: Duration,

    /// How long to wait for a UDP tracker's announce response.
    pub udp_announce_timeout: Duration,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            max_connection_attempts: 3,
            // mirrors the conservative one-piece-at-a-time pipeline of the
            // session implementation
            max_pipeline_per_peer: 1,
            connect_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(3),
            bitfield_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            announce_interval: Duration::from_secs(20),
            retry_interval: Duration::from_secs(30),
            tracker_timeout: Duration::from_secs(15),
            udp_connect_timeout: Duration::from_secs(3),
            udp_announce_timeout: Duration::from_secs(5),
        }
    }
}

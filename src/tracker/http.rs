//! The HTTP(S) announce protocol: a GET request with the client's identity
//! and progress in the query string, answered with a bencoded dictionary
//! carrying the compact peer list.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use serde_bytes::ByteBuf;

use crate::{
    conf::HTTP_ANNOUNCE_PORT,
    error::{Error, Result},
    PeerId, Sha1Hash,
};

/// The tracker's bencoded answer to an announce.
#[derive(Debug, Deserialize)]
struct TrackerResponse {
    /// How long the tracker would like us to wait between announces. The
    /// pool runs on its own cadence, so this is decoded but not acted upon.
    #[serde(default)]
    #[allow(dead_code)]
    interval: Option<u64>,
    /// Set instead of the peer list when the tracker rejects the announce.
    #[serde(default, rename = "failure reason")]
    failure_reason: Option<String>,
    /// The compact peer list: groups of 6 bytes, a 4-byte IPv4 address
    /// followed by a big endian port.
    #[serde(default)]
    peers: Option<ByteBuf>,
}

/// Announces to an HTTP tracker and returns the addresses of the peers in
/// its response.
///
/// The 20 raw bytes of the info hash and peer id cannot travel through a
/// regular string query, so the query is assembled by hand with each byte
/// percent-encoded.
pub(super) async fn announce(
    client: &reqwest::Client,
    announce_url: &str,
    info_hash: &Sha1Hash,
    peer_id: &PeerId,
    left: u64,
) -> Result<Vec<SocketAddr>> {
    let url = format!(
        "{}?info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&compact=1&left={}",
        announce_url,
        percent_encode(info_hash, NON_ALPHANUMERIC),
        percent_encode(peer_id, NON_ALPHANUMERIC),
        HTTP_ANNOUNCE_PORT,
        left,
    );
    log::debug!("Announcing to {}", announce_url);

    let body = client.get(&url).send().await?.bytes().await?;
    let response: TrackerResponse = serde_bencode::from_bytes(&body)?;

    if let Some(reason) = response.failure_reason {
        return Err(Error::Tracker(reason));
    }

    let peers = response.peers.unwrap_or_default();
    parse_compact_peers(&peers)
}

/// Splits a compact peer string into socket addresses.
pub(super) fn parse_compact_peers(raw: &[u8]) -> Result<Vec<SocketAddr>> {
    if raw.len() % 6 != 0 {
        return Err(Error::Tracker(format!(
            "compact peer list of length {} is not a multiple of 6",
            raw.len()
        )));
    }
    Ok(raw
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect())
}

//! The UDP announce protocol of BEP 15: a connect round trip to obtain a
//! connection id, then a single announce packet answered with the compact
//! peer list.

use std::net::SocketAddr;

use bytes::{Buf, BufMut};
use tokio::{net::UdpSocket, time::timeout};
use url::Url;

use crate::{
    conf::{Conf, UDP_ANNOUNCE_PORT},
    error::{Error, Result},
    PeerId, Sha1Hash,
};

use super::http::parse_compact_peers;

/// The magic constant identifying the BitTorrent UDP tracker protocol.
const PROTOCOL_ID: u64 = 0x0417_2710_1980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;

/// Announces to a UDP tracker and returns the addresses of the peers in its
/// response.
pub(super) async fn announce(
    announce_url: &str,
    info_hash: &Sha1Hash,
    peer_id: &PeerId,
    conf: &Conf,
) -> Result<Vec<SocketAddr>> {
    let url = Url::parse(announce_url)
        .map_err(|_| Error::UnsupportedTrackerUrl(announce_url.into()))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::UnsupportedTrackerUrl(announce_url.into()))?;
    let port = url
        .port()
        .ok_or_else(|| Error::UnsupportedTrackerUrl(announce_url.into()))?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect((host, port)).await?;
    log::debug!("Announcing to {}", announce_url);

    // drawn up front so the thread local rng is not held across awaits
    let transaction_id: u32 = rand::random();
    let key: u32 = rand::random();

    // connect round trip: 16 bytes out, 16 bytes back
    let mut connect_req = Vec::with_capacity(16);
    connect_req.put_u64(PROTOCOL_ID);
    connect_req.put_u32(ACTION_CONNECT);
    connect_req.put_u32(transaction_id);

    socket.send(&connect_req).await?;
    let mut connect_resp = [0; 16];
    let n = timeout(conf.udp_connect_timeout, socket.recv(&mut connect_resp))
        .await
        .map_err(|_| Error::Timeout)??;
    if n < 16 {
        return Err(Error::Tracker(format!(
            "connect response is {} bytes, wanted 16",
            n
        )));
    }
    let mut connect_resp = &connect_resp[..];
    let action = connect_resp.get_u32();
    let resp_transaction_id = connect_resp.get_u32();
    let connection_id = connect_resp.get_u64();
    if action != ACTION_CONNECT || resp_transaction_id != transaction_id {
        return Err(Error::Tracker(
            "connect response does not match the request".into(),
        ));
    }

    // the 98 byte announce packet
    let mut announce_req = Vec::with_capacity(98);
    announce_req.put_u64(connection_id);
    announce_req.put_u32(ACTION_ANNOUNCE);
    announce_req.put_u32(transaction_id);
    announce_req.extend_from_slice(info_hash);
    announce_req.extend_from_slice(peer_id);
    announce_req.put_u64(0); // downloaded
    announce_req.put_u64(0); // left
    announce_req.put_u64(0); // uploaded
    announce_req.put_u32(0); // event: none
    announce_req.put_u32(0); // IP address: default
    announce_req.put_u32(key); // for the tracker's statistics
    announce_req.put_i32(-1); // num_want: default
    announce_req.put_u16(UDP_ANNOUNCE_PORT);

    socket.send(&announce_req).await?;
    let mut announce_resp = [0; 4096];
    let n = timeout(
        conf.udp_announce_timeout,
        socket.recv(&mut announce_resp),
    )
    .await
    .map_err(|_| Error::Timeout)??;
    if n < 20 {
        return Err(Error::Tracker(format!(
            "announce response is {} bytes, wanted at least 20",
            n
        )));
    }

    // the header is action, transaction id, interval, leechers and seeders;
    // the compact peer list starts at byte 20
    parse_compact_peers(&announce_resp[20..n])
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A single-announce UDP tracker speaking just enough of BEP 15.
    async fn run_mock_tracker(
        socket: UdpSocket,
        peers: Vec<u8>,
    ) -> std::io::Result<()> {
        let mut buf = [0; 1024];

        let (n, from) = socket.recv_from(&mut buf).await?;
        assert_eq!(n, 16);
        let mut req = &buf[..n];
        assert_eq!(req.get_u64(), PROTOCOL_ID);
        assert_eq!(req.get_u32(), ACTION_CONNECT);
        let transaction_id = req.get_u32();

        let connection_id: u64 = 0x1234_5678_9abc_def0;
        let mut resp = Vec::with_capacity(16);
        resp.put_u32(ACTION_CONNECT);
        resp.put_u32(transaction_id);
        resp.put_u64(connection_id);
        socket.send_to(&resp, from).await?;

        let (n, from) = socket.recv_from(&mut buf).await?;
        assert_eq!(n, 98);
        let mut req = &buf[..n];
        assert_eq!(req.get_u64(), connection_id);
        assert_eq!(req.get_u32(), ACTION_ANNOUNCE);
        let transaction_id = req.get_u32();
        let mut info_hash = [0; 20];
        req.copy_to_slice(&mut info_hash);
        assert_eq!(info_hash, [0xaa; 20]);
        // peer id, progress, event, ip and key are not checked here
        let port = u16::from_be_bytes([buf[96], buf[97]]);
        assert_eq!(port, UDP_ANNOUNCE_PORT);

        let mut resp = Vec::new();
        resp.put_u32(ACTION_ANNOUNCE);
        resp.put_u32(transaction_id);
        resp.put_u32(1800); // interval
        resp.put_u32(1); // leechers
        resp.put_u32(1); // seeders
        resp.extend_from_slice(&peers);
        socket.send_to(&resp, from).await?;

        Ok(())
    }

    #[tokio::test]
    async fn test_udp_announce_round_trip() {
        let tracker = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tracker_addr = tracker.local_addr().unwrap();
        let tracker_task = tokio::spawn(run_mock_tracker(
            tracker,
            vec![127, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 9, 0x1a, 0xe2],
        ));

        let url = format!(
            "udp://{}:{}/announce",
            tracker_addr.ip(),
            tracker_addr.port()
        );
        let peers = announce(
            &url,
            &[0xaa; 20],
            &[0xbb; 20],
            &Conf::new("/tmp"),
        )
        .await
        .unwrap();

        assert_eq!(
            peers,
            vec![
                "127.0.0.1:6881".parse::<SocketAddr>().unwrap(),
                "10.0.0.9:6882".parse::<SocketAddr>().unwrap(),
            ]
        );
        tracker_task.await.unwrap().unwrap();
    }
}

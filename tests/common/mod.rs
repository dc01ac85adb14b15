//! An in-process BitTorrent seeder and tracker fixtures for the end-to-end
//! download scenarios.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use futures::{SinkExt, StreamExt};
use sha1::{Digest, Sha1};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, FramedParts};

use leechtorrent::{
    metainfo::{Info, Metainfo},
    peer::codec::{Handshake, HandshakeCodec, Message, PeerCodec},
    Bitfield, Sha1Hash,
};

/// How a mock seeder behaves towards the client under test.
#[derive(Clone)]
pub struct SeederConfig {
    pub info_hash: Sha1Hash,
    /// The full payload of the torrent; blocks are served out of this.
    pub data: Vec<u8>,
    /// The nominal piece length of the torrent.
    pub piece_len: u32,
    /// The piece indices this seeder advertises in its bitfield.
    pub have: Vec<usize>,
    /// Pieces whose first serve is corrupted, to exercise the integrity
    /// gate. Later serves of the same piece are correct.
    pub corrupt_first: HashSet<usize>,
    /// Send a choke and an unchoke between accepting the first request and
    /// serving the first block.
    pub choke_dance: bool,
    /// Skip the bitfield and open with an unchoke instead, which a
    /// conforming client must treat as a protocol violation.
    pub skip_bitfield: bool,
}

impl SeederConfig {
    pub fn new(info_hash: Sha1Hash, data: Vec<u8>, piece_len: u32) -> Self {
        let piece_count =
            (data.len() + piece_len as usize - 1) / piece_len as usize;
        Self {
            info_hash,
            data,
            piece_len,
            have: (0..piece_count).collect(),
            corrupt_first: HashSet::new(),
            choke_dance: false,
            skip_bitfield: false,
        }
    }

    fn piece_count(&self) -> usize {
        (self.data.len() + self.piece_len as usize - 1)
            / self.piece_len as usize
    }
}

/// What the client actually asked of a seeder, for assertions.
#[derive(Default)]
pub struct SeederStats {
    /// The number of block (piece) messages served.
    pub blocks_served: AtomicUsize,
    /// The distinct piece indices that appeared in requests.
    pub pieces_requested: Mutex<HashSet<usize>>,
    /// How many times each piece's download was started (first-block
    /// requests per piece).
    pub piece_attempts: Mutex<HashMap<usize, usize>>,
}

pub struct Seeder {
    pub addr: SocketAddr,
    pub stats: Arc<SeederStats>,
}

impl Seeder {
    /// Starts a seeder on an ephemeral port, serving every accepted
    /// connection according to the config.
    pub async fn spawn(config: SeederConfig) -> Seeder {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(SeederStats::default());

        let conn_stats = Arc::clone(&stats);
        tokio::spawn(async move {
            loop {
                let (socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                tokio::spawn(serve_connection(
                    socket,
                    config.clone(),
                    Arc::clone(&conn_stats),
                ));
            }
        });

        Seeder { addr, stats }
    }

    pub fn requested(&self) -> HashSet<usize> {
        self.stats.pieces_requested.lock().unwrap().clone()
    }

    pub fn attempts(&self, piece: usize) -> usize {
        self.stats
            .piece_attempts
            .lock()
            .unwrap()
            .get(&piece)
            .copied()
            .unwrap_or(0)
    }
}

async fn serve_connection(
    socket: TcpStream,
    config: SeederConfig,
    stats: Arc<SeederStats>,
) {
    let mut socket = Framed::new(socket, HandshakeCodec);

    // the client opens with its handshake
    let peer_handshake = match socket.next().await {
        Some(Ok(handshake)) => handshake,
        _ => return,
    };
    assert_eq!(peer_handshake.info_hash, config.info_hash);
    socket
        .send(Handshake::new(config.info_hash, *b"-lt-mock-seeder-0001"))
        .await
        .unwrap();

    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new::<Message>(old_parts.io, PeerCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    let mut socket = Framed::from_parts(new_parts);

    if config.skip_bitfield {
        // misbehave: the first message is not a bitfield
        let _ = socket.send(Message::Unchoke).await;
    } else {
        let mut bitfield = Bitfield::repeat(false, config.piece_count());
        for index in &config.have {
            bitfield.set(*index, true);
        }
        socket.send(Message::Bitfield(bitfield)).await.unwrap();
    }

    let mut choke_danced = false;
    while let Some(Ok(msg)) = socket.next().await {
        match msg {
            Message::Request(block) => {
                {
                    let mut requested =
                        stats.pieces_requested.lock().unwrap();
                    requested.insert(block.piece_index);
                }
                let attempt = {
                    let mut attempts =
                        stats.piece_attempts.lock().unwrap();
                    if block.offset == 0 {
                        *attempts.entry(block.piece_index).or_insert(0) += 1;
                    }
                    attempts.get(&block.piece_index).copied().unwrap_or(1)
                };

                if config.choke_dance && !choke_danced {
                    choke_danced = true;
                    socket.send(Message::Choke).await.unwrap();
                    socket.send(Message::Unchoke).await.unwrap();
                }

                let begin = block.piece_index * config.piece_len as usize
                    + block.offset as usize;
                let mut data = config.data
                    [begin..begin + block.len as usize]
                    .to_vec();
                if block.offset == 0
                    && attempt == 1
                    && config.corrupt_first.contains(&block.piece_index)
                {
                    for byte in &mut data {
                        *byte ^= 0xff;
                    }
                }

                stats.blocks_served.fetch_add(1, Ordering::SeqCst);
                socket
                    .send(Message::Block {
                        piece_index: block.piece_index,
                        offset: block.offset,
                        data,
                    })
                    .await
                    .unwrap();
            }
            // the client's unchoke/interested chatter and its have
            // announcements need no reaction
            _ => {}
        }
    }
}

/// Builds the info dictionary for a payload and returns it with its hash.
pub fn make_info(name: &str, piece_len: u32, data: &[u8]) -> (Info, Sha1Hash) {
    let mut pieces = Vec::new();
    for chunk in data.chunks(piece_len as usize) {
        pieces.extend_from_slice(&Sha1::digest(chunk));
    }
    let info = Info {
        name: name.into(),
        pieces,
        piece_length: piece_len as u64,
        length: Some(data.len() as u64),
        files: None,
        private: None,
    };
    let metainfo = Metainfo {
        announce: None,
        announce_list: None,
        info,
    };
    let info_hash = metainfo.create_info_hash().unwrap();
    (metainfo.info, info_hash)
}

/// A bencoded tracker response advertising the given peers in compact form.
pub fn tracker_body(addrs: &[SocketAddr]) -> Vec<u8> {
    let mut peers = Vec::with_capacity(addrs.len() * 6);
    for addr in addrs {
        match addr {
            SocketAddr::V4(addr) => {
                peers.extend_from_slice(&addr.ip().octets());
                peers.extend_from_slice(&addr.port().to_be_bytes());
            }
            SocketAddr::V6(_) => panic!("fixture peers are IPv4 only"),
        }
    }
    let mut body =
        format!("d8:intervali1800e5:peers{}:", peers.len()).into_bytes();
    body.extend_from_slice(&peers);
    body.push(b'e');
    body
}

/// A deterministic test payload that differs across pieces and blocks.
pub fn make_payload(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i % 251) as u8 ^ (i / 4096) as u8)
        .collect()
}

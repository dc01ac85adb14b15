//! The per-peer connection: the peer record the rest of the engine sees and
//! the session that owns the TCP transport.
//!
//! A session is strictly single threaded with respect to its transport: the
//! task that currently owns the peer is the only reader and writer. Since a
//! session downloads one piece at a time there is no multiplexing of piece
//! transfers on a single connection.

pub mod codec;

use std::{io, net::SocketAddr};

use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, time::timeout};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    block_count, block_len,
    conf::Conf,
    engine::SharedStatus,
    error::{Error, Result},
    piece::Piece,
    Bitfield, BlockInfo, PieceIndex, BLOCK_LEN,
};
use codec::{Handshake, HandshakeCodec, Message, PeerCodec};

/// The connection state of a peer, from the point of view of this client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PeerStatus {
    /// The peer has no live session (never connected, or its session was
    /// closed after a failure).
    Disconnected,
    /// The peer has a live session and is serving our requests.
    Connected,
    /// The peer has a live session but has choked us; requests will not be
    /// answered until it unchokes us again.
    Choked,
}

/// A peer as tracked by the registry.
///
/// Peers are created the first time a tracker reports their address and are
/// never removed; a peer that keeps failing simply stops being offered to
/// the scheduler. All fields are mutated only by the single task that
/// currently owns the peer.
#[derive(Debug)]
pub(crate) struct Peer {
    /// The advertised address the peer was dialed at. `host:port` is the
    /// peer's identity.
    pub addr: SocketAddr,
    pub status: PeerStatus,
    /// The peer's piece availability. Empty until its bitfield message
    /// arrives, replaced wholesale when it does, and updated by `Have`
    /// announcements afterwards.
    pub bitfield: Bitfield,
    /// The number of pieces currently being downloaded from the peer. Never
    /// exceeds the configured pipeline depth.
    pub pieces_in_flight: u32,
    /// The number of pieces the peer has served us that passed their
    /// integrity check. Used by the scheduler to prefer proven-fast peers.
    pub pieces_downloaded: u32,
    /// The number of times connecting to the peer has failed.
    pub connection_attempts: u32,
    session: Option<PeerSession>,
}

impl Peer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            status: PeerStatus::Disconnected,
            bitfield: Bitfield::new(),
            pieces_in_flight: 0,
            pieces_downloaded: 0,
            connection_attempts: 0,
            session: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some() && self.status != PeerStatus::Disconnected
    }

    /// Establishes a session with the peer: TCP connect, handshake, bitfield
    /// exchange, and the initial unchoke and interested messages.
    ///
    /// A no-op if the peer already has a live session.
    pub async fn connect(
        &mut self,
        shared: &SharedStatus,
        conf: &Conf,
    ) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let (session, bitfield) =
            PeerSession::outbound(self.addr, shared, conf).await?;
        self.bitfield = bitfield;
        self.session = Some(session);
        // the remote starts out choking us in theory, but like the wider
        // client ecosystem we only track the choke state once the peer
        // actually tells us about it
        self.status = PeerStatus::Connected;
        Ok(())
    }

    /// Downloads a single piece through the peer's session.
    ///
    /// The piece's buffer is (re)allocated here; on success it holds all
    /// `piece.len` bytes, still unverified.
    pub async fn download(
        &mut self,
        piece: &mut Piece,
        conf: &Conf,
    ) -> Result<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::Io(io::ErrorKind::NotConnected.into()))?;
        let result = session.download(piece, &mut self.bitfield, conf).await;
        self.status = if session.is_choked {
            PeerStatus::Choked
        } else {
            PeerStatus::Connected
        };
        result
    }

    /// Tells the peer that we acquired a complete, verified piece.
    pub async fn announce_have(&mut self, index: PieceIndex) -> Result<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::Io(io::ErrorKind::NotConnected.into()))?;
        session.socket.send(Message::Have { piece_index: index }).await
    }

    /// Drops the peer's session. The peer record itself is retained and may
    /// be reconnected later.
    pub fn close(&mut self) {
        self.session = None;
        self.status = PeerStatus::Disconnected;
        self.pieces_in_flight = 0;
    }
}

/// An established connection to a peer.
///
/// The session goes through the states dialing, handshaking, awaiting the
/// bitfield, and ready; afterwards it alternates between ready and
/// downloading until it is closed by a failure or by the engine finishing.
struct PeerSession {
    addr: SocketAddr,
    socket: Framed<TcpStream, PeerCodec>,
    /// Whether the remote is currently choking us. Block requests are still
    /// written while choked but replies only arrive after an unchoke.
    is_choked: bool,
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("addr", &self.addr)
            .field("is_choked", &self.is_choked)
            .finish()
    }
}

impl PeerSession {
    /// Creates a new outbound session with the peer at the given address.
    ///
    /// Performs the handshake, requires the peer's first message to be its
    /// bitfield, and announces our interest. The session only handles
    /// downloads, so a peer that doesn't open with a bitfield has nothing to
    /// offer us and the connection is dropped.
    async fn outbound(
        addr: SocketAddr,
        shared: &SharedStatus,
        conf: &Conf,
    ) -> Result<(Self, Bitfield)> {
        log::info!("Connecting to peer {}", addr);
        let socket = timeout(conf.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout)??;
        log::info!("Connected to peer {}", addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we have to send the first
        // handshake
        let handshake = Handshake::new(shared.info_hash, shared.client_id);
        log::info!("Sending handshake to peer {}", addr);
        timeout(conf.handshake_timeout, socket.send(handshake))
            .await
            .map_err(|_| Error::Timeout)??;

        // receive peer's handshake
        log::info!("Waiting for peer {} handshake", addr);
        let peer_handshake = timeout(conf.handshake_timeout, socket.next())
            .await
            .map_err(|_| Error::Timeout)?
            .ok_or_else(|| {
                Error::Io(io::ErrorKind::UnexpectedEof.into())
            })??;
        log::debug!("Peer {} handshake: {:?}", addr, peer_handshake);

        // verify that the advertised torrent info hash is the same as ours
        if peer_handshake.info_hash != shared.info_hash {
            log::warn!("Peer {} handshake invalid info hash", addr);
            return Err(Error::UnexpectedInfoHash);
        }

        // now that we have the handshake, we need to switch to the peer
        // message codec and keep the buffers of the original codec as they
        // may contain bytes of any message the peer sent after its handshake
        let old_parts = socket.into_parts();
        let mut new_parts =
            FramedParts::new::<Message>(old_parts.io, PeerCodec);
        // reuse buffers of previous codec
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let mut socket = Framed::from_parts(new_parts);

        // the availability exchange: the peer's first message must be its
        // bitfield
        log::info!("Waiting for peer {} bitfield", addr);
        let msg = timeout(conf.bitfield_timeout, socket.next())
            .await
            .map_err(|_| Error::Timeout)?
            .ok_or_else(|| {
                Error::Io(io::ErrorKind::UnexpectedEof.into())
            })??;
        let mut bitfield = match msg {
            Message::Bitfield(bitfield) => bitfield,
            msg => {
                log::warn!(
                    "Peer {} sent {:?} instead of its bitfield",
                    addr,
                    msg.id()
                );
                return Err(Error::MissingBitfield);
            }
        };
        // The bitfield raw data that is sent over the wire may be longer
        // than the logical pieces it represents, if the number of pieces in
        // torrent is not a multiple of 8. Therefore we need to slice off the
        // last part of the bitfield.
        bitfield.resize(shared.storage.piece_count, false);
        log::debug!(
            "Peer {} has {}/{} pieces",
            addr,
            bitfield.count_ones(),
            shared.storage.piece_count
        );

        socket.send(Message::Unchoke).await?;
        log::info!("Interested in peer {}", addr);
        socket.send(Message::Interested).await?;

        Ok((
            Self {
                addr,
                socket,
                is_choked: false,
            },
            bitfield,
        ))
    }

    /// Downloads the piece through the session, block by block.
    ///
    /// All of the piece's block requests are written up front; the session
    /// then reads messages until every block has arrived. Choke and unchoke
    /// flips and piece announcements are absorbed along the way, anything
    /// else ends the attempt with an error the scheduler classifies.
    async fn download(
        &mut self,
        piece: &mut Piece,
        bitfield: &mut Bitfield,
        conf: &Conf,
    ) -> Result<()> {
        log::info!(
            "Downloading piece {} ({} bytes) from peer {}",
            piece.index,
            piece.len,
            self.addr
        );
        piece.allocate();

        let mut received = 0;

        // all of the piece's block requests are pipelined up front; the
        // last block may be shorter than the canonical block length
        for index in 0..block_count(piece.len) {
            let block = BlockInfo {
                piece_index: piece.index,
                offset: index as u32 * BLOCK_LEN,
                len: block_len(piece.len, index),
            };
            log::trace!("Requesting {:?} from peer {}", block, self.addr);
            timeout(
                conf.request_timeout,
                self.socket.send(Message::Request(block)),
            )
            .await
            .map_err(|_| Error::Timeout)??;
        }

        while received < piece.len {
            let msg = timeout(conf.request_timeout, self.socket.next())
                .await
                .map_err(|_| Error::Timeout)?
                .ok_or_else(|| {
                    Error::Io(io::ErrorKind::UnexpectedEof.into())
                })??;
            match msg {
                Message::Choke => {
                    if !self.is_choked {
                        log::info!("Peer {} choked us", self.addr);
                        self.is_choked = true;
                    }
                }
                Message::Unchoke => {
                    if self.is_choked {
                        log::info!("Peer {} unchoked us", self.addr);
                        self.is_choked = false;
                    }
                }
                Message::Have { piece_index } => {
                    log::debug!(
                        "Peer {} announced piece {}",
                        self.addr,
                        piece_index
                    );
                    if piece_index < bitfield.len() {
                        bitfield.set(piece_index, true);
                    }
                }
                Message::Block {
                    piece_index,
                    offset,
                    data,
                } => {
                    if piece_index != piece.index {
                        return Err(Error::UnexpectedPiece {
                            expected: piece.index,
                            got: piece_index,
                        });
                    }
                    received += piece.apply_block(offset, &data)? as u32;
                    log::debug!(
                        "Piece {}: {}/{} bytes from peer {}",
                        piece.index,
                        received,
                        piece.len,
                        self.addr
                    );
                }
                Message::KeepAlive => {
                    return Err(Error::KeepAliveDuringTransfer);
                }
                msg => {
                    log::warn!(
                        "Peer {} sent unexpected message {:?} during transfer",
                        self.addr,
                        msg.id()
                    );
                    return Err(Error::UnexpectedMessageId);
                }
            }
        }

        Ok(())
    }
}

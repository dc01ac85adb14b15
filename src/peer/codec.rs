//! Framing for the two wire formats of the peer protocol: the fixed-length
//! handshake exchanged right after the TCP connect, and the length-prefixed
//! messages everything else is carried in.
//!
//! Both codecs are used with [`tokio_util::codec::Framed`]; the session
//! starts out framed with [`HandshakeCodec`] and swaps in [`PeerCodec`]
//! (keeping the read and write buffers) once the handshakes are exchanged.

use std::convert::TryFrom;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{Error, Result},
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

/// The protocol string of BitTorrent v1, sent in the handshake.
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The handshake is the fixed-length preamble of a peer connection:
/// `<pstrlen><pstr><reserved><info hash><peer id>`, 49 + |pstr| bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    /// The protocol string, whose length is the first byte on the wire.
    pub prot: Vec<u8>,
    /// Eight reserved bytes, all zero as no extensions are implemented.
    pub reserved: [u8; 8],
    /// The torrent's SHA-1 info hash.
    pub info_hash: Sha1Hash,
    /// The peer's arbitrary 20 byte id.
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates a new protocol version 1 handshake with the given hashes.
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        Self {
            prot: PROTOCOL_STRING.as_bytes().to_vec(),
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    /// The length of the handshake on the wire.
    pub fn len(&self) -> usize {
        1 + self.prot.len() + 8 + 20 + 20
    }
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<()> {
        buf.reserve(handshake.len());
        buf.put_u8(handshake.prot.len() as u8);
        buf.extend_from_slice(&handshake.prot);
        buf.extend_from_slice(&handshake.reserved);
        buf.extend_from_slice(&handshake.info_hash);
        buf.extend_from_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // the first byte is the length of the protocol string; a zero length
        // cannot be a valid handshake
        let prot_len = buf[0] as usize;
        if prot_len == 0 {
            return Err(Error::InvalidHandshake);
        }

        // the full handshake is the length byte and 48 + prot_len further
        // bytes
        let payload_len = prot_len + 48;
        if buf.len() < 1 + payload_len {
            buf.reserve(1 + payload_len - buf.len());
            return Ok(None);
        }
        buf.advance(1);

        let mut prot = vec![0; prot_len];
        buf.copy_to_slice(&mut prot);
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The id of a message is a single byte following the message's length
/// prefix. Keep-alives have no id, they are a bare zero length prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self> {
        match id {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            _ => Err(Error::UnexpectedMessageId),
        }
    }
}

/// A message in the peer protocol, after the handshake.
///
/// All messages are of the format `<length prefix><message id><payload>`,
/// with the length prefix a 4-byte big endian integer covering the id and
/// payload. A zero length prefix is a keep-alive, which is surfaced as its
/// own variant so callers never mistake it for a regular message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
}

impl Message {
    /// Returns the wire id of the message, if it has one (keep-alives don't).
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield(_) => Some(MessageId::Bitfield),
            Message::Request(_) => Some(MessageId::Request),
            Message::Block { .. } => Some(MessageId::Piece),
            Message::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

pub struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let payload = bitfield.into_vec();
                buf.put_u32(1 + payload.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(&payload);
            }
            Message::Request(block) => {
                buf.put_u32(1 + 12);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(1 + 8 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
            Message::Cancel(block) => {
                buf.put_u32(1 + 12);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let mut len_prefix = [0; 4];
        len_prefix.copy_from_slice(&buf[0..4]);
        let msg_len = u32::from_be_bytes(len_prefix) as usize;

        // a zero length prefix is a keep-alive, which has to be surfaced to
        // the session rather than silently skipped
        if msg_len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        if buf.len() < 4 + msg_len {
            // wait for the rest of the frame
            buf.reserve(4 + msg_len - buf.len());
            return Ok(None);
        }
        buf.advance(4);

        let id = MessageId::try_from(buf.get_u8())?;
        let payload_len = msg_len - 1;

        // a payload on a bare message would desync the frame stream
        if payload_len != 0
            && matches!(
                id,
                MessageId::Choke
                    | MessageId::Unchoke
                    | MessageId::Interested
                    | MessageId::NotInterested
            )
        {
            return Err(Error::InvalidMessage);
        }

        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                if payload_len != 4 {
                    return Err(Error::InvalidMessage);
                }
                Message::Have {
                    piece_index: buf.get_u32() as PieceIndex,
                }
            }
            MessageId::Bitfield => {
                let mut payload = vec![0; payload_len];
                buf.copy_to_slice(&mut payload);
                Message::Bitfield(Bitfield::from_vec(payload))
            }
            MessageId::Request => {
                if payload_len != 12 {
                    return Err(Error::InvalidMessage);
                }
                Message::Request(BlockInfo {
                    piece_index: buf.get_u32() as PieceIndex,
                    offset: buf.get_u32(),
                    len: buf.get_u32(),
                })
            }
            MessageId::Piece => {
                if payload_len < 8 {
                    return Err(Error::InvalidMessage);
                }
                let piece_index = buf.get_u32() as PieceIndex;
                let offset = buf.get_u32();
                let mut data = vec![0; payload_len - 8];
                buf.copy_to_slice(&mut data);
                Message::Block {
                    piece_index,
                    offset,
                    data,
                }
            }
            MessageId::Cancel => {
                if payload_len != 12 {
                    return Err(Error::InvalidMessage);
                }
                Message::Cancel(BlockInfo {
                    piece_index: buf.get_u32() as PieceIndex,
                    offset: buf.get_u32(),
                    len: buf.get_u32(),
                })
            }
        };

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode_all(codec: &mut PeerCodec, buf: &mut BytesMut) -> Vec<Message> {
        let mut msgs = Vec::new();
        while let Some(msg) = codec.decode(buf).unwrap() {
            msgs.push(msg);
        }
        msgs
    }

    #[test]
    fn test_handshake_encoding() {
        let mut buf = BytesMut::new();
        let handshake = Handshake::new([0xde; 20], [0xad; 20]);
        HandshakeCodec.encode(handshake, &mut buf).unwrap();

        assert_eq!(buf.len(), 68);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], PROTOCOL_STRING.as_bytes());
        assert_eq!(&buf[20..28], &[0; 8]);
        assert_eq!(&buf[28..48], &[0xde; 20]);
        assert_eq!(&buf[48..68], &[0xad; 20]);
    }

    #[test]
    fn test_handshake_decoding() {
        let mut buf = BytesMut::new();
        HandshakeCodec
            .encode(Handshake::new([1; 20], [2; 20]), &mut buf)
            .unwrap();

        let handshake = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(handshake.prot, PROTOCOL_STRING.as_bytes());
        assert_eq!(handshake.info_hash, [1; 20]);
        assert_eq!(handshake.peer_id, [2; 20]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_handshake_zero_protocol_len_is_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0; 68]);
        assert!(matches!(
            HandshakeCodec.decode(&mut buf),
            Err(Error::InvalidHandshake)
        ));
    }

    #[test]
    fn test_handshake_waits_for_full_preamble() {
        let mut full = BytesMut::new();
        HandshakeCodec
            .encode(Handshake::new([1; 20], [2; 20]), &mut full)
            .unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&full[..30]);
        assert!(HandshakeCodec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[30..]);
        assert!(HandshakeCodec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_keep_alive_is_distinct() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(
            PeerCodec.decode(&mut buf).unwrap(),
            Some(Message::KeepAlive)
        );
        // nothing more in the buffer: this must be "no frame yet", not
        // another keep-alive
        assert_eq!(PeerCodec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_request_wire_format() {
        let mut buf = BytesMut::new();
        PeerCodec
            .encode(
                Message::Request(BlockInfo {
                    piece_index: 1,
                    offset: 0x4000,
                    len: 0x4000,
                }),
                &mut buf,
            )
            .unwrap();

        assert_eq!(
            &buf[..],
            &[
                0, 0, 0, 13, // length
                6, // id
                0, 0, 0, 1, // piece index
                0, 0, 0x40, 0, // block offset
                0, 0, 0x40, 0, // block length
            ]
        );
    }

    #[test]
    fn test_block_roundtrip() {
        let mut buf = BytesMut::new();
        PeerCodec
            .encode(
                Message::Block {
                    piece_index: 3,
                    offset: 16384,
                    data: vec![0xfe; 100],
                },
                &mut buf,
            )
            .unwrap();

        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        match msg {
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                assert_eq!(piece_index, 3);
                assert_eq!(offset, 16384);
                assert_eq!(data, vec![0xfe; 100]);
            }
            other => panic!("expected block, got {:?}", other),
        }
    }

    #[test]
    fn test_bitfield_bit_order() {
        let mut buf = BytesMut::new();
        // bit 0 is the most significant bit of the first byte
        buf.extend_from_slice(&[0, 0, 0, 2, 5, 0b1010_0000]);

        match PeerCodec.decode(&mut buf).unwrap().unwrap() {
            Message::Bitfield(bitfield) => {
                assert!(bitfield[0]);
                assert!(!bitfield[1]);
                assert!(bitfield[2]);
                assert!(!bitfield[3]);
            }
            other => panic!("expected bitfield, got {:?}", other),
        }
    }

    #[test]
    fn test_partial_frame_is_buffered() {
        let mut full = BytesMut::new();
        PeerCodec
            .encode(
                Message::Block {
                    piece_index: 0,
                    offset: 0,
                    data: vec![1; 64],
                },
                &mut full,
            )
            .unwrap();

        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&full[..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[10..]);
        assert_eq!(decode_all(&mut codec, &mut buf).len(), 1);
    }

    #[test]
    fn test_unknown_id_is_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 1, 14]);
        assert!(matches!(
            PeerCodec.decode(&mut buf),
            Err(Error::UnexpectedMessageId)
        ));
    }
}

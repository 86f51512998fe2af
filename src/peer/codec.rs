//! The codecs of the peer wire protocol: the 68 byte handshake and the
//! length-prefixed messages that follow it.
//!
//! Fixed-shape messages (choke, unchoke, interested, not interested, have,
//! request, cancel) are plain enum variants and never touch the heap; only
//! bitfield and block payloads allocate.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Bitfield, BlockInfo, InfoHash, PeerId, PieceIndex};

/// The handshake protocol string of the BitTorrent wire protocol.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The handshake is 1 length prefix byte + 19 protocol string bytes
/// + 8 reserved bytes + 20 info hash bytes + 20 peer id bytes.
pub(crate) const HANDSHAKE_LEN: usize = 68;

/// Receive buffers are bounded; a peer announcing a frame larger than this
/// has its connection closed.
const MAX_FRAME_LEN: u32 = 2 * 1024 * 1024;

/// The handshake exchanged immediately after the TCP connection is
/// established.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    /// The protocol string, which must equal [`PROTOCOL_STRING`].
    pub prot: [u8; 19],
    /// Reserved extension bits, accepted as-is.
    pub reserved: [u8; 8],
    /// The torrent's 20 byte identifier.
    pub info_hash: InfoHash,
    /// The peer's arbitrary 20 byte id.
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates a new protocol version 1 handshake with the given info hash
    /// and peer id.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        buf.reserve(HANDSHAKE_LEN);
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
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // the protocol string length must be valid before we wait for the
        // rest of the handshake
        let prot_len = buf[0] as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid handshake protocol string length",
            ));
        }

        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }
        buf.advance(1);

        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid handshake protocol string",
            ));
        }

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

/// The ids of the messages of the peer wire protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = io::Error;

    fn try_from(id: u8) -> io::Result<Self> {
        use MessageId::*;
        match id {
            0 => Ok(Choke),
            1 => Ok(Unchoke),
            2 => Ok(Interested),
            3 => Ok(NotInterested),
            4 => Ok(Have),
            5 => Ok(Bitfield),
            6 => Ok(Request),
            7 => Ok(Block),
            8 => Ok(Cancel),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unknown message id",
            )),
        }
    }
}

/// A message of the peer wire protocol, after the handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    /// A zero length frame, sent to keep the connection open.
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: PieceIndex },
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
    /// The message's id, or `None` for keep-alives, which have no id.
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
            Message::Block { .. } => Some(MessageId::Block),
            Message::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> io::Result<()> {
        use Message::*;
        match msg {
            KeepAlive => {
                buf.put_u32(0);
            }
            Choke | Unchoke | Interested | NotInterested => {
                buf.put_u32(1);
                // the match above makes the id conversion infallible
                buf.put_u8(msg.id().unwrap() as u8);
            }
            Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Bitfield(bitfield) => {
                let data = bitfield.into_vec();
                buf.put_u32(1 + data.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(&data);
            }
            Request(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
            Cancel(block) => {
                buf.put_u32(13);
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
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }

        // peek at the length prefix without consuming it so that partial
        // frames stay in the buffer
        let mut prefix = [0; 4];
        prefix.copy_from_slice(&buf[..4]);
        let frame_len = u32::from_be_bytes(prefix);

        if frame_len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame exceeds the receive buffer bound",
            ));
        }

        if frame_len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        if buf.len() < 4 + frame_len as usize {
            // reserve so the transport reads the rest of the frame in fewer
            // syscalls
            buf.reserve(4 + frame_len as usize - buf.len());
            return Ok(None);
        }
        buf.advance(4);

        let id = MessageId::try_from(buf.get_u8())?;
        let payload_len = frame_len as usize - 1;

        let check_payload = |expected: usize| {
            if payload_len == expected {
                Ok(())
            } else {
                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "invalid message payload length",
                ))
            }
        };

        let msg = match id {
            MessageId::Choke => {
                check_payload(0)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                check_payload(0)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                check_payload(0)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                check_payload(0)?;
                Message::NotInterested
            }
            MessageId::Have => {
                check_payload(4)?;
                Message::Have {
                    piece_index: buf.get_u32() as PieceIndex,
                }
            }
            MessageId::Bitfield => {
                let mut data = vec![0; payload_len];
                buf.copy_to_slice(&mut data);
                Message::Bitfield(Bitfield::from_vec(data))
            }
            MessageId::Request => {
                check_payload(12)?;
                Message::Request(BlockInfo {
                    piece_index: buf.get_u32() as PieceIndex,
                    offset: buf.get_u32(),
                    len: buf.get_u32(),
                })
            }
            MessageId::Block => {
                if payload_len < 8 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "invalid block message length",
                    ));
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
                check_payload(12)?;
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

    fn encode(msg: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg, &mut buf).unwrap();
        buf
    }

    fn assert_roundtrip(msg: Message) {
        let mut buf = encode(msg.clone());
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty(), "frame must be consumed exactly");
    }

    #[test]
    fn test_handshake_roundtrip() {
        let handshake = Handshake::new([0xab; 20], *b"cbt-0000000000000000");
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);
        assert_eq!(buf[0], 0x13);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn test_handshake_invalid_protocol_string() {
        let handshake = Handshake::new([0; 20], [0; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        buf[3] = b'X';
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_message_roundtrips() {
        assert_roundtrip(Message::KeepAlive);
        assert_roundtrip(Message::Choke);
        assert_roundtrip(Message::Unchoke);
        assert_roundtrip(Message::Interested);
        assert_roundtrip(Message::NotInterested);
        assert_roundtrip(Message::Have { piece_index: 42 });
        assert_roundtrip(Message::Bitfield(Bitfield::from_vec(vec![
            0b1100_0000,
            0b0000_0001,
        ])));
        assert_roundtrip(Message::Request(BlockInfo {
            piece_index: 1,
            offset: 0x4000,
            len: 0x4000,
        }));
        assert_roundtrip(Message::Block {
            piece_index: 3,
            offset: 0x8000,
            data: (0u8..255).collect(),
        });
        assert_roundtrip(Message::Cancel(BlockInfo {
            piece_index: 1,
            offset: 0x4000,
            len: 0x4000,
        }));
    }

    #[test]
    fn test_wire_format_is_bit_exact() {
        let buf = encode(Message::Request(BlockInfo {
            piece_index: 1,
            offset: 2,
            len: 3,
        }));
        assert_eq!(
            &buf[..],
            &[
                0, 0, 0, 13, // length prefix
                6, // id
                0, 0, 0, 1, // piece index
                0, 0, 0, 2, // begin
                0, 0, 0, 3, // length
            ]
        );

        let buf = encode(Message::Have { piece_index: 0x0102_0304 });
        assert_eq!(&buf[..], &[0, 0, 0, 5, 4, 1, 2, 3, 4]);

        let buf = encode(Message::KeepAlive);
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_incremental_decode() {
        let full = encode(Message::Block {
            piece_index: 0,
            offset: 0,
            data: vec![0xaa; 64],
        });

        let mut buf = BytesMut::new();
        // feed the frame a few bytes at a time; no message may surface until
        // the frame is whole
        for chunk in full[..full.len() - 1].chunks(7) {
            buf.extend_from_slice(chunk);
            assert!(PeerCodec.decode(&mut buf).unwrap().is_none());
        }
        buf.extend_from_slice(&full[full.len() - 1..]);
        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(msg, Message::Block { .. }));
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_LEN + 1);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }
}

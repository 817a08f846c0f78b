//! The framing of the peer wire protocol: the 68 byte handshake and the
//! length prefixed messages that follow it.
//!
//! All multi-byte integers on the wire are big endian.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::Error, Bitfield, BlockInfo, PeerId, Sha1Hash};

/// The protocol string of the BitTorrent V1 handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The largest frame we accept. Larger than any legal message (a piece
/// message is 9 bytes of header plus a 16 KiB block; a bitfield of even a
/// million pieces is an order of magnitude below this), so anything bigger
/// means a peer that doesn't speak the protocol.
const MAX_MESSAGE_LEN: u32 = 0x20_0000;

/// The handshake frame exchanged once, immediately after connecting: the
/// protocol string length and string, 8 reserved bytes (we advertise no
/// extensions, so all zero), the infohash, and the sender's peer id. Exactly
/// 68 bytes on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    pub const LEN: usize = 68;
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        dst.reserve(Handshake::LEN);
        dst.put_u8(handshake.prot.len() as u8);
        dst.extend_from_slice(&handshake.prot);
        dst.extend_from_slice(&handshake.reserved);
        dst.extend_from_slice(&handshake.info_hash);
        dst.extend_from_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Handshake>, Self::Error> {
        if src.len() < Handshake::LEN {
            return Ok(None);
        }
        let mut frame = src.split_to(Handshake::LEN);

        let prot_len = frame.get_u8() as usize;
        let mut prot = [0; 19];
        frame.copy_to_slice(&mut prot);
        if prot_len != prot.len() || prot != *PROTOCOL_STRING.as_bytes() {
            return Err(Error::PeerProtocolViolation(
                "unexpected handshake protocol string".to_string(),
            ));
        }

        let mut reserved = [0; 8];
        frame.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        frame.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        frame.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The id of a peer message, the first payload byte of every non keep-alive
/// frame.
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

/// A message of the peer wire protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    /// A zero length frame, sent to hold an otherwise idle connection open.
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// The peer announces possession of a single piece.
    Have { piece_index: usize },
    /// The peer's full piece availability, sent once after the handshake.
    Bitfield(Bitfield),
    /// A request for a block of a piece.
    Request(BlockInfo),
    /// A block of a piece. Named block rather than piece, as it is the
    /// response to a block request.
    Block {
        piece_index: usize,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
}

impl Message {
    /// The message's wire id, if any (keep-alives have none).
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
    type Error = Error;

    fn encode(
        &mut self,
        msg: Message,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let id = msg.id();
        match msg {
            Message::KeepAlive => {
                dst.put_u32(0);
            }
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(id.map(|id| id as u8).unwrap_or_default());
            }
            Message::Have { piece_index } => {
                dst.put_u32(5);
                dst.put_u8(MessageId::Have as u8);
                dst.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let raw = bitfield.as_raw_slice();
                dst.put_u32(1 + raw.len() as u32);
                dst.put_u8(MessageId::Bitfield as u8);
                dst.extend_from_slice(raw);
            }
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(MessageId::Request as u8);
                dst.put_u32(block.piece_index as u32);
                dst.put_u32(block.offset);
                dst.put_u32(block.len);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                dst.put_u32(9 + data.len() as u32);
                dst.put_u8(MessageId::Block as u8);
                dst.put_u32(piece_index as u32);
                dst.put_u32(offset);
                dst.extend_from_slice(&data);
            }
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(MessageId::Cancel as u8);
                dst.put_u32(block.piece_index as u32);
                dst.put_u32(block.offset);
                dst.put_u32(block.len);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Message>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut len_bytes = [0; 4];
        len_bytes.copy_from_slice(&src[..4]);
        let len = u32::from_be_bytes(len_bytes);

        if len == 0 {
            src.advance(4);
            return Ok(Some(Message::KeepAlive));
        }
        if len > MAX_MESSAGE_LEN {
            return Err(Error::PeerProtocolViolation(format!(
                "frame of {} bytes exceeds the message size limit",
                len
            )));
        }
        if src.len() < 4 + len as usize {
            // the rest of the frame hasn't arrived; reserving ahead is not
            // strictly necessary but saves reallocations
            src.reserve(4 + len as usize - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(4 + len as usize);
        frame.advance(4);
        let id = frame.get_u8();

        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => {
                if frame.remaining() != 4 {
                    return Err(Error::PeerProtocolViolation(
                        "have message of invalid length".to_string(),
                    ));
                }
                Message::Have {
                    piece_index: frame.get_u32() as usize,
                }
            }
            5 => Message::Bitfield(Bitfield::from_vec(frame.to_vec())),
            6 | 8 => {
                if frame.remaining() != 12 {
                    return Err(Error::PeerProtocolViolation(
                        "request message of invalid length".to_string(),
                    ));
                }
                let block = BlockInfo {
                    piece_index: frame.get_u32() as usize,
                    offset: frame.get_u32(),
                    len: frame.get_u32(),
                };
                if id == 6 {
                    Message::Request(block)
                } else {
                    Message::Cancel(block)
                }
            }
            7 => {
                if frame.remaining() < 8 {
                    return Err(Error::PeerProtocolViolation(
                        "piece message of invalid length".to_string(),
                    ));
                }
                let piece_index = frame.get_u32() as usize;
                let offset = frame.get_u32();
                Message::Block {
                    piece_index,
                    offset,
                    data: frame.to_vec(),
                }
            }
            id => {
                // an extension we don't speak; skip the payload and try the
                // next frame
                log::debug!("Skipping message with unknown id {}", id);
                return self.decode(src);
            }
        };

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_LEN;

    fn roundtrip(msg: Message) -> Message {
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg, &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty(), "frame not fully consumed");
        decoded
    }

    #[test]
    fn test_handshake_roundtrip() {
        let handshake = Handshake::new([0x21; 20], *b"-RP0001-012345678901");
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), Handshake::LEN);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], PROTOCOL_STRING.as_bytes());
        assert_eq!(&buf[20..28], &[0; 8]);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn test_handshake_needs_all_68_bytes() {
        let mut buf = BytesMut::from(&[19u8; 67][..]);
        assert_eq!(HandshakeCodec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_handshake_rejects_foreign_protocol() {
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.extend_from_slice(b"BitTorrent PROTOCOL");
        buf.extend_from_slice(&[0; 48]);
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_message_roundtrips() {
        assert_eq!(roundtrip(Message::KeepAlive), Message::KeepAlive);
        assert_eq!(roundtrip(Message::Unchoke), Message::Unchoke);
        assert_eq!(
            roundtrip(Message::Have { piece_index: 9 }),
            Message::Have { piece_index: 9 }
        );
        let block = BlockInfo {
            piece_index: 3,
            offset: BLOCK_LEN,
            len: BLOCK_LEN,
        };
        assert_eq!(roundtrip(Message::Request(block)), Message::Request(block));
        assert_eq!(
            roundtrip(Message::Block {
                piece_index: 3,
                offset: BLOCK_LEN,
                data: vec![0xfa; 64],
            }),
            Message::Block {
                piece_index: 3,
                offset: BLOCK_LEN,
                data: vec![0xfa; 64],
            }
        );
    }

    #[test]
    fn test_bitfield_is_high_bit_first() {
        let mut bitfield = Bitfield::repeat(false, 9);
        bitfield.set(0, true);
        bitfield.set(8, true);

        let mut buf = BytesMut::new();
        PeerCodec
            .encode(Message::Bitfield(bitfield.clone()), &mut buf)
            .unwrap();
        // 2 bytes of payload: piece 0 is the high bit of the first byte,
        // piece 8 the high bit of the second
        assert_eq!(&buf[..], &[0, 0, 0, 3, 5, 0b1000_0000, 0b1000_0000]);

        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        match decoded {
            Message::Bitfield(mut decoded) => {
                decoded.resize(9, false);
                assert_eq!(decoded, bitfield);
            }
            msg => panic!("expected bitfield, got {:?}", msg),
        }
    }

    #[test]
    fn test_partial_frames_wait_for_more_data() {
        let mut buf = BytesMut::new();
        PeerCodec
            .encode(
                Message::Block {
                    piece_index: 0,
                    offset: 0,
                    data: vec![1; 32],
                },
                &mut buf,
            )
            .unwrap();
        let mut partial = BytesMut::from(&buf[..10]);
        assert_eq!(PeerCodec.decode(&mut partial).unwrap(), None);
    }

    #[test]
    fn test_unknown_message_id_is_skipped() {
        let mut buf = BytesMut::new();
        // an extension message we don't understand, followed by an unchoke
        buf.put_u32(3);
        buf.put_u8(20);
        buf.extend_from_slice(&[0xab, 0xcd]);
        PeerCodec.encode(Message::Unchoke, &mut buf).unwrap();

        assert_eq!(
            PeerCodec.decode(&mut buf).unwrap(),
            Some(Message::Unchoke)
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_frame_is_a_violation() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_MESSAGE_LEN + 1);
        buf.put_u8(7);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }
}

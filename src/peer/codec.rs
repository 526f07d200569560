//! The two wire codecs of the peer protocol: the fixed 68 byte handshake
//! exchanged right after connecting, and the length-prefixed messages spoken
//! for the rest of the session.
//!
//! All multi-byte integers on the wire are big endian.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{Error, Result},
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

/// The protocol string of the standard BitTorrent handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The handshake with which every peer connection opens:
///
/// `0x13 | "BitTorrent protocol" | 8 reserved bytes | info hash | peer id`
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Handshake {
    /// The protocol string, always `PROTOCOL_STRING` in valid handshakes.
    pub prot: [u8; 19],
    /// Eight reserved bytes used to negotiate extensions. We support none,
    /// so ours are all zero and the remote's are ignored.
    pub reserved: [u8; 8],
    /// The SHA-1 of the torrent's bencoded info dictionary.
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
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(68);
        dst.put_u8(19);
        dst.put_slice(&handshake.prot);
        dst.put_slice(&handshake.reserved);
        dst.put_slice(&handshake.info_hash);
        dst.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Handshake>> {
        if src.is_empty() {
            return Ok(None);
        }

        // the protocol string length must be 19; reject before waiting for
        // the rest of a handshake that can never become valid
        if src[0] != 19 {
            return Err(Error::InvalidHandshake);
        }
        if src.len() < 68 {
            return Ok(None);
        }

        src.advance(1);

        let mut prot = [0; 19];
        prot.copy_from_slice(&src.split_to(19));
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::InvalidHandshake);
        }

        let mut reserved = [0; 8];
        reserved.copy_from_slice(&src.split_to(8));
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&src.split_to(20));
        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&src.split_to(20));

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The id of a framed message, i.e. the byte following the length prefix.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

/// A message of the peer protocol, after the handshake.
///
/// Every variant maps to a `u32 length | u8 id | payload` frame, except
/// `KeepAlive` which is a bare zero length prefix.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
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
    Port(u16),
}

impl Message {
    /// Returns the id of the message, or `None` for keep-alives, which have
    /// no id on the wire.
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
            Message::Port(_) => Some(MessageId::Port),
        }
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                dst.put_u32(0);
            }
            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece_index } => {
                dst.put_u32(5);
                dst.put_u8(MessageId::Have as u8);
                dst.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                dst.put_u32(1 + bytes.len() as u32);
                dst.put_u8(MessageId::Bitfield as u8);
                dst.put_slice(&bytes);
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
                dst.put_u8(MessageId::Piece as u8);
                dst.put_u32(piece_index as u32);
                dst.put_u32(offset);
                dst.put_slice(&data);
            }
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(MessageId::Cancel as u8);
                dst.put_u32(block.piece_index as u32);
                dst.put_u32(block.offset);
                dst.put_u32(block.len);
            }
            Message::Port(port) => {
                dst.put_u32(3);
                dst.put_u8(MessageId::Port as u8);
                dst.put_u16(port);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        // loop so that a message with an unknown id can be skipped in place
        // and decoding continues with whatever follows it in the buffer
        loop {
            if src.len() < 4 {
                return Ok(None);
            }

            let mut prefix = [0; 4];
            prefix.copy_from_slice(&src[..4]);
            let frame_len = u32::from_be_bytes(prefix) as usize;

            if src.len() < 4 + frame_len {
                // reserve enough space for the rest of the frame, as we know
                // its length upfront
                src.reserve(4 + frame_len - src.len());
                return Ok(None);
            }

            src.advance(4);

            if frame_len == 0 {
                return Ok(Some(Message::KeepAlive));
            }

            let id = src.get_u8();
            let payload_len = frame_len - 1;

            let msg = match id {
                0 | 1 | 2 | 3 => {
                    if payload_len != 0 {
                        return Err(Error::InvalidMessagePayload(id));
                    }
                    match id {
                        0 => Message::Choke,
                        1 => Message::Unchoke,
                        2 => Message::Interested,
                        _ => Message::NotInterested,
                    }
                }
                4 => {
                    if payload_len != 4 {
                        return Err(Error::InvalidMessagePayload(id));
                    }
                    Message::Have {
                        piece_index: src.get_u32() as PieceIndex,
                    }
                }
                5 => {
                    let bytes = src.split_to(payload_len).to_vec();
                    Message::Bitfield(Bitfield::from_vec(bytes))
                }
                6 | 8 => {
                    if payload_len != 12 {
                        return Err(Error::InvalidMessagePayload(id));
                    }
                    let block = BlockInfo {
                        piece_index: src.get_u32() as PieceIndex,
                        offset: src.get_u32(),
                        len: src.get_u32(),
                    };
                    if id == 6 {
                        Message::Request(block)
                    } else {
                        Message::Cancel(block)
                    }
                }
                7 => {
                    if payload_len < 8 {
                        return Err(Error::InvalidMessagePayload(id));
                    }
                    let piece_index = src.get_u32() as PieceIndex;
                    let offset = src.get_u32();
                    let data = src.split_to(payload_len - 8).to_vec();
                    Message::Block {
                        piece_index,
                        offset,
                        data,
                    }
                }
                9 => {
                    if payload_len != 2 {
                        return Err(Error::InvalidMessagePayload(id));
                    }
                    Message::Port(src.get_u16())
                }
                id => {
                    // a message we don't speak: skip its payload and try the
                    // next frame
                    log::debug!("Skipping unknown message id {}", id);
                    src.advance(payload_len);
                    continue;
                }
            };

            return Ok(Some(msg));
        }
    }
}

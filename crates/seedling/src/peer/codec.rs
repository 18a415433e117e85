//! Codecs of the peer wire protocol.
//!
//! The handshake has a different structure than the rest of the messages,
//! so it gets its own codec. It may only be sent once, at the beginning of
//! a connection, after that every message goes through [`MessageCodec`].
//! Both work on the same receive buffer, care must be taken not to discard
//! bytes when switching from one to the other.
use std::io::Cursor;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use speedy::{BigEndian, Readable, Writable};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use super::{Block, BlockInfo, PeerId};
use crate::{error::Error, torrent::InfoHash};

/// The default block_len that most clients support, some clients drop
/// the connection on blocks larger than this value.
///
/// The last block of a piece might be smaller.
pub const BLOCK_LEN: u32 = 16384;

/// Protocol String
/// String identifier of the string "BitTorrent protocol", in bytes.
pub const PSTR: [u8; 19] = *b"BitTorrent protocol";

/// Larger messages are rejected and the connection dropped.
pub const MAX_MESSAGE_SIZE: usize = 200_000;

/// Handshake bytes up to and including the info hash.
pub const HANDSHAKE_HEADER_LEN: usize = 1 + 19 + 8 + 20;

pub const HANDSHAKE_LEN: usize = HANDSHAKE_HEADER_LEN + 20;

/// pstrlen = 19
/// pstr = "BitTorrent protocol"
/// This is the very first message exchanged. If the peer's protocol string
/// or the info hash differs from ours, the connection is severed. The
/// reserved field is 8 zero bytes.
#[derive(Clone, Debug, PartialEq, Writable, Readable)]
pub struct Handshake {
    pub pstr_len: u8,
    pub pstr: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            pstr_len: PSTR.len() as u8,
            pstr: PSTR,
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn serialize(&self) -> Result<[u8; HANDSHAKE_LEN], Error> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        let temp = self.write_to_vec_with_ctx(BigEndian {})?;
        buf.copy_from_slice(&temp[..]);
        Ok(buf)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        Ok(Self::read_from_buffer_with_ctx(BigEndian {}, buf)?)
    }
}

/// The part of a handshake needed to route a connection.
///
/// Some clients only send their peer id after they saw ours, so the
/// peer id is read separately.
#[derive(Clone, Debug, PartialEq)]
pub struct HandshakeHeader {
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<(), Error> {
        buf.extend_from_slice(&handshake.serialize()?);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = HandshakeHeader;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<HandshakeHeader>, Error> {
        if buf.len() < HANDSHAKE_HEADER_LEN {
            return Ok(None);
        }

        if buf[0] as usize != PSTR.len() || buf[1..20] != PSTR {
            return Err(Error::HandshakeInvalid);
        }
        buf.advance(20);

        let mut reserved = [0u8; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0u8; 20];
        buf.copy_to_slice(&mut info_hash);

        Ok(Some(HandshakeHeader { reserved, info_hash: InfoHash(info_hash) }))
    }
}

/// Messages exchanged after a successful handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    /// Packed bits, MSB first.
    Bitfield(Bytes),
    Request(BlockInfo),
    Piece(Block),
    Cancel(BlockInfo),
}

/// The IDs of the [`Message`]s.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
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
    type Error = u8;

    fn try_from(k: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        match k {
            k if k == Choke as u8 => Ok(Choke),
            k if k == Unchoke as u8 => Ok(Unchoke),
            k if k == Interested as u8 => Ok(Interested),
            k if k == NotInterested as u8 => Ok(NotInterested),
            k if k == Have as u8 => Ok(Have),
            k if k == Bitfield as u8 => Ok(Bitfield),
            k if k == Request as u8 => Ok(Request),
            k if k == Piece as u8 => Ok(Piece),
            k if k == Cancel as u8 => Ok(Cancel),
            k => Err(k),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, buf: &mut BytesMut) -> Result<(), Error> {
        use Message::*;
        match item {
            KeepAlive => {
                buf.put_u32(0);
            }
            Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Have(index) => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(index);
            }
            Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(&bits);
            }
            Request(info) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                put_block_info(buf, &info);
            }
            Piece(block) => {
                buf.put_u32(9 + block.data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(block.index);
                buf.put_u32(block.begin);
                buf.extend_from_slice(&block.data);
            }
            Cancel(info) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                put_block_info(buf, &info);
            }
        }
        Ok(())
    }
}

fn put_block_info(buf: &mut BytesMut, info: &BlockInfo) {
    buf.put_u32(info.index);
    buf.put_u32(info.begin);
    buf.put_u32(info.len);
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, Error> {
        loop {
            // the message length header must be present at the minimum
            if buf.remaining() < 4 {
                return Ok(None);
            }

            // peek at the length without consuming it, the whole message
            // may not be in the buffer yet
            let mut tmp_buf = Cursor::new(&buf);
            let msg_len = tmp_buf.get_u32() as usize;

            if msg_len > MAX_MESSAGE_SIZE {
                return Err(Error::MessageTooLarge(msg_len));
            }

            if buf.remaining() < 4 + msg_len {
                buf.reserve(4 + msg_len - buf.remaining());
                return Ok(None);
            }
            buf.advance(4);

            if msg_len == 0 {
                return Ok(Some(Message::KeepAlive));
            }

            let id = buf.get_u8();
            let mut payload = buf.split_to(msg_len - 1);

            let Ok(id) = MessageId::try_from(id) else {
                debug!("ignoring unknown message id {id}");
                continue;
            };

            let msg = match id {
                MessageId::Choke => Message::Choke,
                MessageId::Unchoke => Message::Unchoke,
                MessageId::Interested => Message::Interested,
                MessageId::NotInterested => Message::NotInterested,
                MessageId::Have => {
                    if payload.len() != 4 {
                        return Err(Error::MessageResponse);
                    }
                    Message::Have(payload.get_u32())
                }
                MessageId::Bitfield => Message::Bitfield(payload.freeze()),
                MessageId::Request | MessageId::Cancel => {
                    if payload.len() != 12 {
                        return Err(Error::MessageResponse);
                    }
                    let info = BlockInfo {
                        index: payload.get_u32(),
                        begin: payload.get_u32(),
                        len: payload.get_u32(),
                    };
                    if id == MessageId::Request {
                        Message::Request(info)
                    } else {
                        Message::Cancel(info)
                    }
                }
                MessageId::Piece => {
                    if payload.len() < 8 {
                        return Err(Error::MessageResponse);
                    }
                    let index = payload.get_u32();
                    let begin = payload.get_u32();
                    Message::Piece(Block { index, begin, data: payload.freeze() })
                }
            };

            return Ok(Some(msg));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(msg: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        MessageCodec.encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn handshake() {
        let info_hash = InfoHash([5u8; 20]);
        let peer_id = PeerId([7u8; 20]);
        let ours = Handshake::new(info_hash, peer_id).serialize().unwrap();

        assert_eq!(ours[0], 19);
        assert_eq!(&ours[1..20], b"BitTorrent protocol");
        assert_eq!(&ours[20..28], &[0u8; 8]);
        assert_eq!(&ours[28..48], &[5u8; 20]);
        assert_eq!(&ours[48..68], &[7u8; 20]);

        assert_eq!(
            Handshake::deserialize(&ours).unwrap(),
            Handshake::new(info_hash, peer_id)
        );
    }

    #[test]
    fn handshake_header_waits_for_48_bytes() {
        let bytes = Handshake::new(InfoHash([1; 20]), PeerId([2; 20])).serialize().unwrap();

        let mut buf = BytesMut::from(&bytes[..47]);
        assert_eq!(HandshakeCodec.decode(&mut buf).unwrap(), None);

        let mut buf = BytesMut::from(&bytes[..]);
        let header = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(header.info_hash, InfoHash([1; 20]));
        // only the peer id is left
        assert_eq!(&buf[..], &[2u8; 20]);

        let mut bad = bytes;
        bad[3] = b'x';
        let mut buf = BytesMut::from(&bad[..]);
        assert!(matches!(HandshakeCodec.decode(&mut buf), Err(Error::HandshakeInvalid)));
    }

    #[test]
    fn encode_layouts() {
        assert_eq!(&encode(Message::KeepAlive)[..], &[0, 0, 0, 0]);
        assert_eq!(&encode(Message::Interested)[..], &[0, 0, 0, 1, 2]);
        assert_eq!(&encode(Message::Have(258))[..], &[0, 0, 0, 5, 4, 0, 0, 1, 2]);

        let mut buf = encode(Message::Request(BlockInfo::new(1, 16384, 16384)));
        assert_eq!(buf.get_u32(), 13);
        assert_eq!(buf.get_u8(), MessageId::Request as u8);
        assert_eq!(buf.get_u32(), 1);
        assert_eq!(buf.get_u32(), 16384);
        assert_eq!(buf.get_u32(), 16384);

        let mut buf = encode(Message::Piece(Block {
            index: 2,
            begin: 0,
            data: Bytes::from_static(&[9, 9, 9]),
        }));
        assert_eq!(buf.get_u32(), 12);
        assert_eq!(buf.get_u8(), MessageId::Piece as u8);
        assert_eq!(buf.get_u32(), 2);
        assert_eq!(buf.get_u32(), 0);
        assert_eq!(&buf[..], &[9, 9, 9]);
    }

    #[test]
    fn decode_stream_in_pieces() {
        let mut wire = encode(Message::Unchoke);
        wire.extend(encode(Message::KeepAlive));
        wire.extend(encode(Message::Bitfield(Bytes::from_static(&[0b1010_0000]))));
        wire.extend(encode(Message::Cancel(BlockInfo::new(3, 0, 100))));

        let mut buf = BytesMut::new();
        let mut out = vec![];
        // feed one byte at a time
        for b in wire.iter() {
            buf.put_u8(*b);
            while let Some(msg) = MessageCodec.decode(&mut buf).unwrap() {
                out.push(msg);
            }
        }

        assert_eq!(
            out,
            vec![
                Message::Unchoke,
                Message::KeepAlive,
                Message::Bitfield(Bytes::from_static(&[0b1010_0000])),
                Message::Cancel(BlockInfo::new(3, 0, 100)),
            ]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn unknown_ids_are_skipped() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(20);
        buf.put_u16(0xFFFF);
        buf.extend(encode(Message::Have(1)));

        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), Some(Message::Have(1)));
    }

    #[test]
    fn oversized_and_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_MESSAGE_SIZE as u32 + 1);
        assert!(matches!(MessageCodec.decode(&mut buf), Err(Error::MessageTooLarge(_))));

        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(MessageId::Have as u8);
        buf.put_u16(1);
        assert!(matches!(MessageCodec.decode(&mut buf), Err(Error::MessageResponse)));
    }
}

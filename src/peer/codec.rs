//! The BitTorrent v1 wire format: the fixed 68 byte handshake and the
//! length-prefixed message frames that follow it.
//!
//! Two codecs share the socket over the course of a connection: the
//! session starts out framed with [`HandshakeCodec`] and is re-framed with
//! [`PeerCodec`] once the handshakes are exchanged.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{Error, Result},
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

/// The protocol string transmitted in the handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The fixed length of a v1 handshake frame.
const HANDSHAKE_LEN: usize = 68;

/// The handshake is the first message either side sends:
/// `<pstrlen=19><pstr><8 reserved bytes><info hash><peer id>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    /// The protocol string, must equal [`PROTOCOL_STRING`].
    pub prot: [u8; 19],
    /// Extension bits; we set none.
    pub reserved: [u8; 8],
    /// The identity of the torrent the connection is for.
    pub info_hash: Sha1Hash,
    /// The arbitrary 20 byte id the remote chose for this run.
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

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<()> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(handshake.prot.len() as u8);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
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
        // the protocol string length is checked before waiting for the full
        // frame so that probes with a bogus prefix are cut off on the first
        // read
        if buf[0] as usize != PROTOCOL_STRING.len() {
            return Err(Error::BadHandshake);
        }
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        let mut frame = buf.split_to(HANDSHAKE_LEN);
        frame.advance(1);
        let mut prot = [0; 19];
        frame.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::BadHandshake);
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

/// The id byte of each non-handshake message. Keep-alives have no id.
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
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(id: u8) -> Result<Self, u8> {
        use MessageId::*;
        match id {
            0 => Ok(Choke),
            1 => Ok(Unchoke),
            2 => Ok(Interested),
            3 => Ok(NotInterested),
            4 => Ok(Have),
            5 => Ok(Bitfield),
            6 => Ok(Request),
            7 => Ok(Piece),
            8 => Ok(Cancel),
            _ => Err(id),
        }
    }
}

/// A decoded protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(PieceIndex),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
}

impl Message {
    /// The message's wire id, used for logging. Keep-alives have none.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have(_) => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Piece { .. } => Some(MessageId::Piece),
            Self::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

/// Codec for the post-handshake message stream:
/// `<length: 4 byte big endian><id: 1 byte><payload>`, where a length of
/// zero encodes a keep-alive.
pub(crate) struct PeerCodec {
    /// Frames longer than this close the session. Nothing legitimate
    /// exceeds a whole piece plus the piece message header.
    max_frame_len: usize,
}

impl PeerCodec {
    pub fn new(piece_len: u32) -> Self {
        Self {
            max_frame_len: piece_len as usize + 9,
        }
    }
}

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        use Message::*;
        match msg {
            KeepAlive => buf.put_u32(0),
            Choke | Unchoke | Interested | NotInterested => {
                buf.put_u32(1);
                buf.put_u8(msg.id().expect("status messages have an id") as u8);
            }
            Have(piece_index) => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Bitfield(bitfield) => {
                let raw = bitfield.as_raw_slice();
                buf.put_u32(1 + raw.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(raw);
            }
            Request(block) | Cancel(block) => {
                buf.put_u32(13);
                buf.put_u8(msg.id().expect("block messages have an id") as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        // frames with unknown ids are drained here, so loop until a known
        // frame is complete or we run out of buffered bytes
        loop {
            if buf.len() < 4 {
                return Ok(None);
            }
            let len =
                u32::from_be_bytes(buf[..4].try_into().expect("4 bytes"))
                    as usize;
            if len > self.max_frame_len {
                return Err(Error::ProtocolViolation("frame exceeds size cap"));
            }
            if len == 0 {
                buf.advance(4);
                return Ok(Some(Message::KeepAlive));
            }
            if buf.len() < 4 + len {
                buf.reserve(4 + len - buf.len());
                return Ok(None);
            }

            buf.advance(4);
            let mut payload = buf.split_to(len);
            let id = payload.get_u8();
            match MessageId::try_from(id) {
                Ok(id) => return parse_payload(id, payload).map(Some),
                Err(id) => {
                    log::debug!("Ignoring unknown message id {}", id);
                }
            }
        }
    }
}

fn parse_payload(id: MessageId, mut payload: BytesMut) -> Result<Message> {
    use MessageId::*;
    let fixed_payload_len = match id {
        Choke | Unchoke | Interested | NotInterested => Some(0),
        Have => Some(4),
        Request | Cancel => Some(12),
        Bitfield | Piece => None,
    };
    if let Some(expected) = fixed_payload_len {
        if payload.len() != expected {
            return Err(Error::ProtocolViolation("malformed payload"));
        }
    }
    let msg = match id {
        Choke => Message::Choke,
        Unchoke => Message::Unchoke,
        Interested => Message::Interested,
        NotInterested => Message::NotInterested,
        Have => Message::Have(payload.get_u32() as PieceIndex),
        Bitfield => {
            Message::Bitfield(crate::Bitfield::from_vec(payload.to_vec()))
        }
        Request | Cancel => {
            let block = BlockInfo {
                piece_index: payload.get_u32() as PieceIndex,
                offset: payload.get_u32(),
                len: payload.get_u32(),
            };
            if id == Request {
                Message::Request(block)
            } else {
                Message::Cancel(block)
            }
        }
        Piece => {
            if payload.len() < 9 {
                return Err(Error::ProtocolViolation("malformed payload"));
            }
            Message::Piece {
                piece_index: payload.get_u32() as PieceIndex,
                offset: payload.get_u32(),
                data: payload.to_vec(),
            }
        }
    };
    Ok(msg)
}

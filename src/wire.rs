use crate::defs::{HASH_LEN, InfoHash, PeerId};
use crate::error::{HandshakeError, ProtocolViolation};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::{
    bytes::{Buf, BufMut, Bytes, BytesMut},
    codec::{Decoder, Encoder},
};

/// Size of the sub-piece we request at a time
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Anything larger than this is not a frame we'd ever legitimately get
pub const MAX_FRAME: usize = 1 << 20;

/// Largest request we are willing to serve
pub const MAX_REQUEST: u32 = 4 * BLOCK_SIZE;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub trait Encode {
    fn encode(&self, buf: &mut BytesMut);
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct KeepAlive;
impl Encode for KeepAlive {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(0);
    }
}

macro_rules! bare_message {
    ($name:ident, $opcode:expr) => {
        #[derive(Debug, PartialEq, Eq, Clone, Copy)]
        pub struct $name;
        impl Encode for $name {
            fn encode(&self, buf: &mut BytesMut) {
                buf.put_u32(1);
                buf.put_u8($opcode);
            }
        }
    };
}

bare_message!(Choke, 0);
bare_message!(Unchoke, 1);
bare_message!(Interested, 2);
bare_message!(NotInterested, 3);

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Have {
    pub piece: u32,
}

impl Encode for Have {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(5);
        buf.put_u8(4);
        buf.put_u32(self.piece);
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct BitField {
    pub has: Box<[u8]>,
}

impl Encode for BitField {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(1 + self.has.len() as u32);
        buf.put_u8(5);
        buf.extend_from_slice(&self.has);
    }
}

#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Clone, Copy)]
pub struct Request {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl Request {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Request { index, begin, length }
    }

    /// Offset one past the last byte this request covers
    pub fn end(&self) -> u32 {
        self.begin + self.length
    }

    fn put(&self, buf: &mut BytesMut, opcode: u8) {
        buf.put_u32(13);
        buf.put_u8(opcode);
        buf.put_u32(self.index);
        buf.put_u32(self.begin);
        buf.put_u32(self.length);
    }
}

impl Encode for Request {
    fn encode(&self, buf: &mut BytesMut) {
        self.put(buf, 6);
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Piece {
    pub index: u32,
    pub begin: u32,
    pub data: Bytes,
}

impl Piece {
    /// The request this payload answers
    pub fn request(&self) -> Request {
        Request::new(self.index, self.begin, self.data.len() as u32)
    }
}

impl Encode for Piece {
    fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(13 + self.data.len());
        buf.put_u32(9 + self.data.len() as u32);
        buf.put_u8(7);
        buf.put_u32(self.index);
        buf.put_u32(self.begin);
        buf.extend_from_slice(&self.data);
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Cancel(pub Request);

impl Encode for Cancel {
    fn encode(&self, buf: &mut BytesMut) {
        self.0.put(buf, 8);
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum BtMessage {
    KeepAlive(KeepAlive),
    Choke(Choke),
    Unchoke(Unchoke),
    Interested(Interested),
    NotInterested(NotInterested),
    Have(Have),
    BitField(BitField),
    Request(Request),
    Piece(Piece),
    Cancel(Cancel),
    Unknown(u8, Bytes),
}

impl BtMessage {
    /// Piece payloads yield to everything else in the outbound queue
    pub fn is_piece(&self) -> bool {
        matches!(self, BtMessage::Piece(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BtEncoder;

impl Encoder<BtMessage> for BtEncoder {
    type Error = io::Error;

    fn encode(&mut self, item: BtMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            BtMessage::KeepAlive(keep_alive) => keep_alive.encode(dst),
            BtMessage::Choke(choke) => choke.encode(dst),
            BtMessage::Unchoke(unchoke) => unchoke.encode(dst),
            BtMessage::Interested(interested) => interested.encode(dst),
            BtMessage::NotInterested(not_interested) => not_interested.encode(dst),
            BtMessage::Have(have) => have.encode(dst),
            BtMessage::BitField(bit_field) => bit_field.encode(dst),
            BtMessage::Request(request) => request.encode(dst),
            BtMessage::Piece(piece) => piece.encode(dst),
            BtMessage::Cancel(cancel) => cancel.encode(dst),
            BtMessage::Unknown(opcode, _) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("refusing to send unknown message {opcode}"),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BtDecoder;

impl Decoder for BtDecoder {
    type Item = BtMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME {
            return Err(ProtocolViolation::FrameTooLong(length).into());
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        if length == 0 {
            return Ok(Some(BtMessage::KeepAlive(KeepAlive)));
        }

        let mut frame = src.split_to(length);
        let opcode = frame.get_u8();
        let payload = frame.len();

        let expected = match opcode {
            0..=3 => Some(0),
            4 => Some(4),
            6 | 8 => Some(12),
            _ => None,
        };
        let too_short = matches!(opcode, 5 if payload == 0) || matches!(opcode, 7 if payload < 8);
        if expected.is_some_and(|e| e != payload) || too_short {
            return Err(ProtocolViolation::BadPayload { opcode, len: payload }.into());
        }

        let msg = match opcode {
            0 => BtMessage::Choke(Choke),
            1 => BtMessage::Unchoke(Unchoke),
            2 => BtMessage::Interested(Interested),
            3 => BtMessage::NotInterested(NotInterested),
            4 => BtMessage::Have(Have { piece: frame.get_u32() }),
            5 => BtMessage::BitField(BitField {
                has: Box::from(&frame[..]),
            }),
            6 | 8 => {
                let request = Request::new(frame.get_u32(), frame.get_u32(), frame.get_u32());
                if opcode == 6 {
                    BtMessage::Request(request)
                } else {
                    BtMessage::Cancel(Cancel(request))
                }
            }
            7 => {
                let index = frame.get_u32();
                let begin = frame.get_u32();
                BtMessage::Piece(Piece {
                    index,
                    begin,
                    data: frame.freeze(),
                })
            }
            t => BtMessage::Unknown(t, frame.freeze()),
        };

        Ok(Some(msg))
    }
}

pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 1 + 19 + 8 + HASH_LEN + HASH_LEN;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Handshake {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(self.info_hash.as_bytes());
        buf[48..68].copy_from_slice(self.peer_id.as_bytes());
        buf
    }

    /// Validates a received handshake against the swarm we expect the remote to be in
    pub fn parse(buf: &[u8; HANDSHAKE_LEN], expected: InfoHash) -> Result<Self, HandshakeError> {
        if buf[0] as usize != PROTOCOL.len() {
            return Err(HandshakeError::BadLength(buf[0]));
        }
        if &buf[1..20] != PROTOCOL {
            return Err(HandshakeError::BadProtocol);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; HASH_LEN];
        info_hash.copy_from_slice(&buf[28..48]);
        let info_hash = InfoHash(info_hash);
        if info_hash != expected {
            return Err(HandshakeError::InfoHashMismatch {
                expected,
                received: info_hash,
            });
        }
        let mut peer_id = [0u8; HASH_LEN];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Handshake {
            reserved,
            info_hash,
            peer_id: PeerId(peer_id),
        })
    }
}

async fn read_handshake<S>(stream: &mut S, info_hash: InfoHash) -> Result<Handshake, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut buf[..1]).await?;
    // a wrong length byte means the rest isn't worth reading
    if buf[0] as usize != PROTOCOL.len() {
        return Err(HandshakeError::BadLength(buf[0]));
    }
    stream.read_exact(&mut buf[1..]).await?;
    Handshake::parse(&buf, info_hash)
}

/// Our side opened the connection: send first, then read
#[tracing::instrument(skip(stream))]
pub async fn initiate_handshake<S>(
    stream: &mut S,
    info_hash: InfoHash,
    local_id: PeerId,
) -> Result<Handshake, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        stream.write_all(&Handshake::new(info_hash, local_id).to_bytes()).await?;
        stream.flush().await?;
        read_handshake(stream, info_hash).await
    };

    tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange)
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

/// The remote opened the connection: read theirs first and only answer if it is for our swarm
#[tracing::instrument(skip(stream))]
pub async fn accept_handshake<S>(
    stream: &mut S,
    info_hash: InfoHash,
    local_id: PeerId,
) -> Result<Handshake, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        let theirs = read_handshake(stream, info_hash).await?;
        stream.write_all(&Handshake::new(info_hash, local_id).to_bytes()).await?;
        stream.flush().await?;
        Ok(theirs)
    };

    tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange)
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

use crate::defs::InfoHash;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("network error during handshake: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol name length must be 19, got {0}")]
    BadLength(u8),
    #[error("peer does not speak the BitTorrent protocol")]
    BadProtocol,
    #[error("info hash mismatch, expected {expected} got {received}")]
    InfoHashMismatch { expected: InfoHash, received: InfoHash },
    #[error("handshake timed out")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker refused the announce: {0}")]
    Failure(String),
    #[error("tracker responded with status {0}")]
    Status(u16),
    #[error("malformed tracker response: {0}")]
    Malformed(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("bit {index} out of range for a set of {size}")]
pub struct BitSetError {
    pub index: usize,
    pub size: usize,
}

/// Things a remote peer can do to get itself disconnected
#[derive(Debug, Error)]
pub enum ProtocolViolation {
    #[error("frame of {0} bytes exceeds the maximum")]
    FrameTooLong(usize),
    #[error("message {opcode} with a {len} byte payload")]
    BadPayload { opcode: u8, len: usize },
    #[error("piece {0} is out of range")]
    PieceOutOfRange(u32),
    #[error("bitfield of {got} bytes, expected {expected}")]
    BitfieldLength { got: usize, expected: usize },
}

impl From<ProtocolViolation> for std::io::Error {
    fn from(value: ProtocolViolation) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, value)
    }
}

/// Why the embedded tracker refused an announce, the message goes out as the `failure reason`
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnnounceError {
    #[error("bad info_hash")]
    BadInfoHash,
    #[error("unknown info_hash")]
    UnknownInfoHash,
    #[error("bad peer_id")]
    BadPeerId,
    #[error("bad port")]
    BadPort,
    #[error("bad {0}")]
    BadNumber(&'static str),
    #[error("bad event")]
    BadEvent,
}

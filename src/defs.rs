use rand::RngCore;
use std::fmt::{self, Debug, Display};
use std::net::SocketAddr;

pub const HASH_LEN: usize = 20;

/// Prefix of every peer id we generate, Azureus style
pub const PEER_ID_PREFIX: &[u8; 8] = b"-PM0100-";

/// SHA-1 of the bencoded `info` dictionary, the swarm's identifier
#[derive(PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct InfoHash(pub [u8; HASH_LEN]);

impl InfoHash {
    /// Returns `None` if `bytes` is not 20 bytes in length
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; HASH_LEN] = bytes.try_into().ok()?;
        Some(InfoHash(arr))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_bytes(&bytes)
    }
}

impl Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct PeerId(pub [u8; HASH_LEN]);

impl PeerId {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; HASH_LEN] = bytes.try_into().ok()?;
        Some(PeerId(arr))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// A fresh id: our client prefix followed by 12 random bytes
    pub fn random() -> Self {
        let mut id = [0u8; HASH_LEN];
        id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
        rand::rng().fill_bytes(&mut id[PEER_ID_PREFIX.len()..]);
        PeerId(id)
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // most clients put a printable prefix up front, show that part as text
        let printable = self.0.iter().take_while(|b| b.is_ascii_graphic()).count();
        let (text, rest) = self.0.split_at(printable);
        write!(f, "{}{}", String::from_utf8_lossy(text), hex::encode(rest))
    }
}

/// Identity of a swarm member: its 20 byte id plus where it can be reached.
///
/// Equality and hashing are structural over all three parts, two connections from the same peer id
/// on different ports are different identities.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Copy)]
pub struct Identity {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
}

impl Identity {
    pub fn new(peer_id: PeerId, addr: SocketAddr) -> Self {
        Identity { peer_id, addr }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self.peer_id, self.addr)
    }
}

use crate::defs::{InfoHash, PeerId};
use crate::error::AnnounceError;
use crate::torrent::Torrent;
use crate::tracker_client::AnnounceEvent;
use bendy::encoding::Encoder;
use percent_encoding::percent_decode;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// An announce as it arrives in the query string of a GET
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: Option<u64>,
    pub event: Option<AnnounceEvent>,
    pub compact: bool,
}

fn decode(raw: &[u8]) -> Vec<u8> {
    let spaced: Vec<u8> = raw.iter().map(|b| if *b == b'+' { b' ' } else { *b }).collect();
    percent_decode(&spaced).collect()
}

fn number(value: &[u8], what: &'static str) -> Result<u64, AnnounceError> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(AnnounceError::BadNumber(what))
}

/// Parses the query part of an announce url. Values are decoded to raw bytes, the hashes are not
/// text.
pub fn parse_announce_query(query: &[u8]) -> Result<AnnounceRequest, AnnounceError> {
    let mut info_hash = None;
    let mut peer_id = None;
    let mut port = None;
    let mut uploaded = 0;
    let mut downloaded = 0;
    let mut left = None;
    let mut event = None;
    let mut compact = false;

    for pair in query.split(|b| *b == b'&').filter(|p| !p.is_empty()) {
        let (key, value) = match pair.iter().position(|b| *b == b'=') {
            Some(i) => (&pair[..i], decode(&pair[i + 1..])),
            None => (pair, vec![]),
        };

        match key {
            b"info_hash" => info_hash = Some(InfoHash::from_bytes(&value).ok_or(AnnounceError::BadInfoHash)?),
            b"peer_id" => peer_id = Some(PeerId::from_bytes(&value).ok_or(AnnounceError::BadPeerId)?),
            b"port" => {
                let p = number(&value, "port").map_err(|_| AnnounceError::BadPort)?;
                port = Some(u16::try_from(p).map_err(|_| AnnounceError::BadPort)?);
            }
            b"uploaded" => uploaded = number(&value, "uploaded")?,
            b"downloaded" => downloaded = number(&value, "downloaded")?,
            b"left" => left = Some(number(&value, "left")?),
            b"event" => {
                event = match value.as_slice() {
                    b"started" => Some(AnnounceEvent::Started),
                    b"completed" => Some(AnnounceEvent::Completed),
                    b"stopped" => Some(AnnounceEvent::Stopped),
                    b"" | b"empty" => None,
                    _ => return Err(AnnounceError::BadEvent),
                }
            }
            b"compact" => compact = value == b"1",
            _ => {}
        }
    }

    Ok(AnnounceRequest {
        info_hash: info_hash.ok_or(AnnounceError::BadInfoHash)?,
        peer_id: peer_id.ok_or(AnnounceError::BadPeerId)?,
        port: port.filter(|p| *p != 0).ok_or(AnnounceError::BadPort)?,
        uploaded,
        downloaded,
        left,
        event,
        compact,
    })
}

#[derive(Debug, Clone, Copy)]
struct TrackedPeer {
    addr: SocketAddr,
    seeder: bool,
    last_seen: Instant,
}

#[derive(Debug)]
struct TrackedSwarm {
    metainfo: Arc<[u8]>,
    peers: HashMap<PeerId, TrackedPeer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub interval: Duration,
    pub complete: usize,
    pub incomplete: usize,
    pub peers: Vec<(PeerId, SocketAddr)>,
    pub compact: bool,
}

impl AnnounceResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder
            .emit_and_sort_dict(|e| {
                e.emit_pair_with(b"complete", |e| e.emit_int(self.complete))?;
                e.emit_pair_with(b"incomplete", |e| e.emit_int(self.incomplete))?;
                e.emit_pair_with(b"interval", |e| e.emit_int(self.interval.as_secs()))?;

                if self.compact {
                    // 6 bytes per IPv4 peer, 18 per IPv6 peer in their own key
                    let mut packed = vec![];
                    let mut packed6 = vec![];
                    for (_, addr) in &self.peers {
                        match addr {
                            SocketAddr::V4(v4) => {
                                packed.extend_from_slice(&v4.ip().octets());
                                packed.extend_from_slice(&v4.port().to_be_bytes());
                            }
                            SocketAddr::V6(v6) => {
                                packed6.extend_from_slice(&v6.ip().octets());
                                packed6.extend_from_slice(&v6.port().to_be_bytes());
                            }
                        }
                    }
                    if !packed6.is_empty() {
                        e.emit_pair_with(b"peers6", |e| e.emit_bytes(&packed6))?;
                    }
                    return e.emit_pair_with(b"peers", |e| e.emit_bytes(&packed));
                }

                e.emit_pair_with(b"peers", |e| {
                    e.emit_list(|e| {
                        for (peer_id, addr) in &self.peers {
                            e.emit_and_sort_dict(|e| {
                                e.emit_pair_with(b"ip", |e| e.emit_str(&addr.ip().to_string()))?;
                                e.emit_pair_with(b"peer id", |e| e.emit_bytes(peer_id.as_bytes()))?;
                                e.emit_pair_with(b"port", |e| e.emit_int(addr.port()))
                            })?;
                        }
                        Ok(())
                    })
                })
            })
            .expect("we know all the fields upfront");

        encoder.get_output().expect("we know all the fields upfront")
    }
}

/// Bencoded `failure reason` reply
pub fn failure_response(reason: &AnnounceError) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder
        .emit_and_sort_dict(|e| e.emit_pair_with(b"failure reason", |e| e.emit_str(&reason.to_string())))
        .expect("we know all the fields upfront");

    encoder.get_output().expect("we know all the fields upfront")
}

/// The embedded tracker. Only knows about torrents registered with it, keeps every peer that
/// announced within the last two intervals.
#[derive(Debug)]
pub struct Tracker {
    swarms: Mutex<HashMap<InfoHash, TrackedSwarm>>,
    interval: Duration,
}

impl Tracker {
    pub fn new(interval: Duration) -> Self {
        Tracker {
            swarms: Mutex::new(HashMap::new()),
            interval,
        }
    }

    fn swarms(&self) -> MutexGuard<'_, HashMap<InfoHash, TrackedSwarm>> {
        self.swarms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, torrent: &Torrent) {
        info!("tracking {} ({})", torrent.name, torrent.info_hash);
        self.swarms().entry(torrent.info_hash).or_insert_with(|| TrackedSwarm {
            metainfo: torrent.to_bytes().into(),
            peers: HashMap::new(),
        });
    }

    /// The metadata file of a registered torrent
    pub fn metainfo(&self, info_hash: &InfoHash) -> Option<Arc<[u8]>> {
        self.swarms().get(info_hash).map(|s| s.metainfo.clone())
    }

    /// Every registered torrent, for the index page
    pub fn tracked(&self) -> Vec<(InfoHash, usize)> {
        let mut tracked: Vec<_> = self.swarms().iter().map(|(h, s)| (*h, s.peers.len())).collect();
        tracked.sort();
        tracked
    }

    pub fn announce(
        &self,
        request: &AnnounceRequest,
        from: IpAddr,
        now: Instant,
    ) -> Result<AnnounceResponse, AnnounceError> {
        let mut swarms = self.swarms();
        let swarm = swarms
            .get_mut(&request.info_hash)
            .ok_or(AnnounceError::UnknownInfoHash)?;

        let expiry = self.interval * 2;
        swarm
            .peers
            .retain(|_, p| now.saturating_duration_since(p.last_seen) < expiry);

        if request.event == Some(AnnounceEvent::Stopped) {
            debug!("{:?} left {}", request.peer_id, request.info_hash);
            swarm.peers.remove(&request.peer_id);
        } else {
            swarm.peers.insert(
                request.peer_id,
                TrackedPeer {
                    addr: SocketAddr::new(from, request.port),
                    seeder: request.left == Some(0),
                    last_seen: now,
                },
            );
        }

        let complete = swarm.peers.values().filter(|p| p.seeder).count();
        let peers = swarm
            .peers
            .iter()
            .filter(|(id, _)| **id != request.peer_id)
            .map(|(id, p)| (*id, p.addr))
            .collect();

        Ok(AnnounceResponse {
            interval: self.interval,
            complete,
            incomplete: swarm.peers.len() - complete,
            peers,
            compact: request.compact,
        })
    }

    /// Answers the query of an announce GET with a bencoded body, refusals included
    pub fn handle_query(&self, query: &[u8], from: IpAddr) -> Vec<u8> {
        let answer = parse_announce_query(query).and_then(|request| self.announce(&request, from, Instant::now()));
        match answer {
            Ok(response) => response.to_bytes(),
            Err(e) => {
                debug!("refusing announce from {from}: {e}");
                failure_response(&e)
            }
        }
    }
}

use crate::bencode::{self, BencodeView};
use crate::config::Config;
use crate::defs::{InfoHash, PeerId};
use crate::error::TrackerError;
use crate::swarm::{SwarmHandle, TorrentSwarmStats};
use anyhow::bail;
use reqwest::Client;
use std::fmt::{self, Display};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::form_urlencoded;

/// Pause between failed attempts at the first announce
pub const STARTUP_RETRY: Duration = Duration::from_secs(5);

/// A peer the tracker told us about. Compact responses carry no peer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerPeer {
    pub peer_id: Option<PeerId>,
    pub addr: SocketAddr,
}

/// The useful part of an announce response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerInfo {
    pub interval: Duration,
    pub peers: Vec<TrackerPeer>,
    pub complete: Option<u64>,
    pub incomplete: Option<u64>,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Completed,
    Stopped,
}

impl AnnounceEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Completed => "completed",
            AnnounceEvent::Stopped => "stopped",
        }
    }
}

impl Display for AnnounceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn malformed(what: impl Into<String>) -> TrackerError {
    TrackerError::Malformed(what.into())
}

fn non_negative(item: BencodeView, key: &str) -> Result<u64, TrackerError> {
    match item {
        BencodeView::Integer(i) => i
            .try_into()
            .map_err(|_| malformed(format!("{key} is negative"))),
        _ => Err(malformed(format!("{key} needs to be an integer"))),
    }
}

fn parse_dict_peer(item: BencodeView) -> Result<Option<TrackerPeer>, TrackerError> {
    let BencodeView::Dictionary(mut dict) = item else {
        return Err(malformed("peer entry needs to be a dict"));
    };

    let peer_id = match dict.remove(b"peer id".as_slice()) {
        Some(BencodeView::ByteString(id)) => PeerId::from_bytes(id),
        _ => None,
    };
    let Some(BencodeView::ByteString(ip)) = dict.remove(b"ip".as_slice()) else {
        return Err(malformed("peer entry without ip"));
    };
    let Some(port) = dict.remove(b"port".as_slice()) else {
        return Err(malformed("peer entry without port"));
    };
    let port: u16 = non_negative(port, "port")?
        .try_into()
        .map_err(|_| malformed("port out of range"))?;

    // host names are not resolved, trackers hand out addresses in practice
    let ip = std::str::from_utf8(ip).ok().and_then(|s| s.parse::<IpAddr>().ok());
    Ok(ip.map(|ip| TrackerPeer {
        peer_id,
        addr: SocketAddr::new(ip, port),
    }))
}

fn parse_compact_peers(bytes: &[u8]) -> Vec<TrackerPeer> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            TrackerPeer {
                peer_id: None,
                addr: SocketAddr::new(IpAddr::V4(ip), port),
            }
        })
        .collect()
}

/// `peers6`: 16 address bytes and a port per peer
fn parse_compact_peers6(bytes: &[u8]) -> Vec<TrackerPeer> {
    bytes
        .chunks_exact(18)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            TrackerPeer {
                peer_id: None,
                addr: SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port),
            }
        })
        .collect()
}

/// Parses a bencoded announce response. A `failure reason` turns the whole response into an
/// error, whatever else it contains.
pub fn parse_tracker_response(bytes: &[u8]) -> Result<TrackerInfo, TrackerError> {
    let mut dict = bencode::parse_dict(bytes).map_err(|e| malformed(e.to_string()))?;

    if let Some(reason) = dict.remove(b"failure reason".as_slice()) {
        let reason = match reason {
            BencodeView::ByteString(s) => String::from_utf8_lossy(s).into_owned(),
            _ => "unreadable failure reason".to_string(),
        };
        return Err(TrackerError::Failure(reason));
    }

    let Some(interval) = dict.remove(b"interval".as_slice()) else {
        return Err(malformed("missing interval"));
    };
    let interval = Duration::from_secs(non_negative(interval, "interval")?);

    let mut peers = match dict.remove(b"peers".as_slice()) {
        Some(BencodeView::List(list)) => list
            .into_iter()
            .filter_map(|item| parse_dict_peer(item).transpose())
            .collect::<Result<Vec<_>, _>>()?,
        Some(BencodeView::ByteString(compact)) => parse_compact_peers(compact),
        Some(_) => return Err(malformed("peers needs to be a list or a string")),
        None => vec![],
    };
    if let Some(BencodeView::ByteString(compact)) = dict.remove(b"peers6".as_slice()) {
        peers.extend(parse_compact_peers6(compact));
    }

    let complete = dict
        .remove(b"complete".as_slice())
        .map(|c| non_negative(c, "complete"))
        .transpose()?;
    let incomplete = dict
        .remove(b"incomplete".as_slice())
        .map(|c| non_negative(c, "incomplete"))
        .transpose()?;
    let warning = match dict.remove(b"warning message".as_slice()) {
        Some(BencodeView::ByteString(s)) => Some(String::from_utf8_lossy(s).into_owned()),
        _ => None,
    };

    Ok(TrackerInfo {
        interval,
        peers,
        complete,
        incomplete,
        warning,
    })
}

/// Builds the announce GET url, the raw hashes are percent encoded byte by byte
pub fn announce_url(
    tracker: &str,
    info_hash: &InfoHash,
    peer_id: &PeerId,
    port: u16,
    stats: &TorrentSwarmStats,
    event: Option<AnnounceEvent>,
) -> String {
    let info_hash: String = form_urlencoded::byte_serialize(info_hash.as_bytes()).collect();
    let peer_id: String = form_urlencoded::byte_serialize(peer_id.as_bytes()).collect();
    let separator = if tracker.contains('?') { '&' } else { '?' };

    let mut url = format!(
        "{tracker}{separator}info_hash={info_hash}&peer_id={peer_id}&port={port}&uploaded={uploaded}&downloaded={downloaded}&left={left}",
        uploaded = stats.uploaded,
        downloaded = stats.downloaded,
        left = stats.left,
    );
    if let Some(event) = event {
        url.push_str("&event=");
        url.push_str(event.as_str());
    }
    url
}

/// Keeps one swarm announced to its tracker: a few tries to get started, then polling until told
/// to stop, then a last `stopped` announce.
#[derive(Debug)]
pub struct TrackerClient {
    tracker: String,
    info_hash: InfoHash,
    local_id: PeerId,
    port: u16,
    http: Client,

    stats: watch::Receiver<TorrentSwarmStats>,
    swarm: SwarmHandle,

    sleep: Duration,
    attempts: usize,
    retry: Duration,
    stop_grace: Duration,
}

impl TrackerClient {
    pub fn new(
        tracker: String,
        info_hash: InfoHash,
        local_id: PeerId,
        config: &Config,
        stats: watch::Receiver<TorrentSwarmStats>,
        swarm: SwarmHandle,
    ) -> Self {
        TrackerClient {
            tracker,
            info_hash,
            local_id,
            port: config.listen_addr.port(),
            http: Client::new(),
            stats,
            swarm,
            sleep: config.tracker_sleep,
            attempts: config.initial_announce_attempts,
            retry: STARTUP_RETRY.min(config.tracker_sleep),
            stop_grace: config.shutdown_grace,
        }
    }

    /// Performs one announce with the current stats. Peers are only handed to the swarm by the
    /// caller, a failed announce adds nothing.
    #[tracing::instrument(skip(self), fields(tracker = %self.tracker))]
    pub async fn announce(&self, event: Option<AnnounceEvent>) -> Result<TrackerInfo, TrackerError> {
        let stats = self.stats.borrow().clone();
        let url = announce_url(&self.tracker, &self.info_hash, &self.local_id, self.port, &stats, event);
        debug!("announcing to {url}");

        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::Status(status.as_u16()));
        }
        let bytes = response.bytes().await?;

        let info = parse_tracker_response(&bytes)?;
        if let Some(warning) = &info.warning {
            warn!("tracker warns: {warning}");
        }
        debug!(
            "tracker answered with {} peers, next poll in {:?}",
            info.peers.len(),
            info.interval
        );
        Ok(info)
    }

    async fn announce_and_feed(&self, event: Option<AnnounceEvent>) -> Result<Duration, TrackerError> {
        let info = self.announce(event).await?;
        let interval = info.interval;
        if !info.peers.is_empty() {
            self.swarm.discovered_peers(info.peers).await;
        }
        Ok(interval)
    }

    /// The `started` announce. Gives up after the configured number of attempts.
    async fn start(&self, stop: &CancellationToken) -> anyhow::Result<Option<Duration>> {
        for attempt in 1..=self.attempts {
            match self.announce_and_feed(Some(AnnounceEvent::Started)).await {
                Ok(interval) => {
                    info!("announced to {}", self.tracker);
                    return Ok(Some(interval));
                }
                Err(e) => warn!("announce attempt {attempt}/{} failed: {e}", self.attempts),
            }

            if attempt < self.attempts {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => return Ok(None),
                    _ = sleep(self.retry) => {}
                }
            }
        }
        bail!("tracker {} unreachable after {} attempts", self.tracker, self.attempts)
    }

    /// Runs until `stop` fires. Only fails when the tracker never answered the first announce.
    pub async fn run(self, stop: CancellationToken) -> anyhow::Result<()> {
        let Some(mut interval) = self.start(&stop).await? else {
            return Ok(());
        };
        let mut last_poll = Instant::now();
        // a session that starts out complete has nothing to report
        let mut reported_complete = self.stats.borrow().completed;

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = sleep(self.sleep) => {}
            }

            let just_completed = !reported_complete && self.stats.borrow().completed;
            let due = just_completed || last_poll.elapsed() >= interval || self.swarm.needs_peers().await;
            if !due {
                continue;
            }

            let event = just_completed.then_some(AnnounceEvent::Completed);
            match self.announce_and_feed(event).await {
                Ok(next) => {
                    interval = next;
                    reported_complete |= just_completed;
                }
                Err(e) => warn!("announce failed, retrying next round: {e}"),
            }
            last_poll = Instant::now();
        }

        match timeout(self.stop_grace, self.announce(Some(AnnounceEvent::Stopped))).await {
            Ok(Ok(_)) => debug!("sent stopped to {}", self.tracker),
            Ok(Err(e)) => debug!("stopped announce failed: {e}"),
            Err(_) => debug!("stopped announce timed out"),
        }
        Ok(())
    }
}

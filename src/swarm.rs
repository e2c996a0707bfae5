use crate::bitset::BitSet;
use crate::choker::{self, PeerView};
use crate::config::Config;
use crate::defs::{Identity, PeerId};
use crate::monitor::StatsReporter;
use crate::peer::outbound::Outbound;
use crate::peer::state::PeerState;
use crate::peer::{self, PeerContext, PeerHandle, PeerKey};
use crate::storage::TorrentStorageHandle;
use crate::torrent::Torrent;
use crate::tracker_client::TrackerPeer;
use anyhow::anyhow;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Session wide byte totals, bumped by the connections as data moves
#[derive(Debug, Default)]
pub struct SwarmCounters {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
}

impl SwarmCounters {
    pub fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Takes back bytes that turned out to be garbage
    pub fn deduct_downloaded(&self, bytes: u64) {
        let _ = self
            .downloaded
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| Some(d.saturating_sub(bytes)));
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TorrentSwarmStats {
    pub uploaded: u64,
    pub downloaded: u64,
    /// how many bytes we don't have yet
    pub left: u64,
    /// how many pieces we don't have yet
    pub needed: usize,
    pub peers: usize,
    /// flips to true once, when the last piece is verified
    pub completed: bool,
}

pub enum SwarmCommand {
    Register {
        identity: Identity,
        state: Arc<RwLock<PeerState>>,
        outbound: Arc<Outbound>,
        closed: CancellationToken,
        reply: oneshot::Sender<Option<PeerKey>>,
    },
    Disconnected(PeerKey),
    WantPiece {
        key: PeerKey,
        have: BitSet,
        /// pieces this connection is already fetching
        busy: Vec<u32>,
        reply: oneshot::Sender<Option<u32>>,
    },
    WantsAny {
        have: BitSet,
        reply: oneshot::Sender<bool>,
    },
    GotPiece {
        key: PeerKey,
        piece: u32,
        data: Vec<u8>,
        reply: oneshot::Sender<bool>,
    },
    Interest {
        key: PeerKey,
        interested: bool,
    },
    NeedsPeers {
        reply: oneshot::Sender<bool>,
    },
    DiscoveredPeers(Vec<TrackerPeer>),
    DialFinished(SocketAddr),
    StorageFault(String),
    Halt {
        reply: oneshot::Sender<()>,
    },
}

/// Handle for talking to the coordinator task. Every call degrades to a harmless answer once the
/// coordinator is gone.
#[derive(Debug, Clone)]
pub struct SwarmHandle {
    tx: mpsc::Sender<SwarmCommand>,
    counters: Arc<SwarmCounters>,
}

impl SwarmHandle {
    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> SwarmCommand) -> Option<T> {
        let (syn, ack) = oneshot::channel();
        self.tx.send(make(syn)).await.ok()?;
        ack.await.ok()
    }

    async fn tell(&self, command: SwarmCommand) {
        let _ = self.tx.send(command).await;
    }

    pub fn counters(&self) -> Arc<SwarmCounters> {
        self.counters.clone()
    }

    /// Admit a freshly handshaken connection, `None` if it should be dropped
    pub async fn register(
        &self,
        identity: Identity,
        state: Arc<RwLock<PeerState>>,
        outbound: Arc<Outbound>,
        closed: CancellationToken,
    ) -> Option<PeerKey> {
        self.ask(|reply| SwarmCommand::Register {
            identity,
            state,
            outbound,
            closed,
            reply,
        })
        .await
        .flatten()
    }

    pub async fn disconnected(&self, key: PeerKey) {
        self.tell(SwarmCommand::Disconnected(key)).await
    }

    pub async fn want_piece(&self, key: PeerKey, have: BitSet, busy: Vec<u32>) -> Option<u32> {
        self.ask(|reply| SwarmCommand::WantPiece { key, have, busy, reply })
            .await
            .flatten()
    }

    pub async fn wants_any(&self, have: BitSet) -> bool {
        self.ask(|reply| SwarmCommand::WantsAny { have, reply })
            .await
            .unwrap_or(false)
    }

    /// Hands over a fully reassembled piece, true if it verified
    pub async fn got_piece(&self, key: PeerKey, piece: u32, data: Vec<u8>) -> bool {
        self.ask(|reply| SwarmCommand::GotPiece { key, piece, data, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn interest(&self, key: PeerKey, interested: bool) {
        self.tell(SwarmCommand::Interest { key, interested }).await
    }

    pub async fn needs_peers(&self) -> bool {
        self.ask(|reply| SwarmCommand::NeedsPeers { reply })
            .await
            .unwrap_or(false)
    }

    pub async fn discovered_peers(&self, peers: Vec<TrackerPeer>) {
        self.tell(SwarmCommand::DiscoveredPeers(peers)).await
    }

    async fn dial_finished(&self, addr: SocketAddr) {
        self.tell(SwarmCommand::DialFinished(addr)).await
    }

    pub async fn storage_fault(&self, reason: String) {
        self.tell(SwarmCommand::StorageFault(reason)).await
    }

    /// Disconnects everyone and waits for the coordinator to wind down
    pub async fn halt(&self) {
        let _ = self.ask(|reply| SwarmCommand::Halt { reply }).await;
    }

    /// A handle wired to a bare receiver, for driving a connection without a coordinator
    #[cfg(test)]
    pub(crate) fn detached() -> (SwarmHandle, mpsc::Receiver<SwarmCommand>) {
        let (tx, rx) = mpsc::channel(64);
        let handle = SwarmHandle {
            tx,
            counters: Arc::new(SwarmCounters::default()),
        };
        (handle, rx)
    }
}

/// The coordinator: owns the peer list and the wantlist of one torrent and processes one command
/// at a time
pub struct TorrentSwarm {
    torrent: Arc<Torrent>,
    storage: TorrentStorageHandle,
    local_id: PeerId,

    peers: Vec<PeerHandle>,
    /// addresses being dialed that haven't registered yet
    pending: HashSet<SocketAddr>,
    next_key: u64,

    /// pieces we still need, in a random order that rotates as pieces get handed out
    wanted: Vec<u32>,

    max_connections: usize,
    max_uploaders: usize,
    pipeline: usize,
    choke_interval: Duration,
    monitor_interval: Duration,

    counters: Arc<SwarmCounters>,
    stat: TorrentSwarmStats,
    stat_snapshot_tx: watch::Sender<TorrentSwarmStats>,
    reporter: StatsReporter,

    inbound_msgs: mpsc::Receiver<SwarmCommand>,
    /// we keep a handle so we can clone it and give it to the connections we spawn
    handle: SwarmHandle,

    halted: Option<oneshot::Sender<()>>,
}

impl TorrentSwarm {
    pub fn new(
        storage: TorrentStorageHandle,
        local_id: PeerId,
        config: &Config,
    ) -> (TorrentSwarm, SwarmHandle, watch::Receiver<TorrentSwarmStats>) {
        let torrent = storage.torrent().clone();
        let bits = storage.bitfield();
        let mut wanted: Vec<u32> = (0..torrent.piece_count()).filter(|p| !bits.has(*p)).collect();
        wanted.shuffle(&mut rand::rng());

        let counters = Arc::new(SwarmCounters::default());
        let stat = TorrentSwarmStats {
            uploaded: 0,
            downloaded: 0,
            left: storage.left(),
            needed: storage.needed(),
            peers: 0,
            completed: storage.needed() == 0,
        };
        let (stat_tx, stat_rx) = watch::channel(stat.clone());

        let (command_tx, command_rx) = mpsc::channel(512);
        let handle = SwarmHandle {
            tx: command_tx,
            counters: counters.clone(),
        };

        let swarm = TorrentSwarm {
            torrent,
            storage,
            local_id,
            peers: vec![],
            pending: HashSet::new(),
            next_key: 0,
            wanted,
            max_connections: config.max_connections,
            max_uploaders: config.max_uploaders,
            pipeline: config.pipeline,
            choke_interval: config.choke_interval,
            monitor_interval: config.monitor_interval,
            counters,
            reporter: StatsReporter::new(&stat, std::time::Instant::now()),
            stat,
            stat_snapshot_tx: stat_tx,
            inbound_msgs: command_rx,
            handle: handle.clone(),
            halted: None,
        };

        (swarm, handle, stat_rx)
    }

    pub fn peer_context(&self) -> PeerContext {
        PeerContext {
            torrent: self.torrent.clone(),
            storage: self.storage.clone(),
            swarm: self.handle.clone(),
            local_id: self.local_id,
            pipeline: self.pipeline,
        }
    }

    /// Runs until halted. An error means the session can't go on, storage is broken.
    pub async fn work_loop(mut self) -> anyhow::Result<()> {
        let mut choke_ticker = interval_at(Instant::now() + self.choke_interval, self.choke_interval);
        let mut monitor_ticker = interval_at(Instant::now() + self.monitor_interval, self.monitor_interval);

        loop {
            tokio::select! {
                _ = choke_ticker.tick(), if self.halted.is_none() => self.rebalance(),
                _ = monitor_ticker.tick() => self.report(),
                command = self.inbound_msgs.recv() => {
                    // we hold a sender ourselves, so this never runs dry
                    let Some(command) = command else { break };
                    if let Err(e) = self.process_command(command).await {
                        error!("coordinator stopping: {e:#}");
                        self.disconnect_all();
                        return Err(e);
                    }
                }
            }

            if self.halted.is_some() && self.peers.is_empty() {
                if let Some(reply) = self.halted.take() {
                    let _ = reply.send(());
                }
                break;
            }
        }

        info!("coordinator stopped");
        Ok(())
    }

    async fn process_command(&mut self, command: SwarmCommand) -> anyhow::Result<()> {
        match command {
            SwarmCommand::Register {
                identity,
                state,
                outbound,
                closed,
                reply,
            } => {
                let key = self.register(identity, state, outbound, closed);
                let _ = reply.send(key);
            }
            SwarmCommand::Disconnected(key) => self.remove_peer(key),
            SwarmCommand::WantPiece { key, have, busy, reply } => {
                let _ = reply.send(self.want_piece(key, &have, &busy));
            }
            SwarmCommand::WantsAny { have, reply } => {
                let _ = reply.send(self.wants_any(&have));
            }
            SwarmCommand::GotPiece { key, piece, data, reply } => {
                let res = self.got_piece(key, piece, data).await;
                let _ = reply.send(*res.as_ref().unwrap_or(&false));
                res?;
            }
            SwarmCommand::Interest { key, interested } => self.interest(key, interested),
            SwarmCommand::NeedsPeers { reply } => {
                let _ = reply.send(self.needs_peers());
            }
            SwarmCommand::DiscoveredPeers(peers) => self.dial(peers),
            SwarmCommand::DialFinished(addr) => {
                self.pending.remove(&addr);
            }
            SwarmCommand::StorageFault(reason) => return Err(anyhow!("storage failure: {reason}")),
            SwarmCommand::Halt { reply } => {
                info!("halting, disconnecting {} peers", self.peers.len());
                self.halted = Some(reply);
                self.disconnect_all();
            }
        }

        Ok(())
    }

    fn register(
        &mut self,
        identity: Identity,
        state: Arc<RwLock<PeerState>>,
        outbound: Arc<Outbound>,
        closed: CancellationToken,
    ) -> Option<PeerKey> {
        self.pending.remove(&identity.addr);

        if self.halted.is_some() {
            return None;
        }
        if identity.peer_id == self.local_id {
            debug!("dropping a connection to ourselves");
            return None;
        }
        if self
            .peers
            .iter()
            .any(|p| p.identity == identity || p.identity.peer_id == identity.peer_id)
        {
            debug!("already connected to {identity}");
            return None;
        }
        if self.peers.len() >= self.max_connections {
            return None;
        }

        let key = PeerKey(self.next_key);
        self.next_key += 1;

        let handle = PeerHandle::new(key, identity, state, outbound, closed);
        let bits = self.storage.bitfield();
        if !bits.is_empty() {
            handle.send_bitfield(&bits);
        }
        self.peers.push(handle);
        self.publish_stats();

        Some(key)
    }

    fn remove_peer(&mut self, key: PeerKey) {
        self.peers.retain(|p| p.key != key);
        self.publish_stats();
    }

    fn find(&self, key: PeerKey) -> Option<&PeerHandle> {
        self.peers.iter().find(|p| p.key == key)
    }

    /// First wanted piece the remote has, which then goes to the back of the list so the next
    /// caller gets a different one
    fn want_piece(&mut self, key: PeerKey, have: &BitSet, busy: &[u32]) -> Option<u32> {
        let i = self
            .wanted
            .iter()
            .position(|p| have.has(*p) && !busy.contains(p))?;
        let piece = self.wanted.remove(i);
        self.wanted.push(piece);
        debug!(piece, "handing out to {key}");
        Some(piece)
    }

    fn wants_any(&self, have: &BitSet) -> bool {
        self.wanted.iter().any(|p| have.has(*p))
    }

    async fn got_piece(&mut self, key: PeerKey, piece: u32, data: Vec<u8>) -> anyhow::Result<bool> {
        let Some(i) = self.wanted.iter().position(|p| *p == piece) else {
            // someone else beat them to it
            return Ok(true);
        };

        let len = data.len() as u64;
        if !self.storage.put_piece(piece, data).await? {
            warn!(piece, "hash check failed, penalizing {key}");
            if let Some(peer) = self.find(key) {
                peer.penalize(len);
            }
            self.counters.deduct_downloaded(len);
            return Ok(false);
        }

        self.wanted.remove(i);
        for peer in &self.peers {
            peer.send_have(piece);
        }

        let newly_complete = self.storage.needed() == 0 && !self.stat.completed;
        self.publish_stats();
        if newly_complete {
            info!("download of {} complete", self.torrent.name);
        }

        Ok(true)
    }

    fn uploaders(&self) -> usize {
        self.peers.iter().filter(|p| !p.state().choked_them).count()
    }

    /// A peer that just became interested gets a slot straight away if one is free
    fn interest(&mut self, key: PeerKey, interested: bool) {
        if !interested {
            return;
        }
        if self.uploaders() >= self.max_uploaders {
            return;
        }
        if let Some(peer) = self.find(key).filter(|p| p.state().choked_them) {
            debug!("unchoking newly interested {key}");
            peer.set_choking(false);
        }
    }

    fn needs_peers(&self) -> bool {
        self.halted.is_none() && self.peers.len() + self.pending.len() < self.max_connections
    }

    fn dial(&mut self, discovered: Vec<TrackerPeer>) {
        for candidate in discovered {
            if !self.needs_peers() {
                break;
            }
            if candidate.peer_id == Some(self.local_id) || self.pending.contains(&candidate.addr) {
                continue;
            }
            let known = self.peers.iter().any(|p| {
                p.identity.addr == candidate.addr || Some(p.identity.peer_id) == candidate.peer_id
            });
            if known {
                continue;
            }

            self.pending.insert(candidate.addr);
            let ctx = self.peer_context();
            let swarm = self.handle.clone();
            let addr = candidate.addr;
            tokio::spawn(async move {
                if let Err(e) = peer::connect(ctx, addr).await {
                    debug!("connection to {addr} ended: {e:#}");
                }
                swarm.dial_finished(addr).await;
            });
        }
    }

    fn disconnect_all(&self) {
        for peer in &self.peers {
            peer.disconnect();
        }
    }

    /// One round of choking, also samples and resets every connection's interval counters
    fn rebalance(&mut self) {
        let views: Vec<PeerView> = self
            .peers
            .iter()
            .map(|p| {
                let (_, downloaded) = p.take_counters();
                let s = p.state();
                PeerView {
                    key: p.key,
                    choked_them: s.choked_them,
                    choked_us: s.choked_us,
                    interested_us: s.interested_us,
                    interested_them: s.interested_them,
                    downloaded,
                }
            })
            .collect();

        let plan = choker::plan(&views, self.max_uploaders);
        for peer in &self.peers {
            if plan.choke.contains(&peer.key) {
                debug!("choking {}", peer.key);
                peer.set_choking(true);
            } else if plan.unchoke.contains(&peer.key) {
                debug!("unchoking {}", peer.key);
                peer.set_choking(false);
            }
        }

        // stable, so untouched peers keep their order ahead of the ones we just dealt with
        let touched: HashSet<PeerKey> = plan.touched().copied().collect();
        self.peers.sort_by_key(|p| touched.contains(&p.key));
    }

    fn publish_stats(&mut self) {
        self.stat.uploaded = self.counters.uploaded();
        self.stat.downloaded = self.counters.downloaded();
        self.stat.left = self.storage.left();
        self.stat.needed = self.storage.needed();
        self.stat.peers = self.peers.len();
        // once complete, always complete
        self.stat.completed |= self.stat.needed == 0;
        let _ = self.stat_snapshot_tx.send(self.stat.clone());
    }

    fn report(&mut self) {
        self.publish_stats();
        let report = self.reporter.sample(
            &self.stat,
            self.torrent.piece_count() as usize,
            std::time::Instant::now(),
        );
        info!("{report}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::BtMessage;
    use sha1::{Digest, Sha1};
    use std::path::Path;

    async fn swarm(dir: &Path, seed: bool) -> (TorrentSwarm, Vec<u8>) {
        let data: Vec<u8> = (0..4 * 1024u32).map(|i| (i % 199) as u8).collect();
        let src = dir.join("blob");
        std::fs::write(&src, &data).unwrap();
        let torrent = Arc::new(Torrent::create(&src, "http://t/announce", 1024).unwrap());

        let base = if seed { dir.to_path_buf() } else { dir.join("dl") };
        let storage = TorrentStorageHandle::open(torrent, base).await.unwrap();
        let (swarm, _, _) = TorrentSwarm::new(storage, PeerId([9u8; 20]), &Config::default());
        (swarm, data)
    }

    fn add_peer(swarm: &mut TorrentSwarm, id: u8) -> (Option<PeerKey>, Arc<Outbound>, Arc<RwLock<PeerState>>) {
        let state = Arc::new(RwLock::new(PeerState::default()));
        let outbound = Arc::new(Outbound::default());
        let identity = Identity::new(PeerId([id; 20]), format!("127.0.0.1:{}", 7000 + id as u16).parse().unwrap());
        let key = swarm.register(identity, state.clone(), outbound.clone(), CancellationToken::new());
        (key, outbound, state)
    }

    #[tokio::test]
    async fn admission_rejects_self_and_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let (mut swarm, _) = swarm(dir.path(), false).await;

        assert!(add_peer(&mut swarm, 1).0.is_some());
        assert!(add_peer(&mut swarm, 1).0.is_none());
        assert!(add_peer(&mut swarm, 9).0.is_none());
        assert_eq!(swarm.peers.len(), 1);

        swarm.max_connections = 2;
        assert!(add_peer(&mut swarm, 2).0.is_some());
        assert!(add_peer(&mut swarm, 3).0.is_none());
        assert!(!swarm.needs_peers());
    }

    #[tokio::test]
    async fn seeders_send_their_bitfield_on_register() {
        let dir = tempfile::tempdir().unwrap();
        let (mut swarm, _) = swarm(dir.path(), true).await;
        assert!(swarm.stat.completed);

        let (_, outbound, _) = add_peer(&mut swarm, 1);
        let Some(BtMessage::BitField(bits)) = outbound.pop_next() else {
            panic!("expected a bitfield");
        };
        assert_eq!(&*bits.has, &[0b1111_0000]);
    }

    #[tokio::test]
    async fn wanted_pieces_rotate() {
        let dir = tempfile::tempdir().unwrap();
        let (mut swarm, _) = swarm(dir.path(), false).await;
        let key = PeerKey(0);

        let mut all = BitSet::new(4);
        for i in 0..4 {
            all.set(i).unwrap();
        }

        let first = swarm.want_piece(key, &all, &[]).unwrap();
        let second = swarm.want_piece(key, &all, &[]).unwrap();
        assert_ne!(first, second);
        assert_eq!(swarm.wanted.last(), Some(&second));
        assert_eq!(swarm.wanted.len(), 4);

        assert_eq!(swarm.want_piece(key, &BitSet::new(4), &[]), None);
        assert!(!swarm.wants_any(&BitSet::new(4)));
        let busy: Vec<u32> = (0..4).collect();
        assert_eq!(swarm.want_piece(key, &all, &busy), None);
    }

    #[tokio::test]
    async fn verified_piece_is_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let (mut swarm, data) = swarm(dir.path(), false).await;
        let (key, a, _) = add_peer(&mut swarm, 1);
        let (_, b, _) = add_peer(&mut swarm, 2);
        let key = key.unwrap();

        assert!(swarm.got_piece(key, 2, data[2048..3072].to_vec()).await.unwrap());
        assert_eq!(a.pop_next(), Some(BtMessage::Have(crate::wire::Have { piece: 2 })));
        assert_eq!(b.pop_next(), Some(BtMessage::Have(crate::wire::Have { piece: 2 })));
        assert!(!swarm.wanted.contains(&2));
        assert_eq!(swarm.stat.needed, 3);

        // a late duplicate is accepted without a second broadcast
        assert!(swarm.got_piece(key, 2, data[2048..3072].to_vec()).await.unwrap());
        assert!(a.is_empty());
    }

    #[tokio::test]
    async fn bad_piece_is_charged_to_the_sender() {
        let dir = tempfile::tempdir().unwrap();
        let (mut swarm, _) = swarm(dir.path(), false).await;
        let (key, outbound, state) = add_peer(&mut swarm, 1);
        state.write().unwrap().downloaded = 3000;
        swarm.counters.add_downloaded(3000);

        let garbage = vec![0u8; 1024];
        assert_ne!(Sha1::digest(&garbage).as_slice(), &swarm.torrent.pieces[1]);
        assert!(!swarm.got_piece(key.unwrap(), 1, garbage).await.unwrap());

        assert_eq!(state.read().unwrap().downloaded, 1976);
        assert_eq!(swarm.counters.downloaded(), 1976);
        assert!(swarm.wanted.contains(&1));
        assert_eq!(swarm.storage.needed(), 4);
        assert!(!swarm.storage.has(1));
        assert!(outbound.is_empty());
    }

    #[tokio::test]
    async fn completion_is_published_once() {
        let dir = tempfile::tempdir().unwrap();
        let (mut swarm, data) = swarm(dir.path(), false).await;
        let mut stats = swarm.stat_snapshot_tx.subscribe();
        assert!(!stats.borrow_and_update().completed);

        for piece in 0..4u32 {
            let start = piece as usize * 1024;
            assert!(swarm.got_piece(PeerKey(0), piece, data[start..start + 1024].to_vec()).await.unwrap());
        }
        assert!(stats.borrow_and_update().completed);
        assert_eq!(swarm.stat.left, 0);
        assert!(swarm.wanted.is_empty());
    }

    #[tokio::test]
    async fn interested_peer_gets_a_free_slot() {
        let dir = tempfile::tempdir().unwrap();
        let (mut swarm, _) = swarm(dir.path(), true).await;
        let (key, outbound, state) = add_peer(&mut swarm, 1);
        let _ = outbound.pop_next();

        swarm.interest(key.unwrap(), true);
        assert!(!state.read().unwrap().choked_them);
        assert_eq!(outbound.pop_next(), Some(BtMessage::Unchoke(crate::wire::Unchoke)));

        swarm.max_uploaders = 1;
        let (key, outbound, state) = add_peer(&mut swarm, 2);
        let _ = outbound.pop_next();
        swarm.interest(key.unwrap(), true);
        assert!(state.read().unwrap().choked_them);
    }

    #[tokio::test]
    async fn rebalance_moves_touched_peers_to_the_back() {
        let dir = tempfile::tempdir().unwrap();
        let (mut swarm, _) = swarm(dir.path(), true).await;
        add_peer(&mut swarm, 1);
        let (eager_key, _, eager) = add_peer(&mut swarm, 2);
        eager.write().unwrap().interested_us = true;

        swarm.rebalance();
        assert!(!eager.read().unwrap().choked_them);
        assert_eq!(swarm.peers.last().map(|p| p.key), eager_key);
    }

    #[tokio::test]
    async fn halt_finishes_once_peers_are_gone() {
        let dir = tempfile::tempdir().unwrap();
        let (swarm, _) = swarm(dir.path(), true).await;
        let handle = swarm.handle.clone();
        let task = tokio::spawn(swarm.work_loop());

        handle.halt().await;
        task.await.unwrap().unwrap();
        assert!(!handle.needs_peers().await);
    }
}

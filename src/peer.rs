pub mod outbound;
pub mod state;

use crate::bitset::BitSet;
use crate::defs::{Identity, PeerId};
use crate::error::ProtocolViolation;
use crate::storage::TorrentStorageHandle;
use crate::swarm::{SwarmCounters, SwarmHandle};
use crate::torrent::Torrent;
use crate::wire::{
    BitField, BtDecoder, BtEncoder, BtMessage, Choke, Have, Interested, MAX_REQUEST, NotInterested, Piece, Request,
    Unchoke, accept_handshake, initiate_handshake,
};
use anyhow::Context;
use futures::StreamExt;
use outbound::{Outbound, write_loop};
use state::{PeerState, Pipeline, Reassembly};
use std::fmt::{self, Display};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A connection that says nothing for this long is dropped
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Stable handle the coordinator hands out per connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerKey(pub u64);

impl Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Everything a connection needs from the rest of the session
#[derive(Debug, Clone)]
pub struct PeerContext {
    pub torrent: Arc<Torrent>,
    pub storage: TorrentStorageHandle,
    pub swarm: SwarmHandle,
    pub local_id: PeerId,
    pub pipeline: usize,
}

/// The coordinator's view of a live connection
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub key: PeerKey,
    pub identity: Identity,
    pub state: Arc<RwLock<PeerState>>,
    outbound: Arc<Outbound>,
    closed: CancellationToken,
}

impl PeerHandle {
    pub fn new(
        key: PeerKey,
        identity: Identity,
        state: Arc<RwLock<PeerState>>,
        outbound: Arc<Outbound>,
        closed: CancellationToken,
    ) -> Self {
        PeerHandle {
            key,
            identity,
            state,
            outbound,
            closed,
        }
    }

    pub fn state(&self) -> PeerState {
        match self.state.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn state_mut(&self, f: impl FnOnce(&mut PeerState)) {
        match self.state.write() {
            Ok(mut s) => f(&mut s),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Flips our choke on this peer and tells them
    pub fn set_choking(&self, choke: bool) {
        self.state_mut(|s| s.choked_them = choke);
        if choke {
            self.outbound.push(BtMessage::Choke(Choke));
        } else {
            self.outbound.push(BtMessage::Unchoke(Unchoke));
        }
    }

    pub fn send_have(&self, piece: u32) {
        self.outbound.push(BtMessage::Have(Have { piece }));
    }

    pub fn send_bitfield(&self, bits: &BitSet) {
        self.outbound.push(BtMessage::BitField(BitField { has: bits.to_bytes() }));
    }

    /// Sample-and-reset of the interval counters, `(uploaded, downloaded)`
    pub fn take_counters(&self) -> (u64, u64) {
        let mut sample = (0, 0);
        self.state_mut(|s| sample = s.take_counters());
        sample
    }

    /// Takes `bytes` off the download counter, for data that turned out to be garbage
    pub fn penalize(&self, bytes: u64) {
        self.state_mut(|s| s.downloaded = s.downloaded.saturating_sub(bytes));
    }

    pub fn disconnect(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Dial a peer and run the connection until it ends
#[instrument(skip(ctx))]
pub async fn connect(ctx: PeerContext, addr: SocketAddr) -> anyhow::Result<()> {
    let mut tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .context("connect timed out")?
        .with_context(|| format!("Failed to connect to {addr}"))?;
    let handshake = initiate_handshake(&mut tcp, ctx.torrent.info_hash, ctx.local_id).await?;

    run_connection(ctx, tcp, Identity::new(handshake.peer_id, addr)).await
}

/// Answer a connection someone else opened from `addr`
pub async fn accept<S>(ctx: PeerContext, mut stream: S, addr: SocketAddr) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handshake = accept_handshake(&mut stream, ctx.torrent.info_hash, ctx.local_id).await?;

    run_connection(ctx, stream, Identity::new(handshake.peer_id, addr)).await
}

/// Runs an already handshaken connection. Returns once it is closed, by either side.
pub async fn run_connection<S>(ctx: PeerContext, stream: S, identity: Identity) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let state = Arc::new(RwLock::new(PeerState::default()));
    let outbound = Arc::new(Outbound::default());
    let closed = CancellationToken::new();

    let Some(key) = ctx
        .swarm
        .register(identity, state.clone(), outbound.clone(), closed.clone())
        .await
    else {
        // duplicate or over capacity, the coordinator never knew this connection
        debug!("{identity} was not admitted");
        return Ok(());
    };
    info!("connected to {identity} as {key}");

    let (reader, writer) = tokio::io::split(stream);
    let writer = tokio::spawn(write_loop(
        FramedWrite::new(writer, BtEncoder),
        outbound.clone(),
        state.clone(),
        ctx.swarm.counters(),
        closed.clone(),
    ));

    let swarm = ctx.swarm.clone();
    let mut conn = PeerConnection::new(ctx, key, identity, FramedRead::new(reader, BtDecoder), state, outbound, closed.clone());
    let res = conn.run().await;

    closed.cancel();
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("writing to {identity} failed: {e}"),
        Err(e) => debug!("writer for {identity} died: {e}"),
    }
    swarm.disconnected(key).await;

    match &res {
        Ok(()) => info!("{identity} disconnected"),
        Err(e) => info!("{identity} disconnected: {e:#}"),
    }
    res
}

/// The inbound half of a connection: owns the protocol state machine for it
pub struct PeerConnection<R> {
    ctx: PeerContext,
    key: PeerKey,
    identity: Identity,
    reader: FramedRead<R, BtDecoder>,

    state: Arc<RwLock<PeerState>>,
    outbound: Arc<Outbound>,
    counters: Arc<SwarmCounters>,
    closed: CancellationToken,

    /// what they told us they have, created on their first have or bitfield
    remote: Option<BitSet>,
    got_bitfield: bool,

    pipeline: Pipeline,
    reassembly: Reassembly,
}

impl<R> PeerConnection<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(
        ctx: PeerContext,
        key: PeerKey,
        identity: Identity,
        reader: FramedRead<R, BtDecoder>,
        state: Arc<RwLock<PeerState>>,
        outbound: Arc<Outbound>,
        closed: CancellationToken,
    ) -> Self {
        let counters = ctx.swarm.counters();
        let pipeline = Pipeline::new(ctx.pipeline);
        PeerConnection {
            ctx,
            key,
            identity,
            reader,
            state,
            outbound,
            counters,
            closed,
            remote: None,
            got_bitfield: false,
            pipeline,
            reassembly: Reassembly::default(),
        }
    }

    fn state(&self) -> PeerState {
        match self.state.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn state_mut(&self, f: impl FnOnce(&mut PeerState)) {
        match self.state.write() {
            Ok(mut s) => f(&mut s),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Ok(()),
                frame = tokio::time::timeout(IDLE_TIMEOUT, self.reader.next()) => {
                    let msg = match frame {
                        Err(_) => anyhow::bail!("idle for {} seconds", IDLE_TIMEOUT.as_secs()),
                        Ok(None) => return Ok(()),
                        Ok(Some(msg)) => msg?,
                    };
                    trace!(?msg, "received");
                    self.process_message(msg).await?;
                }
            }
        }
    }

    /// Handles one message from the remote. An error means the connection should end.
    pub async fn process_message(&mut self, msg: BtMessage) -> anyhow::Result<()> {
        match msg {
            BtMessage::KeepAlive(_) => {}
            BtMessage::Choke(_) => self.state_mut(|s| s.choked_us = true),
            BtMessage::Unchoke(_) => {
                self.state_mut(|s| s.choked_us = false);
                if self.state().interested_them {
                    // whatever was outstanding got dropped on their end when they choked us
                    for request in self.pipeline.outstanding() {
                        self.outbound.push(BtMessage::Request(*request));
                    }
                    self.fill_pipeline().await;
                }
            }
            BtMessage::Interested(_) => {
                self.state_mut(|s| s.interested_us = true);
                self.ctx.swarm.interest(self.key, true).await;
            }
            BtMessage::NotInterested(_) => {
                self.state_mut(|s| s.interested_us = false);
                self.ctx.swarm.interest(self.key, false).await;
            }
            BtMessage::Have(Have { piece }) => {
                let count = self.ctx.torrent.piece_count();
                let remote = self.remote.get_or_insert_with(|| BitSet::new(count as usize));
                remote
                    .set(piece as usize)
                    .map_err(|_| ProtocolViolation::PieceOutOfRange(piece))?;
                self.check_interest().await;
            }
            BtMessage::BitField(BitField { has }) => {
                if self.got_bitfield {
                    warn!("{} sent a second bitfield, ignoring it", self.identity);
                    return Ok(());
                }

                let count = self.ctx.torrent.piece_count() as usize;
                let mut bits = BitSet::from_bytes(&has, count).ok_or(ProtocolViolation::BitfieldLength {
                    got: has.len(),
                    expected: count.div_ceil(8),
                })?;
                // haves that came before the bitfield still count
                if let Some(previous) = self.remote.take() {
                    for piece in previous.iter_ones() {
                        let _ = bits.set(piece as usize);
                    }
                }
                self.remote = Some(bits);
                self.got_bitfield = true;
                self.check_interest().await;
            }
            BtMessage::Request(request) => self.serve(request).await?,
            BtMessage::Piece(piece) => self.receive(piece).await,
            BtMessage::Cancel(cancel) => {
                self.outbound.cancel(&cancel.0);
            }
            BtMessage::Unknown(opcode, _) => {
                debug!("{} sent unsupported message type {opcode}", self.identity);
            }
        }

        Ok(())
    }

    /// Answers a request, unless we are choking them or it doesn't make sense
    async fn serve(&mut self, request: Request) -> anyhow::Result<()> {
        if self.state().choked_them {
            trace!(?request, "dropping request from choked peer");
            return Ok(());
        }

        let Some(piece_len) = self.ctx.torrent.nth_piece_size(request.index) else {
            return Ok(());
        };
        let sane = request.begin < piece_len
            && request.length > 0
            && request.length <= MAX_REQUEST
            && request.begin as u64 + request.length as u64 <= piece_len as u64;
        if !sane {
            debug!(?request, "dropping out of range request from {}", self.identity);
            return Ok(());
        }

        match self
            .ctx
            .storage
            .read_block(request.index, request.begin, request.length)
            .await
        {
            Ok(Some(data)) => {
                self.outbound.push(BtMessage::Piece(Piece {
                    index: request.index,
                    begin: request.begin,
                    data: Bytes::from(data),
                }));
                Ok(())
            }
            // a piece we don't have yet
            Ok(None) => Ok(()),
            Err(e) => {
                self.ctx.swarm.storage_fault(format!("{e:#}")).await;
                Err(e)
            }
        }
    }

    async fn receive(&mut self, piece: Piece) {
        let request = piece.request();
        if !self.pipeline.complete(&request) {
            // be wary of strangers sending data you didn't ask for
            debug!(?request, "{} sent a block we never asked for", self.identity);
            self.state_mut(|s| s.downloaded = 0);
            return;
        }

        let len = piece.data.len() as u64;
        self.state_mut(|s| s.downloaded += len);
        self.counters.add_downloaded(len);

        let Some(piece_len) = self.ctx.torrent.nth_piece_size(piece.index) else {
            return;
        };
        if let Some(data) = self.reassembly.add(piece.index, piece.begin, &piece.data, piece_len) {
            let ok = self.ctx.swarm.got_piece(self.key, piece.index, data).await;
            if !ok {
                warn!("piece {} from {} failed to verify", piece.index, self.identity);
            }
        }

        self.fill_pipeline().await;
    }

    /// Become interested when they have something we want
    async fn check_interest(&mut self) {
        let Some(remote) = &self.remote else {
            return;
        };

        if !self.state().interested_them {
            if !self.ctx.swarm.wants_any(remote.clone()).await {
                return;
            }
            self.state_mut(|s| s.interested_them = true);
            self.outbound.push(BtMessage::Interested(Interested));
        }

        self.fill_pipeline().await;
    }

    /// Keeps the request pipeline topped up while they let us download
    async fn fill_pipeline(&mut self) {
        let state = self.state();
        if state.choked_us || !state.interested_them {
            return;
        }
        let Some(remote) = &self.remote else {
            return;
        };

        let torrent = self.ctx.torrent.clone();
        while self.pipeline.has_room() {
            let next = match self.pipeline.continue_piece(|p| torrent.nth_piece_size(p)) {
                Some(next) => next,
                None => {
                    let busy = self.pipeline.pieces().chain(self.reassembly.in_progress()).collect();
                    let picked = self.ctx.swarm.want_piece(self.key, remote.clone(), busy).await;
                    let Some(piece) = picked else {
                        self.pipeline.exhausted();
                        break;
                    };
                    let Some(len) = torrent.nth_piece_size(piece) else {
                        break;
                    };
                    Pipeline::start_piece(piece, len)
                }
            };

            self.pipeline.push(next);
            self.outbound.push(BtMessage::Request(next));
        }

        if self.pipeline.is_empty() {
            self.state_mut(|s| s.interested_them = false);
            self.outbound.push(BtMessage::NotInterested(NotInterested));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::InfoHash;
    use crate::swarm::SwarmCommand;
    use crate::torrent::FileEntry;
    use crate::wire::BLOCK_SIZE;
    use sha1::{Digest, Sha1};
    use tokio::sync::mpsc;

    const PIECE: u32 = 16 * BLOCK_SIZE;

    fn content() -> Vec<u8> {
        (0..8 * PIECE).map(|i| (i % 253) as u8).collect()
    }

    async fn fixture(dir: &std::path::Path) -> (PeerContext, mpsc::Receiver<SwarmCommand>) {
        let data = content();
        let torrent = Torrent::from_parts(
            "http://t/announce".into(),
            "blob".into(),
            PIECE,
            data.chunks(PIECE as usize).map(|c| Sha1::digest(c).into()).collect(),
            vec![FileEntry {
                path: vec![],
                length: data.len() as u64,
            }],
        )
        .unwrap();
        let torrent = Arc::new(torrent);
        let storage = TorrentStorageHandle::open(torrent.clone(), dir.to_path_buf()).await.unwrap();
        let (swarm, commands) = SwarmHandle::detached();

        let ctx = PeerContext {
            torrent,
            storage,
            swarm,
            local_id: PeerId([1u8; 20]),
            pipeline: 5,
        };
        (ctx, commands)
    }

    fn connection(ctx: PeerContext) -> (PeerConnection<tokio::io::Empty>, Arc<Outbound>, Arc<RwLock<PeerState>>) {
        let state = Arc::new(RwLock::new(PeerState::default()));
        let outbound = Arc::new(Outbound::default());
        let identity = Identity::new(PeerId([2u8; 20]), "127.0.0.1:7000".parse().unwrap());
        let conn = PeerConnection::new(
            ctx,
            PeerKey(1),
            identity,
            FramedRead::new(tokio::io::empty(), BtDecoder),
            state.clone(),
            outbound.clone(),
            CancellationToken::new(),
        );
        (conn, outbound, state)
    }

    fn drain(outbound: &Outbound) -> Vec<BtMessage> {
        std::iter::from_fn(|| outbound.pop_next()).collect()
    }

    #[tokio::test]
    async fn choked_peers_get_no_data() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _commands) = fixture(dir.path()).await;
        let data = content();
        assert!(ctx.storage.put_piece(2, data[2 * PIECE as usize..3 * PIECE as usize].to_vec()).await.unwrap());

        let (mut conn, outbound, state) = connection(ctx);
        conn.process_message(BtMessage::Request(Request::new(2, 0, BLOCK_SIZE))).await.unwrap();
        assert!(drain(&outbound).is_empty());

        state.write().unwrap().choked_them = false;
        conn.process_message(BtMessage::Request(Request::new(2, 0, BLOCK_SIZE))).await.unwrap();
        let sent = drain(&outbound);
        assert_eq!(sent.len(), 1);
        let BtMessage::Piece(piece) = &sent[0] else {
            panic!("expected a piece");
        };
        assert_eq!(&piece.data[..], &data[2 * PIECE as usize..2 * PIECE as usize + BLOCK_SIZE as usize]);

        // out of range and oversized requests are dropped
        conn.process_message(BtMessage::Request(Request::new(2, PIECE, 1))).await.unwrap();
        conn.process_message(BtMessage::Request(Request::new(2, 0, 5 * BLOCK_SIZE))).await.unwrap();
        conn.process_message(BtMessage::Request(Request::new(99, 0, 1))).await.unwrap();
        // and so are requests for pieces we don't have
        conn.process_message(BtMessage::Request(Request::new(3, 0, 1))).await.unwrap();
        assert!(drain(&outbound).is_empty());
    }

    #[tokio::test]
    async fn out_of_range_have_is_a_violation() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _commands) = fixture(dir.path()).await;
        let (mut conn, _, _) = connection(ctx);
        assert!(conn.process_message(BtMessage::Have(Have { piece: 8 })).await.is_err());
    }

    #[tokio::test]
    async fn bad_bitfield_length_is_a_violation() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _commands) = fixture(dir.path()).await;
        let (mut conn, _, _) = connection(ctx);
        let msg = BtMessage::BitField(BitField { has: vec![0u8; 2].into() });
        assert!(conn.process_message(msg).await.is_err());
    }

    /// Plays a coordinator that lacks exactly `missing`
    async fn lacking(mut commands: mpsc::Receiver<SwarmCommand>, missing: usize) {
        while let Some(cmd) = commands.recv().await {
            match cmd {
                SwarmCommand::WantsAny { have, reply } => {
                    let _ = reply.send(have.get(missing).unwrap_or(false));
                }
                SwarmCommand::WantPiece { reply, .. } => {
                    let _ = reply.send(None);
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn have_for_a_missing_piece_makes_us_interested() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, commands) = fixture(dir.path()).await;
        tokio::spawn(lacking(commands, 3));
        let (mut conn, outbound, state) = connection(ctx);

        conn.process_message(BtMessage::Have(Have { piece: 1 })).await.unwrap();
        assert!(!state.read().unwrap().interested_them);
        assert!(drain(&outbound).is_empty());

        conn.process_message(BtMessage::Have(Have { piece: 3 })).await.unwrap();
        assert!(state.read().unwrap().interested_them);
        assert_eq!(drain(&outbound), vec![BtMessage::Interested(Interested)]);
    }

    #[tokio::test]
    async fn second_bitfield_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, commands) = fixture(dir.path()).await;
        tokio::spawn(lacking(commands, 6));
        let (mut conn, outbound, state) = connection(ctx);

        let mut first = BitSet::new(8);
        first.set(1).unwrap();
        conn.process_message(BtMessage::BitField(BitField { has: first.to_bytes() }))
            .await
            .unwrap();

        let mut second = BitSet::new(8);
        second.set(6).unwrap();
        conn.process_message(BtMessage::BitField(BitField { has: second.to_bytes() }))
            .await
            .unwrap();
        // even a malformed one
        conn.process_message(BtMessage::BitField(BitField { has: vec![0xff; 3].into() }))
            .await
            .unwrap();

        let remote = conn.remote.as_ref().unwrap();
        assert_eq!(remote.get(1), Ok(true));
        assert_eq!(remote.get(6), Ok(false));
        assert!(!state.read().unwrap().interested_them);
        assert!(drain(&outbound).is_empty());
    }

    /// Plays the coordinator: wants every piece, records what is handed in
    async fn fake_swarm(mut commands: mpsc::Receiver<SwarmCommand>) -> Vec<(u32, Vec<u8>)> {
        let mut got = vec![];
        let mut handed_out = vec![];
        while let Some(cmd) = commands.recv().await {
            match cmd {
                SwarmCommand::WantsAny { reply, .. } => {
                    let _ = reply.send(true);
                }
                SwarmCommand::WantPiece { have, busy, reply, .. } => {
                    let pick = have
                        .iter_ones()
                        .find(|p| !busy.contains(p) && !handed_out.contains(p));
                    if let Some(p) = pick {
                        handed_out.push(p);
                    }
                    let _ = reply.send(pick);
                }
                SwarmCommand::GotPiece { piece, data, reply, .. } => {
                    got.push((piece, data));
                    let _ = reply.send(true);
                }
                _ => {}
            }
        }
        got
    }

    #[tokio::test]
    async fn sub_pieces_are_reassembled_before_handing_over() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, commands) = fixture(dir.path()).await;
        let swarm = tokio::spawn(fake_swarm(commands));
        let data = content();

        let (mut conn, outbound, state) = connection(ctx);
        let mut bits = BitSet::new(8);
        bits.set(5).unwrap();
        conn.process_message(BtMessage::BitField(BitField { has: bits.to_bytes() }))
            .await
            .unwrap();
        assert!(state.read().unwrap().interested_them);
        assert_eq!(drain(&outbound), vec![BtMessage::Interested(Interested)]);

        conn.process_message(BtMessage::Unchoke(Unchoke)).await.unwrap();

        let base = 5 * PIECE as usize;
        let mut requested = vec![];
        for _ in 0..64 {
            for msg in drain(&outbound) {
                if let BtMessage::Request(r) = msg {
                    requested.push(r);
                }
            }
            assert!(conn.pipeline.len() <= 5);

            let Some(r) = requested.pop() else {
                break;
            };
            let begin = base + r.begin as usize;
            let block = Bytes::copy_from_slice(&data[begin..begin + r.length as usize]);
            conn.process_message(BtMessage::Piece(Piece {
                index: r.index,
                begin: r.begin,
                data: block,
            }))
            .await
            .unwrap();
        }

        // nothing left to ask for, so we are no longer interested
        assert!(!state.read().unwrap().interested_them);
        assert_eq!(state.read().unwrap().downloaded, PIECE as u64);

        drop(conn);
        let got = swarm.await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, 5);
        assert_eq!(got[0].1.len(), 262_144);
        assert_eq!(&got[0].1[..], &data[base..base + PIECE as usize]);
    }

    #[tokio::test]
    async fn unrequested_blocks_reset_the_counter() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _commands) = fixture(dir.path()).await;
        let (mut conn, _, state) = connection(ctx);
        state.write().unwrap().downloaded = 500;

        conn.process_message(BtMessage::Piece(Piece {
            index: 0,
            begin: 0,
            data: Bytes::from_static(&[0u8; 16]),
        }))
        .await
        .unwrap();
        assert_eq!(state.read().unwrap().downloaded, 0);
    }

    #[tokio::test]
    async fn connections_over_a_pipe_shake_hands_and_register() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, mut commands) = fixture(dir.path()).await;
        let (ours, mut theirs) = tokio::io::duplex(1 << 16);
        let identity = Identity::new(PeerId([2u8; 20]), "127.0.0.1:7000".parse().unwrap());
        let info_hash: InfoHash = ctx.torrent.info_hash;

        let conn = tokio::spawn(async move {
            let mut ours = ours;
            let hs = accept_handshake(&mut ours, ctx.torrent.info_hash, ctx.local_id).await.unwrap();
            assert_eq!(hs.peer_id, identity.peer_id);
            run_connection(ctx, ours, identity).await
        });

        let hs = initiate_handshake(&mut theirs, info_hash, identity.peer_id).await.unwrap();
        assert_eq!(hs.peer_id, PeerId([1u8; 20]));

        let Some(SwarmCommand::Register { identity: registered, reply, .. }) = commands.recv().await else {
            panic!("expected a registration");
        };
        assert_eq!(registered, identity);
        let _ = reply.send(Some(PeerKey(7)));

        drop(theirs);
        let Some(SwarmCommand::Disconnected(key)) = commands.recv().await else {
            panic!("expected the disconnect");
        };
        assert_eq!(key, PeerKey(7));
        conn.await.unwrap().unwrap();
    }
}

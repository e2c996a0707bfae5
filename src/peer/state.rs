use crate::wire::{BLOCK_SIZE, Request};
use std::collections::{BTreeMap, VecDeque};

/// Protocol flags of one connection, readable by the coordinator while the connection task
/// updates them
#[derive(Clone, Debug)]
pub struct PeerState {
    /// We choked the peer, i.e. we won't send data until we unchoke them
    pub choked_them: bool,

    /// The peer choked us, i.e. they won't send data until they unchoke us
    pub choked_us: bool,

    /// We are interested in them, i.e. they have something we want
    pub interested_them: bool,

    /// They are interested in us, i.e. they want something from us
    pub interested_us: bool,

    /// bytes of piece data sent since the last sample
    pub uploaded: u64,
    /// bytes of piece data received since the last sample
    pub downloaded: u64,
}

impl Default for PeerState {
    fn default() -> Self {
        // every connection starts out choked and not interested, both ways
        PeerState {
            choked_them: true,
            choked_us: true,
            interested_them: false,
            interested_us: false,
            uploaded: 0,
            downloaded: 0,
        }
    }
}

impl PeerState {
    /// Returns the interval counters and zeroes them, as `(uploaded, downloaded)`
    pub fn take_counters(&mut self) -> (u64, u64) {
        let sample = (self.uploaded, self.downloaded);
        self.uploaded = 0;
        self.downloaded = 0;
        sample
    }
}

/// Requests sent to the remote that haven't been answered yet, plus where to continue from
#[derive(Debug)]
pub struct Pipeline {
    outstanding: VecDeque<Request>,
    last: Option<Request>,
    depth: usize,
}

impl Pipeline {
    pub fn new(depth: usize) -> Self {
        Pipeline {
            outstanding: VecDeque::with_capacity(depth),
            last: None,
            depth,
        }
    }

    pub fn has_room(&self) -> bool {
        self.outstanding.len() < self.depth
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }

    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn outstanding(&self) -> impl Iterator<Item = &Request> {
        self.outstanding.iter()
    }

    /// The next sub-range of the piece we were last working on, `None` when that piece has been
    /// fully requested and a new one is needed
    pub fn continue_piece(&self, piece_len: impl Fn(u32) -> Option<u32>) -> Option<Request> {
        let last = self.last?;
        let len = piece_len(last.index)?;
        if last.end() >= len {
            return None;
        }
        Some(Request::new(last.index, last.end(), BLOCK_SIZE.min(len - last.end())))
    }

    /// First sub-range of a fresh piece
    pub fn start_piece(piece: u32, piece_len: u32) -> Request {
        Request::new(piece, 0, BLOCK_SIZE.min(piece_len))
    }

    /// Records a request as sent. Returns false without recording when the pipeline is full.
    pub fn push(&mut self, request: Request) -> bool {
        if !self.has_room() {
            return false;
        }
        self.outstanding.push_back(request);
        self.last = Some(request);
        true
    }

    /// Matches an arriving payload to what we asked for, removing it if found
    pub fn complete(&mut self, request: &Request) -> bool {
        match self.outstanding.iter().position(|r| r == request) {
            Some(i) => {
                self.outstanding.remove(i);
                true
            }
            None => false,
        }
    }

    /// Nothing left to ask this peer for
    pub fn exhausted(&mut self) {
        self.last = None;
    }

    /// Pieces with requests still outstanding
    pub fn pieces(&self) -> impl Iterator<Item = u32> + '_ {
        self.outstanding.iter().map(|r| r.index)
    }
}

/// Sub-pieces collected so far, keyed by piece
#[derive(Debug, Default)]
pub struct Reassembly {
    // piece num -> (received, buffer)
    buffers: BTreeMap<u32, (u32, Vec<u8>)>,
}

impl Reassembly {
    /// Copies a sub-piece in place. Returns the whole piece once every byte of it has arrived.
    pub fn add(&mut self, index: u32, begin: u32, data: &[u8], piece_len: u32) -> Option<Vec<u8>> {
        let end = begin as usize + data.len();
        if end > piece_len as usize {
            return None;
        }

        let (received, buf) = self
            .buffers
            .entry(index)
            .or_insert_with(|| (0, vec![0u8; piece_len as usize]));
        buf[begin as usize..end].copy_from_slice(data);
        *received += data.len() as u32;

        if *received >= piece_len {
            return self.buffers.remove(&index).map(|(_, buf)| buf);
        }
        None
    }

    pub fn in_progress(&self) -> impl Iterator<Item = u32> + '_ {
        self.buffers.keys().copied()
    }
}

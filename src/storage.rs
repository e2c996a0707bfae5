use crate::bitset::BitSet;
use crate::torrent::Torrent;
use anyhow::Context;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::ops::Range;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// What we have, guarded separately from the file handles
#[derive(Debug)]
struct Verified {
    bits: BitSet,
    /// number of pieces still missing
    needed: usize,
    /// pieces currently being written, so one piece only ever has one writer
    in_flight: HashSet<u32>,
}

/// Maps pieces onto the files of a torrent. Reads and writes to different files proceed in
/// parallel, a bit is only ever set once the piece's bytes are on disk and hash-match.
#[derive(Debug)]
pub struct TorrentStorage {
    pub torrent: Arc<Torrent>,
    files: Vec<Mutex<File>>,

    /// for each file at `i`, offset[i] contains the offset of the file into the conceptual one
    /// giant file
    offsets: Vec<u64>,

    verified: Mutex<Verified>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TorrentStorage {
    /// Creates or resizes every file under `base`. If any of them existed beforehand, each piece is
    /// hash checked so a restarted download resumes with what's already there.
    pub fn open(torrent: Arc<Torrent>, base: &Path) -> io::Result<TorrentStorage> {
        let mut files = vec![];
        let mut resume = false;

        for (path, entry) in torrent.file_paths(base).iter().zip(&torrent.files) {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }

            resume |= path.exists();
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;
            if file.metadata()?.len() != entry.length {
                file.set_len(entry.length)?;
            }
            files.push(Mutex::new(file));
        }

        // prefix sum
        let offsets = torrent
            .files
            .iter()
            .scan(0, |acc, file| {
                let start = *acc;
                *acc += file.length;
                Some(start)
            })
            .collect();

        let count = torrent.piece_count() as usize;
        let storage = TorrentStorage {
            torrent,
            files,
            offsets,
            verified: Mutex::new(Verified {
                bits: BitSet::new(count),
                needed: count,
                in_flight: HashSet::new(),
            }),
        };

        if resume {
            storage.check_existing()?;
        }

        Ok(storage)
    }

    fn check_existing(&self) -> io::Result<()> {
        let mut found = 0;
        for piece in 0..self.torrent.piece_count() {
            let data = self.read_range(self.piece_range(piece))?;
            if self.torrent.valid_piece(piece, &data) {
                let mut v = lock(&self.verified);
                if v.bits.set(piece as usize).is_ok() {
                    v.needed -= 1;
                }
                found += 1;
            }
        }

        info!(
            "found {found} of {} pieces already on disk",
            self.torrent.piece_count()
        );
        Ok(())
    }

    /// Where the piece lives if all the files were concatenated
    fn piece_range(&self, piece: u32) -> Range<u64> {
        let start = piece as u64 * self.torrent.piece_size as u64;
        let len = self.torrent.nth_piece_size(piece).unwrap_or(0) as u64;
        start..start + len
    }

    /// Find the file(s) and their corresponding range a logical range touches
    fn file_segments(&self, range: Range<u64>) -> Vec<(usize, Range<u64>)> {
        let mut ret = vec![];

        let first = self
            .offsets
            .partition_point(|&off| off <= range.start)
            .saturating_sub(1);

        for f in first..self.files.len() {
            // find out, conceptually, where does file `f` lie in one giant file
            let f_start = self.offsets[f];
            let f_end = f_start + self.torrent.files[f].length;
            if f_start >= range.end {
                break;
            }

            // the overlap is where the bytes go, converted back to offsets within file `f`
            let overlap_start = range.start.max(f_start);
            let overlap_end = range.end.min(f_end);
            if overlap_start < overlap_end {
                ret.push((f, overlap_start - f_start..overlap_end - f_start));
            }
        }

        ret
    }

    fn read_range(&self, range: Range<u64>) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; (range.end - range.start) as usize];
        let mut read = 0;
        for (f, local) in self.file_segments(range) {
            let len = (local.end - local.start) as usize;
            lock(&self.files[f]).read_exact_at(&mut buf[read..read + len], local.start)?;
            read += len;
        }

        Ok(buf)
    }

    fn write_range(&self, start: u64, data: &[u8]) -> io::Result<()> {
        let mut written = 0;
        for (f, local) in self.file_segments(start..start + data.len() as u64) {
            let len = (local.end - local.start) as usize;
            lock(&self.files[f]).write_all_at(&data[written..written + len], local.start)?;
            written += len;
        }

        Ok(())
    }

    pub fn has(&self, piece: u32) -> bool {
        lock(&self.verified).bits.has(piece)
    }

    /// `None` unless we hold the piece
    pub fn read_piece(&self, piece: u32) -> io::Result<Option<Vec<u8>>> {
        if !self.has(piece) {
            return Ok(None);
        }
        self.read_range(self.piece_range(piece)).map(Some)
    }

    /// A sub-range of a piece we hold, for answering a request
    pub fn read_block(&self, piece: u32, begin: u32, length: u32) -> io::Result<Option<Vec<u8>>> {
        let Some(piece_len) = self.torrent.nth_piece_size(piece) else {
            return Ok(None);
        };
        if begin as u64 + length as u64 > piece_len as u64 || !self.has(piece) {
            return Ok(None);
        }

        let start = self.piece_range(piece).start + begin as u64;
        self.read_range(start..start + length as u64).map(Some)
    }

    /// Returns whether `data` is the correct content of `piece`. Correct data is written and
    /// marked, a piece we already hold is accepted without being written again.
    pub fn put_piece(&self, piece: u32, data: &[u8]) -> io::Result<bool> {
        if self.torrent.nth_piece_size(piece) != Some(data.len() as u32) {
            return Ok(false);
        }
        if !self.torrent.valid_piece(piece, data) {
            debug!(piece, "piece failed to verify");
            return Ok(false);
        }

        {
            let mut v = lock(&self.verified);
            if v.bits.has(piece) || !v.in_flight.insert(piece) {
                return Ok(true);
            }
        }

        let written = self.write_range(self.piece_range(piece).start, data);

        let mut v = lock(&self.verified);
        v.in_flight.remove(&piece);
        written?;

        if v.bits.set(piece as usize).is_ok() {
            v.needed -= 1;
        }
        Ok(true)
    }

    pub fn bitfield(&self) -> BitSet {
        lock(&self.verified).bits.clone()
    }

    pub fn needed(&self) -> usize {
        lock(&self.verified).needed
    }

    /// Bytes still missing
    pub fn left(&self) -> u64 {
        let v = lock(&self.verified);
        (0..self.torrent.piece_count())
            .filter(|&p| !v.bits.has(p))
            .filter_map(|p| self.torrent.nth_piece_size(p))
            .map(u64::from)
            .sum()
    }

    pub fn close(&self) -> io::Result<()> {
        for file in &self.files {
            lock(file).sync_all()?;
        }
        Ok(())
    }
}

/// Async face of the storage, the blocking I/O runs on tokio's blocking pool
#[derive(Debug, Clone)]
pub struct TorrentStorageHandle {
    inner: Arc<TorrentStorage>,
}

impl TorrentStorageHandle {
    pub async fn open(torrent: Arc<Torrent>, base: PathBuf) -> anyhow::Result<TorrentStorageHandle> {
        let name = torrent.name.clone();
        let storage = tokio::task::spawn_blocking(move || TorrentStorage::open(torrent, &base))
            .await?
            .with_context(|| format!("Failed to set up storage for {name}"))?;

        Ok(TorrentStorageHandle {
            inner: Arc::new(storage),
        })
    }

    pub fn torrent(&self) -> &Arc<Torrent> {
        &self.inner.torrent
    }

    pub async fn put_piece(&self, piece: u32, data: Vec<u8>) -> anyhow::Result<bool> {
        let storage = self.inner.clone();
        let res = tokio::task::spawn_blocking(move || storage.put_piece(piece, &data))
            .await?
            .with_context(|| format!("Failed to write piece {piece}"))?;
        Ok(res)
    }

    pub async fn read_piece(&self, piece: u32) -> anyhow::Result<Option<Vec<u8>>> {
        let storage = self.inner.clone();
        let res = tokio::task::spawn_blocking(move || storage.read_piece(piece))
            .await?
            .with_context(|| format!("Failed to read piece {piece}"))?;
        Ok(res)
    }

    pub async fn read_block(&self, piece: u32, begin: u32, length: u32) -> anyhow::Result<Option<Vec<u8>>> {
        let storage = self.inner.clone();
        let res = tokio::task::spawn_blocking(move || storage.read_block(piece, begin, length))
            .await?
            .with_context(|| format!("Failed to read piece {piece}"))?;
        Ok(res)
    }

    pub fn has(&self, piece: u32) -> bool {
        self.inner.has(piece)
    }

    pub fn bitfield(&self) -> BitSet {
        self.inner.bitfield()
    }

    pub fn needed(&self) -> usize {
        self.inner.needed()
    }

    pub fn left(&self) -> u64 {
        self.inner.left()
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        let storage = self.inner.clone();
        tokio::task::spawn_blocking(move || storage.close())
            .await?
            .context("Failed to flush storage")?;
        if self.inner.needed() > 0 {
            warn!("closing storage with {} pieces missing", self.inner.needed());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::FileEntry;

    fn content() -> Vec<u8> {
        (0..100u32).map(|i| (i * 7 % 251) as u8).collect()
    }

    /// 100 bytes over three files of 30/0/70, pieces of 32
    fn multi_file(dir: &Path) -> Arc<Torrent> {
        let src = dir.join("src");
        fs::create_dir_all(src.join("d")).unwrap();
        let data = content();
        fs::write(src.join("a"), &data[..30]).unwrap();
        fs::write(src.join("b"), b"").unwrap();
        fs::write(src.join("d").join("c"), &data[30..]).unwrap();

        let torrent = Torrent::create(&src, "http://t/announce", 32).unwrap();
        assert_eq!(
            torrent.files.iter().map(|f| f.length).collect::<Vec<_>>(),
            vec![30, 0, 70]
        );
        Arc::new(torrent)
    }

    #[test]
    fn fresh_download_is_allocated_empty() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = multi_file(dir.path());
        let dl = dir.path().join("dl");

        let storage = TorrentStorage::open(torrent.clone(), &dl).unwrap();
        assert_eq!(storage.needed(), 4);
        assert_eq!(storage.left(), 100);
        assert!(storage.bitfield().is_empty());
        assert_eq!(fs::metadata(dl.join("src").join("d").join("c")).unwrap().len(), 70);
        assert_eq!(storage.read_piece(0).unwrap(), None);
    }

    #[test]
    fn pieces_straddle_file_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = multi_file(dir.path());
        let dl = dir.path().join("dl");
        let storage = TorrentStorage::open(torrent, &dl).unwrap();
        let data = content();

        for piece in [3u32, 0, 2, 1] {
            let start = piece as usize * 32;
            let end = (start + 32).min(100);
            assert!(storage.put_piece(piece, &data[start..end]).unwrap());
        }

        assert_eq!(storage.needed(), 0);
        assert!(storage.bitfield().is_complete());
        assert_eq!(fs::read(dl.join("src").join("a")).unwrap(), &data[..30]);
        assert_eq!(fs::read(dl.join("src").join("d").join("c")).unwrap(), &data[30..]);

        assert_eq!(storage.read_piece(0).unwrap().unwrap(), &data[..32]);
        assert_eq!(storage.read_piece(3).unwrap().unwrap(), &data[96..]);
        assert_eq!(storage.read_block(0, 28, 4).unwrap().unwrap(), &data[28..32]);
        assert_eq!(storage.read_block(3, 2, 4).unwrap(), None);
    }

    #[test]
    fn bad_piece_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = multi_file(dir.path());
        let storage = TorrentStorage::open(torrent, &dir.path().join("dl")).unwrap();

        let garbage = vec![0xffu8; 32];
        assert!(!storage.put_piece(1, &garbage).unwrap());
        assert!(!storage.bitfield().has(1));
        assert_eq!(storage.needed(), 4);
        assert_eq!(storage.read_piece(1).unwrap(), None);

        // wrong size never even gets hashed
        assert!(!storage.put_piece(1, &garbage[..31]).unwrap());
        assert!(!storage.put_piece(9, &garbage).unwrap());
    }

    #[test]
    fn put_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = multi_file(dir.path());
        let storage = TorrentStorage::open(torrent, &dir.path().join("dl")).unwrap();
        let data = content();

        assert!(storage.put_piece(2, &data[64..96]).unwrap());
        assert_eq!(storage.needed(), 3);
        assert!(storage.put_piece(2, &data[64..96]).unwrap());
        assert_eq!(storage.needed(), 3);
        assert_eq!(storage.left(), 68);
    }

    #[test]
    fn reopen_resumes_whole_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = multi_file(dir.path());
        let dl = dir.path().join("dl");
        let data = content();

        {
            let storage = TorrentStorage::open(torrent.clone(), &dl).unwrap();
            assert!(storage.put_piece(1, &data[32..64]).unwrap());
            assert!(storage.put_piece(3, &data[96..]).unwrap());
            storage.close().unwrap();
        }

        let storage = TorrentStorage::open(torrent, &dl).unwrap();
        assert_eq!(storage.bitfield().iter_ones().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(storage.needed(), 2);
    }

    #[test]
    fn seeding_from_the_source_directory() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = multi_file(dir.path());

        // the content's parent is the base, so everything verifies on open
        let storage = TorrentStorage::open(torrent, dir.path()).unwrap();
        assert_eq!(storage.needed(), 0);
        assert_eq!(storage.left(), 0);
    }

    #[test]
    fn single_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let data = content();
        let src = dir.path().join("blob.bin");
        fs::write(&src, &data).unwrap();
        let torrent = Arc::new(Torrent::create(&src, "http://t/announce", 64).unwrap());
        assert_eq!(
            torrent.files,
            vec![FileEntry {
                path: vec![],
                length: 100
            }]
        );

        let dl = dir.path().join("dl");
        let storage = TorrentStorage::open(torrent, &dl).unwrap();
        assert!(storage.put_piece(1, &data[64..]).unwrap());
        assert_eq!(&fs::read(dl.join("blob.bin")).unwrap()[64..], &data[64..]);
    }

    #[tokio::test]
    async fn handle_runs_on_blocking_pool() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = multi_file(dir.path());
        let handle = TorrentStorageHandle::open(torrent, dir.path().join("dl")).await.unwrap();
        let data = content();

        assert!(handle.put_piece(0, data[..32].to_vec()).await.unwrap());
        assert!(!handle.put_piece(1, data[..32].to_vec()).await.unwrap());
        assert_eq!(handle.read_block(0, 0, 8).await.unwrap().unwrap(), &data[..8]);
        assert!(handle.has(0));
        assert_eq!(handle.needed(), 3);
        handle.close().await.unwrap();
    }
}

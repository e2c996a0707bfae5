use crate::defs::{HASH_LEN, InfoHash};
use anyhow::{Context, anyhow, bail, ensure};
use crate::bencode::{self, BencodeView};
use bendy::decoding::Object;
use bendy::encoding::Encoder;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str;

/// One file in the content, `path` is relative to the content's root directory and empty for
/// single file content
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FileEntry {
    pub path: Vec<String>,
    pub length: u64,
}

/// Represents a parsed torrent metadata file
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Torrent {
    /// Where the tracker lives
    pub announce: String,

    /// Name of the single file, or of the directory holding the files
    pub name: String,

    /// Number of bytes for each piece, barring the last one
    pub piece_size: u32,

    /// Hash of each piece
    pub pieces: Vec<[u8; HASH_LEN]>,

    /// Files in the torrent, in the order their bytes are concatenated
    pub files: Vec<FileEntry>,

    /// Total size of all files combined in bytes
    pub total_size: u64,

    /// Info hash of the torrent
    pub info_hash: InfoHash,
}

impl Torrent {
    /// Assemble a torrent from its fields, the info hash is computed from the canonical encoding
    pub fn from_parts(
        announce: String,
        name: String,
        piece_size: u32,
        pieces: Vec<[u8; HASH_LEN]>,
        files: Vec<FileEntry>,
    ) -> anyhow::Result<Torrent> {
        Torrent::new(announce, name, piece_size, pieces, files, None)
    }

    fn new(
        announce: String,
        name: String,
        piece_size: u32,
        pieces: Vec<[u8; HASH_LEN]>,
        files: Vec<FileEntry>,
        info_hash: Option<InfoHash>,
    ) -> anyhow::Result<Torrent> {
        ensure!(piece_size > 0, "piece length must be positive");
        ensure!(!files.is_empty(), "torrent has no files");

        let total_size: u64 = files.iter().map(|f| f.length).sum();
        let expected_pieces = total_size.div_ceil(piece_size as u64);
        ensure!(
            pieces.len() as u64 == expected_pieces,
            "{} bytes in pieces of {} need {} hashes, got {}",
            total_size,
            piece_size,
            expected_pieces,
            pieces.len()
        );

        let mut torrent = Torrent {
            announce,
            name,
            piece_size,
            pieces,
            files,
            total_size,
            info_hash: InfoHash([0u8; HASH_LEN]),
        };
        torrent.info_hash = match info_hash {
            Some(hash) => hash,
            None => InfoHash(Sha1::digest(torrent.encode_info()).into()),
        };

        Ok(torrent)
    }

    pub fn piece_count(&self) -> u32 {
        self.pieces.len() as u32
    }

    pub fn is_single_file(&self) -> bool {
        self.files.len() == 1 && self.files[0].path.is_empty()
    }

    /// Size of the last piece in bytes
    pub fn last_piece_size(&self) -> u32 {
        let full = (self.pieces.len() as u64).saturating_sub(1) * self.piece_size as u64;
        (self.total_size - full) as u32
    }

    /// Returns the size of the ith piece in bytes
    pub fn nth_piece_size(&self, i: u32) -> Option<u32> {
        let count = self.piece_count();
        if i >= count {
            return None;
        }

        if i == count - 1 {
            Some(self.last_piece_size())
        } else {
            Some(self.piece_size)
        }
    }

    /// Validates that a piece matches its expected hash
    pub fn valid_piece(&self, piece: u32, data: &[u8]) -> bool {
        let Some(expected_hash) = self.pieces.get(piece as usize) else {
            return false;
        };
        let got = Sha1::digest(data);
        got.as_slice() == expected_hash
    }

    /// `valid_piece` over a sub range of a bigger buffer
    pub fn check_piece(&self, piece: u32, bytes: &[u8], off: usize, len: usize) -> bool {
        let Some(end) = off.checked_add(len) else {
            return false;
        };
        match bytes.get(off..end) {
            Some(data) => self.valid_piece(piece, data),
            None => false,
        }
    }

    /// Same content, different tracker. The info hash is untouched since `announce` lives outside
    /// the info dictionary.
    pub fn with_announce(&self, announce: impl Into<String>) -> Torrent {
        Torrent {
            announce: announce.into(),
            ..self.clone()
        }
    }

    /// Bencoding of the `info` dictionary, keys sorted as the format requires
    pub fn encode_info(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder
            .emit_and_sort_dict(|e| self.emit_info(e))
            .expect("we know all the fields upfront");

        encoder.get_output().expect("we know all the fields upfront")
    }

    fn emit_info(&self, e: &mut bendy::encoding::UnsortedDictEncoder) -> Result<(), bendy::encoding::Error> {
        e.emit_pair_with(b"name", |e| e.emit_str(&self.name))?;
        e.emit_pair_with(b"piece length", |e| e.emit_int(self.piece_size))?;
        e.emit_pair_with(b"pieces", |e| e.emit_bytes(&self.pieces.concat()))?;

        if self.is_single_file() {
            e.emit_pair_with(b"length", |e| e.emit_int(self.total_size))
        } else {
            e.emit_pair_with(b"files", |e| {
                e.emit_list(|e| {
                    for file in &self.files {
                        e.emit_and_sort_dict(|e| {
                            e.emit_pair_with(b"length", |e| e.emit_int(file.length))?;
                            e.emit_pair_with(b"path", |e| {
                                e.emit_list(|e| {
                                    for component in &file.path {
                                        e.emit_str(component)?;
                                    }
                                    Ok(())
                                })
                            })
                        })?;
                    }
                    Ok(())
                })
            })
        }
    }

    /// The whole metadata file
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder
            .emit_and_sort_dict(|e| {
                e.emit_pair_with(b"announce", |e| e.emit_str(&self.announce))?;
                e.emit_pair_with(b"info", |e| e.emit_unsorted_dict(|e| self.emit_info(e)))
            })
            .expect("we know all the fields upfront");

        encoder.get_output().expect("we know all the fields upfront")
    }

    /// Where each file lives once the content is laid out under `base`
    pub fn file_paths(&self, base: &Path) -> Vec<PathBuf> {
        let root = base.join(sanitize(&self.name));
        if self.is_single_file() {
            return vec![root];
        }

        self.files
            .iter()
            .map(|f| {
                let mut p = root.clone();
                for component in &f.path {
                    p.push(sanitize(component));
                }
                p
            })
            .collect()
    }

    /// Build a torrent for the file or directory at `path` by hashing its content. Directory
    /// entries are visited in name order so the result is reproducible.
    pub fn create(path: &Path, announce: &str, piece_size: u32) -> anyhow::Result<Torrent> {
        ensure!(piece_size > 0, "piece length must be positive");
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("{} has no usable name", path.display()))?
            .to_string();

        let metadata = fs::metadata(path).with_context(|| format!("Failed to stat {}", path.display()))?;
        let mut sources = vec![];
        let files = if metadata.is_dir() {
            let mut files = vec![];
            collect_files(path, &mut vec![], &mut files, &mut sources)?;
            ensure!(!files.is_empty(), "{} contains no files", path.display());
            files
        } else {
            sources.push(path.to_path_buf());
            vec![FileEntry {
                path: vec![],
                length: metadata.len(),
            }]
        };

        let mut hasher = PieceHasher::new(piece_size as usize);
        let mut buf = vec![0u8; 64 * 1024];
        for source in &sources {
            let mut f = File::open(source).with_context(|| format!("Failed to open {}", source.display()))?;
            loop {
                let n = f.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }

        Torrent::new(announce.to_string(), name, piece_size, hasher.finish(), files, None)
    }
}

/// Path components come from strangers, don't let them climb out of the download directory
fn sanitize(component: &str) -> String {
    if component == ".." || component == "." || component.is_empty() {
        return "_".to_string();
    }
    component.replace(['/', '\\'], "_")
}

fn collect_files(
    dir: &Path,
    prefix: &mut Vec<String>,
    files: &mut Vec<FileEntry>,
    sources: &mut Vec<PathBuf>,
) -> anyhow::Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry
            .file_name()
            .into_string()
            .map_err(|n| anyhow!("{n:?} is not valid utf-8"))?;
        let file_type = entry.file_type()?;

        prefix.push(name);
        if file_type.is_dir() {
            collect_files(&entry.path(), prefix, files, sources)?;
        } else if file_type.is_file() {
            files.push(FileEntry {
                path: prefix.clone(),
                length: entry.metadata()?.len(),
            });
            sources.push(entry.path());
        }
        prefix.pop();
    }

    Ok(())
}

/// Streams bytes through SHA-1, cutting a new digest every `piece_size` bytes
struct PieceHasher {
    piece_size: usize,
    current: Sha1,
    filled: usize,
    hashes: Vec<[u8; HASH_LEN]>,
}

impl PieceHasher {
    fn new(piece_size: usize) -> Self {
        PieceHasher {
            piece_size,
            current: Sha1::new(),
            filled: 0,
            hashes: vec![],
        }
    }

    fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (self.piece_size - self.filled).min(data.len());
            self.current.update(&data[..take]);
            self.filled += take;
            data = &data[take..];

            if self.filled == self.piece_size {
                let done = std::mem::replace(&mut self.current, Sha1::new());
                self.hashes.push(done.finalize().into());
                self.filled = 0;
            }
        }
    }

    fn finish(mut self) -> Vec<[u8; HASH_LEN]> {
        if self.filled > 0 {
            self.hashes.push(self.current.finalize().into());
        }
        self.hashes
    }
}

fn take_bytes<'a>(dict: &mut BTreeMap<&[u8], BencodeView<'a>>, key: &str) -> anyhow::Result<&'a [u8]> {
    match dict.remove(key.as_bytes()) {
        Some(BencodeView::ByteString(bytes)) => Ok(bytes),
        Some(_) => bail!("{key} needs to be a string"),
        None => bail!("missing {key}"),
    }
}

fn take_int(dict: &mut BTreeMap<&[u8], BencodeView>, key: &str) -> anyhow::Result<i64> {
    match dict.remove(key.as_bytes()) {
        Some(BencodeView::Integer(i)) => Ok(i),
        Some(_) => bail!("{key} needs to be an integer"),
        None => bail!("missing {key}"),
    }
}

fn utf8(bytes: &[u8], what: &str) -> anyhow::Result<String> {
    Ok(str::from_utf8(bytes)
        .with_context(|| format!("{what} is not valid utf-8"))?
        .to_string())
}

/// Parses a torrent metadata file and returns a Torrent struct
pub fn parse_torrent(metadata_file: &[u8]) -> anyhow::Result<Torrent> {
    let hash = compute_info_hash(metadata_file)?;

    let mut torrent = bencode::parse_dict(metadata_file)?;

    let Some(BencodeView::Dictionary(mut info)) = torrent.remove(b"info".as_slice()) else {
        bail!("info needs to be a dict");
    };

    let announce = utf8(take_bytes(&mut torrent, "announce")?, "announce")?;
    let name = utf8(take_bytes(&mut info, "name")?, "name")?;

    let piece_len: u32 = take_int(&mut info, "piece length")?
        .try_into()
        .context("piece length out of range")?;

    let pieces = take_bytes(&mut info, "pieces")?;
    ensure!(pieces.len() % HASH_LEN == 0, "pieces is not a multiple of 20 bytes");
    let pieces = pieces
        .chunks_exact(HASH_LEN)
        .map(|c| {
            let mut digest = [0u8; HASH_LEN];
            digest.copy_from_slice(c);
            digest
        })
        .collect();

    let mut files = vec![];
    if let Some(BencodeView::Integer(length)) = info.remove(b"length".as_slice()) {
        files.push(FileEntry {
            path: vec![],
            length: length.try_into().context("negative file length")?,
        });
    } else if let Some(BencodeView::List(file_lists)) = info.remove(b"files".as_slice()) {
        for entry in file_lists {
            let BencodeView::Dictionary(mut entry) = entry else {
                bail!("file entry needs to be a dict");
            };
            let length: u64 = take_int(&mut entry, "length")?
                .try_into()
                .context("negative file length")?;
            let Some(BencodeView::List(components)) = entry.remove(b"path".as_slice()) else {
                bail!("file path needs to be a list");
            };

            let mut path = vec![];
            for component in components {
                let BencodeView::ByteString(c) = component else {
                    bail!("file path component needs to be a string");
                };
                path.push(utf8(c, "path component")?);
            }
            ensure!(!path.is_empty(), "file path is empty");

            files.push(FileEntry { path, length });
        }
    } else {
        bail!("info has neither length nor files");
    }

    Torrent::new(announce, name, piece_len, pieces, files, Some(hash))
}

/// Computes the info hash of a torrent metadata file over the raw bytes of its `info` value
fn compute_info_hash(input: &[u8]) -> anyhow::Result<InfoHash> {
    // bendy's error type only implements Debug + Display, so no `?` straight into anyhow
    let mut decoder = bendy::decoding::Decoder::new(input);
    let Some(Object::Dict(mut dict)) = decoder.next_object().map_err(|e| anyhow!("{e}"))? else {
        bail!("torrent metadata must be a dictionary")
    };

    while let Some((key, val)) = dict.next_pair().map_err(|e| anyhow!("{e}"))? {
        if key == b"info" {
            let Object::Dict(dict_decoder) = val else {
                bail!("info needs to be a dict");
            };
            let buf = dict_decoder.into_raw().map_err(|e| anyhow!("{e}"))?;
            return Ok(InfoHash(Sha1::digest(buf).into()));
        }
    }

    bail!("torrent metadata must contain 'info' key")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(total: u64, piece_size: u32) -> Torrent {
        let count = total.div_ceil(piece_size as u64) as usize;
        Torrent::new(
            "http://tracker.example/announce".into(),
            "disk.img".into(),
            piece_size,
            vec![[0u8; HASH_LEN]; count],
            vec![FileEntry {
                path: vec![],
                length: total,
            }],
            None,
        )
        .unwrap()
    }

    #[test]
    fn piece_arithmetic() {
        let torrent = sample(1_000_000, 262_144);
        assert_eq!(torrent.piece_count(), 4);
        assert_eq!(torrent.last_piece_size(), 213_568);
        assert_eq!(torrent.nth_piece_size(0), Some(262_144));
        assert_eq!(torrent.nth_piece_size(3), Some(213_568));
        assert_eq!(torrent.nth_piece_size(4), None);
    }

    #[test]
    fn exact_multiple_has_full_last_piece() {
        let torrent = sample(4 * 16384, 16384);
        assert_eq!(torrent.piece_count(), 4);
        assert_eq!(torrent.last_piece_size(), 16384);
    }

    #[test]
    fn wrong_hash_count_is_rejected() {
        let result = Torrent::new(
            "http://t/announce".into(),
            "x".into(),
            10,
            vec![[0u8; HASH_LEN]; 2],
            vec![FileEntry { path: vec![], length: 30 }],
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn encoding_round_trips_with_same_info_hash() {
        let data: Vec<u8> = (0..100u8).collect();
        let torrent = Torrent::new(
            "http://t/announce".into(),
            "content".into(),
            32,
            data.chunks(32).map(|c| Sha1::digest(c).into()).collect(),
            vec![
                FileEntry {
                    path: vec!["a".into(), "b.bin".into()],
                    length: 60,
                },
                FileEntry {
                    path: vec!["c.bin".into()],
                    length: 40,
                },
            ],
            None,
        )
        .unwrap();

        let bytes = torrent.to_bytes();
        let parsed = parse_torrent(&bytes).unwrap();
        assert_eq!(parsed, torrent);
        assert!(parsed.valid_piece(3, &data[96..]));
        assert!(!parsed.valid_piece(3, &data[95..]));
        assert!(parsed.check_piece(1, &data, 32, 32));
        assert!(!parsed.check_piece(1, &data, 90, 32));
    }

    #[test]
    fn info_hash_is_over_info_dict_only() {
        let torrent = sample(100, 64);
        let moved = torrent.with_announce("http://elsewhere/announce");
        assert_eq!(moved.info_hash, torrent.info_hash);
        assert_ne!(moved.to_bytes(), torrent.to_bytes());

        let expected: [u8; 20] = Sha1::digest(torrent.encode_info()).into();
        assert_eq!(torrent.info_hash.0, expected);
        assert_eq!(parse_torrent(&moved.to_bytes()).unwrap().info_hash, torrent.info_hash);
    }

    #[test]
    fn info_keys_are_in_canonical_order() {
        let torrent = sample(10, 64);
        let info = torrent.encode_info();
        let text = String::from_utf8_lossy(&info);
        let name = text.find("4:name").unwrap();
        let length = text.find("6:length").unwrap();
        let piece_length = text.find("12:piece length").unwrap();
        let pieces = text.find("6:pieces").unwrap();
        assert!(length < name && name < piece_length && piece_length < pieces);
    }

    #[test]
    fn parses_hand_written_single_file() {
        let mut raw = b"d8:announce15:http://t/a/anno4:infod6:lengthi5e4:name3:foo12:piece lengthi4e6:pieces40:"
            .to_vec();
        raw.extend_from_slice(&[1u8; 40]);
        raw.extend_from_slice(b"ee");

        let torrent = parse_torrent(&raw).unwrap();
        assert_eq!(torrent.announce, "http://t/a/anno");
        assert_eq!(torrent.name, "foo");
        assert!(torrent.is_single_file());
        assert_eq!(torrent.piece_count(), 2);
        assert_eq!(torrent.last_piece_size(), 1);
    }

    #[test]
    fn rejects_missing_info() {
        assert!(parse_torrent(b"d8:announce3:abce").is_err());
        assert!(parse_torrent(b"not bencode").is_err());
    }

    #[test]
    fn empty_lists_decode() {
        let mut raw = b"d8:announce8:http://t13:announce-listle4:infod5:filesle4:name3:foo12:piece lengthi4e6:pieces0:ee"
            .to_vec();
        let err = parse_torrent(&raw).unwrap_err();
        assert!(err.to_string().contains("no files"), "{err:#}");

        // an empty list next to a usable info dict is harmless
        raw = b"d8:announce8:http://t13:announce-listle4:infod6:lengthi3e4:name3:foo12:piece lengthi4e6:pieces20:"
            .to_vec();
        raw.extend_from_slice(&[9u8; 20]);
        raw.extend_from_slice(b"ee");
        let torrent = parse_torrent(&raw).unwrap();
        assert_eq!(torrent.total_size, 3);
    }

    #[test]
    fn hostile_block_offsets_fail_the_check() {
        let torrent = sample(100, 64);
        assert!(!torrent.check_piece(0, &[0u8; 64], usize::MAX, 2));
        assert!(!torrent.check_piece(0, &[0u8; 64], 1, usize::MAX));
    }

    #[test]
    fn hostile_paths_stay_inside() {
        let torrent = Torrent::new(
            "http://t/announce".into(),
            "..".into(),
            16,
            vec![[0u8; HASH_LEN]],
            vec![FileEntry {
                path: vec!["..".into(), "x/y".into()],
                length: 3,
            }],
            None,
        )
        .unwrap();

        let paths = torrent.file_paths(Path::new("/dl"));
        assert_eq!(paths, vec![PathBuf::from("/dl/_/_/x_y")]);
    }

    #[test]
    fn create_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("share");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("b.bin"), vec![2u8; 50]).unwrap();
        fs::write(root.join("sub").join("a.bin"), vec![1u8; 30]).unwrap();

        let torrent = Torrent::create(&root, "http://h:1/announce", 32).unwrap();
        assert_eq!(torrent.name, "share");
        assert_eq!(torrent.total_size, 80);
        assert_eq!(torrent.piece_count(), 3);
        assert_eq!(
            torrent.files,
            vec![
                FileEntry {
                    path: vec!["b.bin".into()],
                    length: 50
                },
                FileEntry {
                    path: vec!["sub".into(), "a.bin".into()],
                    length: 30
                },
            ]
        );

        let mut all = vec![2u8; 50];
        all.extend(vec![1u8; 30]);
        assert!(torrent.valid_piece(0, &all[..32]));
        assert!(torrent.valid_piece(1, &all[32..64]));
        assert!(torrent.valid_piece(2, &all[64..]));
    }
}

//! # piecemeal
//!
//! piecemeal is a BitTorrent swarm client with a small embedded tracker, written in async Rust.
//!
//! ## what does it do?
//! Given a torrent it finds peers through the tracker, trades 16 KiB blocks with them over the peer wire protocol,
//! checks every finished piece against its SHA-1 and writes it to disk. Once everything is there it keeps seeding.
//!
//! Given a file or directory and `--share <host>`, it hashes the content into a torrent, runs a tracker on its own
//! listening port and seeds. Other instances can grab the metadata from `http://<host>:<port>/<info hash>.torrent`.
//!
//! ## how is it put together?
//! - a [`swarm::TorrentSwarm`] task owns the peer list and the list of pieces we still want, and answers every
//!   connection's questions one at a time
//! - each connection runs a reader task with the protocol state and a writer task draining its outgoing queue
//! - every 20 seconds the [`choker`] decides who gets our upload slots
//! - one listening port serves both peers and the web side of the tracker, the [`acceptor`] tells them apart by
//!   the first four bytes
//!
//! ## what it doesn't do
//! One torrent per session, tracker only (no DHT, no peer exchange), no UDP trackers, no protocol extensions.
//! Pieces are picked in random order, not rarest first.
//!
//! ## warning
//! Nothing here is encrypted, anything listening for traffic should be treated with care.
//!
//! # TL;DR
//! ``` no_run
//! use piecemeal::config::Config;
//! use piecemeal::session::{Session, Source};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let session = Session::launch(Config::default(), Source::Torrent("debian.iso.torrent".to_string())).await?;
//!     session.run().await
//! }
//! ```

pub mod acceptor;
pub mod bencode;
pub mod bitset;
pub mod choker;
pub mod config;
pub mod defs;
pub mod error;
pub mod http;
pub mod monitor;
pub mod peer;
pub mod session;
pub mod storage;
pub mod swarm;
pub mod torrent;
pub mod tracker;
pub mod tracker_client;
pub mod wire;

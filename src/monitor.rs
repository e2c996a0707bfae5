use crate::swarm::TorrentSwarmStats;
use std::fmt::{self, Display};
use std::time::Instant;

/// Turns successive stats snapshots into rates for the periodic log line
#[derive(Debug)]
pub struct StatsReporter {
    last_uploaded: u64,
    last_downloaded: u64,
    last_at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub peers: usize,
    pub have: usize,
    pub pieces: usize,
    /// bytes per second since the previous report
    pub up_rate: f64,
    pub down_rate: f64,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

impl StatsReporter {
    pub fn new(stats: &TorrentSwarmStats, now: Instant) -> Self {
        StatsReporter {
            last_uploaded: stats.uploaded,
            last_downloaded: stats.downloaded,
            last_at: now,
        }
    }

    pub fn sample(&mut self, stats: &TorrentSwarmStats, pieces: usize, now: Instant) -> Report {
        let elapsed = now.saturating_duration_since(self.last_at).as_secs_f64();
        let rate = |now: u64, then: u64| {
            if elapsed > 0.0 {
                now.saturating_sub(then) as f64 / elapsed
            } else {
                0.0
            }
        };

        let report = Report {
            peers: stats.peers,
            have: pieces - stats.needed,
            pieces,
            up_rate: rate(stats.uploaded, self.last_uploaded),
            down_rate: rate(stats.downloaded, self.last_downloaded),
            uploaded: stats.uploaded,
            downloaded: stats.downloaded,
            left: stats.left,
        };

        self.last_uploaded = stats.uploaded;
        self.last_downloaded = stats.downloaded;
        self.last_at = now;
        report
    }
}

impl Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} peers, {}/{} pieces, down {:.1} KiB/s up {:.1} KiB/s, {} bytes left",
            self.peers,
            self.have,
            self.pieces,
            self.down_rate / 1024.0,
            self.up_rate / 1024.0,
            self.left
        )
    }
}

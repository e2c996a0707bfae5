use crate::acceptor::Acceptor;
use crate::config::Config;
use crate::defs::PeerId;
use crate::http::{self, ForwardedListener};
use crate::storage::TorrentStorageHandle;
use crate::swarm::{SwarmHandle, TorrentSwarm, TorrentSwarmStats};
use crate::torrent::{Torrent, parse_torrent};
use crate::tracker::Tracker;
use crate::tracker_client::TrackerClient;
use anyhow::{Context, anyhow};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Where the torrent of a session comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// a metadata file on disk, or an http(s) url serving one
    Torrent(String),
    /// content on disk we create a torrent for and seed, with the embedded tracker on `host`
    Share { path: PathBuf, host: String },
}

/// Reads a metadata file from disk or fetches it over http
pub async fn fetch_torrent(location: &str) -> anyhow::Result<Torrent> {
    let bytes = if location.starts_with("http://") || location.starts_with("https://") {
        reqwest::get(location)
            .await
            .with_context(|| format!("Failed to fetch {location}"))?
            .error_for_status()?
            .bytes()
            .await?
            .to_vec()
    } else {
        tokio::fs::read(location)
            .await
            .with_context(|| format!("Failed to read {location}"))?
    };
    parse_torrent(&bytes).with_context(|| format!("{location} is not a valid torrent"))
}

/// One torrent being downloaded or seeded: storage, coordinator, acceptor, tracker client and,
/// when sharing, the embedded tracker.
#[derive(Debug)]
pub struct Session {
    config: Config,
    torrent: Arc<Torrent>,
    storage: TorrentStorageHandle,
    local_addr: SocketAddr,

    swarm: SwarmHandle,
    stats: watch::Receiver<TorrentSwarmStats>,

    stop_accepting: CancellationToken,
    stop_announcing: CancellationToken,
    stop_web: CancellationToken,

    acceptor_task: JoinHandle<()>,
    web_task: Option<JoinHandle<io::Result<()>>>,
    tracker_client_task: Option<JoinHandle<anyhow::Result<()>>>,
    swarm_task: Option<JoinHandle<anyhow::Result<()>>>,
}

impl Session {
    /// Binds the listening port, loads or creates the torrent and starts every part of the session
    pub async fn launch(mut config: Config, source: Source) -> anyhow::Result<Session> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .with_context(|| format!("Failed to listen on {}", config.listen_addr))?;
        // the port may have been picked by the OS
        config.listen_addr = listener.local_addr()?;

        let (torrent, base, tracker) = match source {
            Source::Torrent(location) => (fetch_torrent(&location).await?, config.download_dir.clone(), None),
            Source::Share { path, host } => {
                let path = tokio::fs::canonicalize(&path)
                    .await
                    .with_context(|| format!("Failed to find {}", path.display()))?;
                let announce = format!("http://{host}:{}/announce", config.listen_addr.port());
                let piece_size = config.piece_size;

                info!("hashing {}", path.display());
                let torrent = {
                    let path = path.clone();
                    tokio::task::spawn_blocking(move || Torrent::create(&path, &announce, piece_size)).await??
                };
                let base = path.parent().map(PathBuf::from).unwrap_or_default();
                let tracker = Arc::new(Tracker::new(config.tracker_interval));
                tracker.register(&torrent);
                (torrent, base, Some(tracker))
            }
        };

        Self::start(config, listener, torrent, base, tracker).await
    }

    pub async fn start(
        config: Config,
        listener: TcpListener,
        torrent: Torrent,
        base: PathBuf,
        tracker: Option<Arc<Tracker>>,
    ) -> anyhow::Result<Session> {
        let torrent = Arc::new(torrent);
        let local_addr = listener.local_addr()?;
        let local_id = PeerId::random();
        info!(
            "{} ({}, {} pieces of {} bytes) in {}",
            torrent.name,
            torrent.info_hash,
            torrent.piece_count(),
            torrent.piece_size,
            base.display()
        );

        let storage = TorrentStorageHandle::open(torrent.clone(), base).await?;

        let stop_web = CancellationToken::new();
        let (web_task, http) = match tracker {
            Some(tracker) => {
                let (forward, web_listener) = ForwardedListener::new(local_addr);
                let task = tokio::spawn(http::serve(tracker, web_listener, stop_web.clone()));
                (Some(task), Some(forward))
            }
            None => (None, None),
        };

        let (swarm, handle, stats) = TorrentSwarm::new(storage.clone(), local_id, &config);
        let acceptor = Acceptor::new(listener, swarm.peer_context(), http);
        let swarm_task = tokio::spawn(swarm.work_loop());

        let stop_accepting = CancellationToken::new();
        let acceptor_task = tokio::spawn(acceptor.run(stop_accepting.clone()));

        let stop_announcing = CancellationToken::new();
        let client = TrackerClient::new(
            torrent.announce.clone(),
            torrent.info_hash,
            local_id,
            &config,
            stats.clone(),
            handle.clone(),
        );
        let tracker_client_task = tokio::spawn(client.run(stop_announcing.clone()));

        Ok(Session {
            config,
            torrent,
            storage,
            local_addr,
            swarm: handle,
            stats,
            stop_accepting,
            stop_announcing,
            stop_web,
            acceptor_task,
            web_task,
            tracker_client_task: Some(tracker_client_task),
            swarm_task: Some(swarm_task),
        })
    }

    pub fn torrent(&self) -> &Arc<Torrent> {
        &self.torrent
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> watch::Receiver<TorrentSwarmStats> {
        self.stats.clone()
    }

    /// Runs until ctrl-c or until something fatal happens
    pub async fn run(self) -> anyhow::Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("can't listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Runs until `stop` resolves, the storage breaks or the tracker can't be reached at startup.
    /// Shuts everything down in order either way.
    pub async fn run_until(mut self, stop: impl Future<Output = ()>) -> anyhow::Result<()> {
        let ended = {
            let swarm_task = self.swarm_task.as_mut().context("session already stopped")?;
            let tracker_client_task = self
                .tracker_client_task
                .as_mut()
                .context("session already stopped")?;

            tokio::select! {
                _ = stop => Ended::Stopped,
                res = swarm_task => Ended::Swarm(flatten(res)),
                res = tracker_client_task => Ended::TrackerClient(flatten(res)),
            }
        };

        let outcome = match ended {
            Ended::Stopped => {
                info!("shutting down");
                Ok(())
            }
            Ended::Swarm(res) => {
                self.swarm_task = None;
                res.context("swarm stopped")
            }
            Ended::TrackerClient(res) => {
                self.tracker_client_task = None;
                res
            }
        };

        self.shutdown().await;
        outcome
    }

    /// Acceptor, tracker client, coordinator, storage, each given a bounded time
    async fn shutdown(mut self) {
        let grace = self.config.shutdown_grace;

        self.stop_accepting.cancel();
        if timeout(grace, &mut self.acceptor_task).await.is_err() {
            warn!("acceptor didn't stop in time");
            self.acceptor_task.abort();
        }

        self.stop_announcing.cancel();
        if let Some(mut task) = self.tracker_client_task.take() {
            // the client bounds its own stopped announce by the same grace
            if timeout(grace * 2, &mut task).await.is_err() {
                warn!("tracker client didn't stop in time");
                task.abort();
            }
        }

        if let Some(mut task) = self.swarm_task.take() {
            if timeout(grace, self.swarm.halt()).await.is_err() {
                warn!("peers didn't disconnect in time");
            }
            match timeout(grace, &mut task).await {
                Ok(res) => {
                    if let Err(e) = flatten(res) {
                        warn!("swarm ended with {e:#}");
                    }
                }
                Err(_) => task.abort(),
            }
        }

        self.stop_web.cancel();
        if let Some(mut task) = self.web_task.take() {
            if timeout(grace, &mut task).await.is_err() {
                task.abort();
            }
        }

        match timeout(grace, self.storage.close()).await {
            Ok(Ok(())) => info!("{} closed", self.torrent.name),
            Ok(Err(e)) => warn!("closing storage failed: {e:#}"),
            Err(_) => warn!("closing storage timed out"),
        }
    }
}

enum Ended {
    Stopped,
    Swarm(anyhow::Result<()>),
    TrackerClient(anyhow::Result<()>),
}

fn flatten(res: Result<anyhow::Result<()>, tokio::task::JoinError>) -> anyhow::Result<()> {
    res.map_err(|e| anyhow!("task failed: {e}"))?
}

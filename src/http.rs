use crate::acceptor::Incoming;
use crate::defs::InfoHash;
use crate::tracker::Tracker;
use axum::Router;
use axum::extract::connect_info::Connected;
use axum::extract::{ConnectInfo, RawQuery, State};
use axum::http::{StatusCode, Uri, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::serve::{IncomingStream, Listener};
use std::fmt::Write;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const TORRENT_CONTENT_TYPE: &str = "application/x-bittorrent";

/// Hands the web server the connections the acceptor recognised as HTTP
#[derive(Debug)]
pub struct ForwardedListener {
    streams: mpsc::Receiver<(Incoming, SocketAddr)>,
    local_addr: SocketAddr,
}

impl ForwardedListener {
    pub fn new(local_addr: SocketAddr) -> (mpsc::Sender<(Incoming, SocketAddr)>, ForwardedListener) {
        let (tx, rx) = mpsc::channel(32);
        (
            tx,
            ForwardedListener {
                streams: rx,
                local_addr,
            },
        )
    }
}

impl Listener for ForwardedListener {
    type Io = Incoming;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Incoming, SocketAddr) {
        match self.streams.recv().await {
            Some(incoming) => incoming,
            // the acceptor is gone, wait for the shutdown signal
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

/// Address of the client on the other end of a forwarded connection
#[derive(Debug, Clone, Copy)]
pub struct Remote(pub SocketAddr);

impl Connected<IncomingStream<'_, ForwardedListener>> for Remote {
    fn connect_info(stream: IncomingStream<'_, ForwardedListener>) -> Self {
        Remote(*stream.remote_addr())
    }
}

async fn index(State(tracker): State<Arc<Tracker>>) -> Html<String> {
    let mut page = String::from("<html><head><title>piecemeal tracker</title></head><body>\n<h1>piecemeal tracker</h1>\n<ul>\n");
    for (info_hash, peers) in tracker.tracked() {
        let _ = writeln!(
            page,
            "<li><a href=\"/{hex}.torrent\">{hex}</a> {peers} peers</li>",
            hex = info_hash.to_hex()
        );
    }
    page.push_str("</ul>\n</body></html>\n");
    Html(page)
}

fn announce(tracker: &Tracker, remote: SocketAddr, query: Option<String>) -> Response {
    let body = tracker.handle_query(query.unwrap_or_default().as_bytes(), remote.ip());
    ([(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

fn metainfo(tracker: &Tracker, path: &str) -> Response {
    let found = path
        .strip_prefix('/')
        .and_then(|file| file.strip_suffix(".torrent"))
        .and_then(InfoHash::from_hex)
        .and_then(|h| tracker.metainfo(&h));

    match found {
        Some(bytes) => ([(header::CONTENT_TYPE, TORRENT_CONTENT_TYPE)], bytes.to_vec()).into_response(),
        None => {
            debug!("no torrent behind {path}");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// Anything under `/announce` is the tracker, the rest can only be a metadata file
async fn by_path(
    State(tracker): State<Arc<Tracker>>,
    ConnectInfo(Remote(remote)): ConnectInfo<Remote>,
    uri: Uri,
    RawQuery(query): RawQuery,
) -> Response {
    let path = uri.path();
    if path.starts_with("/announce") {
        announce(&tracker, remote, query)
    } else {
        metainfo(&tracker, path)
    }
}

/// `/` lists what we track, `/announce...` is the tracker, `/<info hash>.torrent` hands out metadata
pub fn router(tracker: Arc<Tracker>) -> Router {
    Router::new()
        .route("/", get(index))
        .fallback(by_path)
        .with_state(tracker)
}

/// Serves forwarded connections until `stop` fires
pub async fn serve(tracker: Arc<Tracker>, listener: ForwardedListener, stop: CancellationToken) -> io::Result<()> {
    axum::serve(listener, router(tracker).into_make_service_with_connect_info::<Remote>())
        .with_graceful_shutdown(stop.cancelled_owned())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acceptor::Rewound;
    use crate::torrent::{FileEntry, Torrent};
    use crate::tracker_client::parse_tracker_response;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_util::bytes::Bytes;

    async fn web() -> (SocketAddr, Torrent, CancellationToken) {
        let tracker = Arc::new(Tracker::new(Duration::from_secs(60)));
        let torrent = Torrent::from_parts(
            "http://localhost/announce".to_string(),
            "blob".to_string(),
            16,
            vec![[3; 20]],
            vec![FileEntry {
                path: vec![],
                length: 5,
            }],
        )
        .unwrap();
        tracker.register(&torrent);

        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let (forward, listener) = ForwardedListener::new(addr);
        tokio::spawn(async move {
            while let Ok((stream, remote)) = tcp.accept().await {
                let _ = forward.send((Rewound::new(Bytes::new(), stream), remote)).await;
            }
        });

        let stop = CancellationToken::new();
        tokio::spawn(serve(tracker, listener, stop.clone()));
        (addr, torrent, stop)
    }

    #[tokio::test]
    async fn serves_the_torrent_file() {
        let (addr, torrent, stop) = web().await;

        let response = reqwest::get(format!("http://{addr}/{}.torrent", torrent.info_hash.to_hex()))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["content-type"], TORRENT_CONTENT_TYPE);
        assert_eq!(response.bytes().await.unwrap().as_ref(), torrent.to_bytes().as_slice());

        let response = reqwest::get(format!("http://{addr}/{}.torrent", "00".repeat(20)))
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
        let response = reqwest::get(format!("http://{addr}/nothing/here")).await.unwrap();
        assert_eq!(response.status(), 404);
        stop.cancel();
    }

    #[tokio::test]
    async fn index_lists_tracked_torrents() {
        let (addr, torrent, stop) = web().await;

        let page = reqwest::get(format!("http://{addr}/")).await.unwrap().text().await.unwrap();
        assert!(page.contains(&torrent.info_hash.to_hex()));
        stop.cancel();
    }

    #[tokio::test]
    async fn announce_goes_to_the_tracker() {
        let (addr, _torrent, stop) = web().await;

        let body = reqwest::get(format!("http://{addr}/announce?info_hash=%01"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        let err = parse_tracker_response(&body).unwrap_err();
        assert_eq!(err.to_string(), "tracker refused the announce: bad info_hash");

        for path in ["announce.php", "announce/extra"] {
            let body = reqwest::get(format!("http://{addr}/{path}?info_hash=%01"))
                .await
                .unwrap()
                .bytes()
                .await
                .unwrap();
            let err = parse_tracker_response(&body).unwrap_err();
            assert_eq!(err.to_string(), "tracker refused the announce: bad info_hash", "{path}");
        }
        stop.cancel();
    }

    #[tokio::test]
    async fn announces_carry_the_client_address() {
        let (addr, torrent, stop) = web().await;
        let h: String = url::form_urlencoded::byte_serialize(torrent.info_hash.as_bytes()).collect();

        let body = reqwest::get(format!(
            "http://{addr}/announce?info_hash={h}&peer_id=-PM0100-aaaaaaaaaaaa&port=7000&left=0&compact=1"
        ))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
        assert!(parse_tracker_response(&body).unwrap().peers.is_empty());

        let body = reqwest::get(format!(
            "http://{addr}/announce?info_hash={h}&peer_id=-PM0100-bbbbbbbbbbbb&port=7001&left=5"
        ))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
        let peers = parse_tracker_response(&body).unwrap().peers;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].addr, "127.0.0.1:7000".parse().unwrap());
        stop.cancel();
    }
}

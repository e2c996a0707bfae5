use crate::peer::{self, PeerContext};
use crate::wire::HANDSHAKE_TIMEOUT;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the first four bytes of a connection say it is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    BitTorrent,
    Http,
    Unknown,
}

pub fn sniff(magic: &[u8; 4]) -> Protocol {
    match magic {
        b"\x13Bit" => Protocol::BitTorrent,
        b"GET " => Protocol::Http,
        _ => Protocol::Unknown,
    }
}

/// A stream with the bytes we already read off its front put back in front of it
#[derive(Debug)]
pub struct Rewound<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Rewound<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Rewound { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewound<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            let head = self.prefix.split_to(n);
            buf.put_slice(&head);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewound<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// A connection handed on by the acceptor, its first four bytes included
pub type Incoming = Rewound<TcpStream>;

/// Reads the four bytes that tell the protocols apart. `None` if the other side hung up first.
async fn read_magic(tcp: &mut TcpStream) -> io::Result<Option<[u8; 4]>> {
    let mut magic = [0u8; 4];
    match tcp.read_exact(&mut magic).await {
        Ok(_) => Ok(Some(magic)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

/// Owns the listening socket and sorts incoming connections into peers and web requests
#[derive(Debug)]
pub struct Acceptor {
    listener: TcpListener,
    peers: PeerContext,
    /// present only when we run the embedded tracker
    http: Option<mpsc::Sender<(Incoming, SocketAddr)>>,
}

impl Acceptor {
    pub fn new(
        listener: TcpListener,
        peers: PeerContext,
        http: Option<mpsc::Sender<(Incoming, SocketAddr)>>,
    ) -> Self {
        Acceptor { listener, peers, http }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts until `stop` fires, every connection is sorted out on its own task
    pub async fn run(self, stop: CancellationToken) {
        info!("accepting connections on {:?}", self.listener.local_addr());
        loop {
            let (tcp, remote) = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                },
            };

            let peers = self.peers.clone();
            let http = self.http.clone();
            tokio::spawn(async move {
                if let Err(e) = dispatch(tcp, remote, peers, http).await {
                    debug!("connection from {remote} ended: {e:#}");
                }
            });
        }
        debug!("acceptor stopped");
    }
}

async fn dispatch(
    mut tcp: TcpStream,
    remote: SocketAddr,
    peers: PeerContext,
    http: Option<mpsc::Sender<(Incoming, SocketAddr)>>,
) -> anyhow::Result<()> {
    let Ok(magic) = timeout(HANDSHAKE_TIMEOUT, read_magic(&mut tcp)).await else {
        debug!("{remote} said nothing, closing");
        return Ok(());
    };
    let Some(magic) = magic? else {
        return Ok(());
    };

    let protocol = sniff(&magic);
    let stream = Rewound::new(Bytes::copy_from_slice(&magic), tcp);

    match (protocol, http) {
        (Protocol::BitTorrent, _) => {
            // over capacity, just hang up
            if !peers.swarm.needs_peers().await {
                debug!("turning away {remote}, no room");
                return Ok(());
            }
            peer::accept(peers, stream, remote).await
        }
        (Protocol::Http, Some(http)) => {
            let _ = http.send((stream, remote)).await;
            Ok(())
        }
        _ => {
            debug!("{remote} speaks neither protocol, closing");
            Ok(())
        }
    }
}

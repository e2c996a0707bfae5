use crate::peer::state::PeerState;
use crate::swarm::SwarmCounters;
use crate::wire::{BtEncoder, BtMessage, KeepAlive, Request};
use futures::SinkExt;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::Notify;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Sent when we have been quiet this long
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

#[derive(Debug, Default)]
struct Queue {
    messages: VecDeque<BtMessage>,
    /// a choke went in and no unchoke since
    choking: bool,
}

/// Messages waiting to go out on one connection
#[derive(Debug, Default)]
pub struct Outbound {
    queue: Mutex<Queue>,
    notify: Notify,
}

impl Outbound {
    fn queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a message. Queuing a choke drops every piece payload still waiting, and pieces
    /// pushed after it are dropped until the next unchoke. A block read from disk while the
    /// choke went in never goes out.
    pub fn push(&self, msg: BtMessage) {
        {
            let mut queue = self.queue();
            match msg {
                BtMessage::Choke(_) => {
                    queue.choking = true;
                    queue.messages.retain(|m| !m.is_piece());
                }
                BtMessage::Unchoke(_) => queue.choking = false,
                BtMessage::Piece(ref p) if queue.choking => {
                    trace!(index = p.index, begin = p.begin, "dropping piece for a choked peer");
                    return;
                }
                _ => {}
            }
            queue.messages.push_back(msg);
        }
        self.notify.notify_one();
    }

    /// Control messages go first, piece payloads only when nothing else is waiting
    pub fn pop_next(&self) -> Option<BtMessage> {
        let mut queue = self.queue();
        match queue.messages.iter().position(|m| !m.is_piece()) {
            Some(i) => queue.messages.remove(i),
            None => queue.messages.pop_front(),
        }
    }

    /// Removes a not yet sent answer to `request`
    pub fn cancel(&self, request: &Request) -> bool {
        let mut queue = self.queue();
        let found = queue
            .messages
            .iter()
            .position(|m| matches!(m, BtMessage::Piece(p) if p.request() == *request));
        match found {
            Some(i) => {
                queue.messages.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.queue().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue().messages.is_empty()
    }
}

/// Drains the queue into the socket until the connection is closed. Piece payloads are counted
/// as uploaded once they are handed to the socket.
pub async fn write_loop<W>(
    mut writer: FramedWrite<W, BtEncoder>,
    outbound: Arc<Outbound>,
    state: Arc<RwLock<PeerState>>,
    counters: Arc<SwarmCounters>,
    closed: CancellationToken,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let res = async {
        loop {
            while let Some(msg) = outbound.pop_next() {
                let sent = match &msg {
                    BtMessage::Piece(p) => p.data.len() as u64,
                    _ => 0,
                };
                trace!(?msg, "sending");
                writer.feed(msg).await?;

                if sent > 0 {
                    state.write().unwrap_or_else(PoisonError::into_inner).uploaded += sent;
                    counters.add_uploaded(sent);
                }
            }
            writer.flush().await?;

            tokio::select! {
                _ = closed.cancelled() => return Ok(()),
                _ = outbound.notify.notified() => {}
                _ = tokio::time::sleep(KEEPALIVE_INTERVAL) => {
                    outbound.push(BtMessage::KeepAlive(KeepAlive));
                }
            }
        }
    }
    .await;

    // whatever ended the writer ends the connection
    closed.cancel();
    res
}

//! TCP transport: outbound connections and the inbound listener.
//!
//! Each node keeps one outbound connection per peer, opened lazily on the
//! first send (peers come up at different times, so the first connect
//! retries with a fixed backoff). Sends are synchronous: a framed message
//! followed by a blocking wait for the acknowledgment byte, which gives
//! every ordered pair of nodes reliable FIFO delivery.
//!
//! The inbound side is an accept loop with one receiver task per
//! connection. Receiver tasks only decode frames, answer the ack byte, and
//! enqueue events into the node's mailbox; protocol state is touched by
//! the dispatch task alone.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use cairn_protocol::{Event, Message, NodeId};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::frame::{read_ack, read_frame, write_ack, write_frame};

/// How many times to retry the initial connect to a peer.
const CONNECT_ATTEMPTS: u32 = 40;

/// Delay between connect attempts.
const CONNECT_BACKOFF: Duration = Duration::from_millis(250);

// ============================================================================
// Address Book
// ============================================================================

/// Socket addresses of every node, indexed by id.
#[derive(Debug, Clone)]
pub struct AddressBook {
    addrs: Vec<SocketAddr>,
}

impl AddressBook {
    /// Creates an address book; entry `i` is node `i`'s listen address.
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self { addrs }
    }

    /// Returns `node`'s listen address.
    pub fn addr(&self, node: NodeId) -> SocketAddr {
        self.addrs[node.as_usize()]
    }
}

// ============================================================================
// Outbound
// ============================================================================

/// The outbound side of one node: lazily connected, acknowledged sends.
pub struct Transport {
    id: NodeId,
    book: AddressBook,
    connections: HashMap<NodeId, TcpStream>,
}

impl Transport {
    /// Creates an unconnected transport.
    pub fn new(id: NodeId, book: AddressBook) -> Self {
        Self {
            id,
            book,
            connections: HashMap::new(),
        }
    }

    /// Sends one message to `to` and waits for its acknowledgment byte.
    ///
    /// Connects on first use; a mid-exchange failure drops the connection
    /// and surfaces as a hard error (the protocol assumes reliable links,
    /// so there is no resend path).
    pub async fn send(&mut self, to: NodeId, message: &Message) -> Result<()> {
        if !self.connections.contains_key(&to) {
            let stream = connect_with_retry(to, self.book.addr(to)).await?;
            debug!(node = %self.id, peer = %to, "connected");
            self.connections.insert(to, stream);
        }
        // Borrow is re-established so the error path below can remove it.
        let result = match self.connections.get_mut(&to) {
            Some(stream) => exchange(stream, to, message).await,
            None => Err(Error::PeerClosed { peer: to }),
        };
        if result.is_err() {
            self.connections.remove(&to);
        }
        result
    }
}

async fn exchange(stream: &mut TcpStream, peer: NodeId, message: &Message) -> Result<()> {
    trace!(%peer, payload = message.payload.name(), "send");
    write_frame(stream, message).await?;
    read_ack(stream).await.map_err(|err| match err {
        Error::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
            Error::PeerClosed { peer }
        }
        other => other,
    })
}

async fn connect_with_retry(peer: NodeId, addr: SocketAddr) -> Result<TcpStream> {
    for attempt in 1..=CONNECT_ATTEMPTS {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => {
                trace!(%peer, %addr, attempt, %err, "connect failed, retrying");
                sleep(CONNECT_BACKOFF).await;
            }
        }
    }
    Err(Error::ConnectFailed {
        peer,
        attempts: CONNECT_ATTEMPTS,
    })
}

/// Sends one message over a fresh connection and closes it. Used for baton
/// hand-offs, which happen outside the per-peer send streams.
pub async fn send_once(peer: NodeId, addr: SocketAddr, message: &Message) -> Result<()> {
    let mut stream = connect_with_retry(peer, addr).await?;
    stream.set_nodelay(true)?;
    exchange(&mut stream, peer, message).await
}

// ============================================================================
// Inbound
// ============================================================================

/// Spawns the accept loop; every decoded frame lands in `events` as
/// [`Event::Message`].
pub fn spawn_listener(listener: TcpListener, events: UnboundedSender<Event>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    trace!(%remote, "accepted");
                    tokio::spawn(receive_loop(stream, events.clone()));
                }
                Err(err) => {
                    warn!(%err, "accept failed");
                    return;
                }
            }
        }
    })
}

async fn receive_loop(mut stream: TcpStream, events: UnboundedSender<Event>) {
    loop {
        let message = match read_frame(&mut stream).await {
            Ok(message) => message,
            Err(Error::Io(io)) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                trace!("peer closed connection");
                return;
            }
            Err(err) => {
                warn!(%err, "receive failed, dropping connection");
                return;
            }
        };
        if let Err(err) = write_ack(&mut stream).await {
            warn!(%err, "ack failed, dropping connection");
            return;
        }
        if events.send(Event::Message(message)).is_err() {
            // Dispatch loop is gone; the node is shutting down.
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_protocol::Payload;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn send_lands_in_mailbox() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_listener(listener, tx);

        let book = AddressBook::new(vec![addr, addr]);
        let mut transport = Transport::new(NodeId::new(0), book);
        let message = Message::new(NodeId::new(0), Payload::Complete);
        transport.send(NodeId::new(1), &message).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event, Event::Message(message));
    }

    #[tokio::test]
    async fn sends_on_one_link_stay_ordered() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_listener(listener, tx);

        let book = AddressBook::new(vec![addr, addr]);
        let mut transport = Transport::new(NodeId::new(0), book);
        for i in 0..10u8 {
            let message = Message::new(NodeId::new(i), Payload::CheckpointAck);
            transport.send(NodeId::new(1), &message).await.unwrap();
        }
        for i in 0..10u8 {
            let Some(Event::Message(message)) = rx.recv().await else {
                panic!("mailbox closed early");
            };
            assert_eq!(message.from, NodeId::new(i));
        }
    }

    #[tokio::test]
    async fn send_once_uses_a_fresh_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_listener(listener, tx);

        let message = Message::new(NodeId::new(2), Payload::RecoveryAck);
        send_once(NodeId::new(1), addr, &message).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event, Event::Message(message));
    }
}

//! The dispatch loop.
//!
//! One task owns the engine and the outbound transport. It drains the
//! mailbox, feeds each event through [`NodeState::process`], sends the
//! resulting messages in order (awaiting each acknowledgment, which
//! serializes every outbound handshake), and spawns baton hand-offs with a
//! randomized delay. Nothing else ever touches protocol state.

use std::time::Duration;

use cairn_protocol::{Event, Forward, Message, NodeId, NodeState, Payload, Protocol, RoundStep};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::transport::{AddressBook, Transport, send_once};

/// The dispatch loop of one node.
pub struct Runtime {
    node: NodeState,
    transport: Transport,
    book: AddressBook,
    events: UnboundedReceiver<Event>,
    /// Loopback sender for batons addressed to this node itself.
    loopback: UnboundedSender<Event>,
    /// Upper bound on the random delay before a baton hand-off.
    forward_jitter: Duration,
}

impl Runtime {
    /// Creates a dispatch loop over an engine and its transport.
    pub fn new(
        node: NodeState,
        transport: Transport,
        book: AddressBook,
        events: UnboundedReceiver<Event>,
        loopback: UnboundedSender<Event>,
        forward_jitter: Duration,
    ) -> Self {
        Self {
            node,
            transport,
            book,
            events,
            loopback,
            forward_jitter,
        }
    }

    /// Runs until the engine closes or a fatal error occurs.
    ///
    /// Pending baton hand-offs are drained before returning, so a node that
    /// closes immediately after finishing a round still delivers the baton.
    pub async fn run(self) -> Result<()> {
        let Self {
            mut node,
            mut transport,
            book,
            mut events,
            loopback,
            forward_jitter,
        } = self;
        let id = node.id();
        let mut rng = SmallRng::from_entropy();
        let mut forwards: JoinSet<Result<()>> = JoinSet::new();

        while let Some(event) = events.recv().await {
            let (next, out) = match node.process(event) {
                Ok(step) => step,
                Err(err) => {
                    error!(node = %id, %err, "fatal protocol error, halting");
                    return Err(err.into());
                }
            };
            node = next;
            for outbound in out.messages {
                transport.send(outbound.to, &outbound.message).await?;
            }
            if let Some(forward) = out.forward {
                let delay = jitter(forward_jitter, &mut rng);
                spawn_forward(&mut forwards, id, &book, &loopback, forward, delay);
            }
            if node.is_closed() {
                break;
            }
        }

        while let Some(joined) = forwards.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(node = %id, %err, "baton hand-off failed"),
                Err(err) => warn!(node = %id, %err, "baton task panicked"),
            }
        }
        info!(node = %id, "dispatch loop finished");
        Ok(())
    }
}

/// Injects a round plan into a node's own mailbox after `delay`. Used at
/// startup by the plan's first executor.
pub fn schedule_plan(
    events: UnboundedSender<Event>,
    plan: Vec<RoundStep>,
    delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        sleep(delay).await;
        let _ = events.send(Event::Protocol(plan));
    })
}

fn jitter(max: Duration, rng: &mut SmallRng) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    max.mul_f64(rng.gen_range(0.0..=1.0))
}

fn spawn_forward(
    forwards: &mut JoinSet<Result<()>>,
    id: NodeId,
    book: &AddressBook,
    loopback: &UnboundedSender<Event>,
    forward: Forward,
    delay: Duration,
) {
    let Forward { to, plan } = forward;
    if to == id {
        let loopback = loopback.clone();
        forwards.spawn(async move {
            sleep(delay).await;
            let _ = loopback.send(Event::Protocol(plan));
            Ok(())
        });
    } else {
        let addr = book.addr(to);
        let message = Message::new(id, Payload::Protocol(Protocol { plan }));
        forwards.spawn(async move {
            sleep(delay).await;
            send_once(to, addr, &message).await
        });
    }
}

//! Per-node dispatch state machine.
//!
//! [`NodeState`] is the pure core of a node: it consumes [`Event`]s one at a
//! time and produces [`Output`]s that the shell executes. It performs no I/O
//! and holds no clocks or randomness, so any interleaving can be replayed
//! deterministically in tests.
//!
//! # Phases
//!
//! ```text
//! Idle ──Protocol/Checkpoint/Recovery──▶ Round ──last ack──▶ Gather ──▶ Idle
//!   │                                      │ (participant: back to Idle)
//!   └──────────── all complete ──▶ Closed ◀┘
//! ```
//!
//! While a round's convergecast is outstanding the node defers application
//! traffic (inbound `Simple`s and local send requests) in arrival order and
//! replays it through the engine once the round commits or rolls back, so
//! FIFO delivery is preserved across rounds.

mod checkpoint;
mod gather;
mod recovery;

use std::collections::{BTreeSet, VecDeque};
use std::mem;

use tracing::{debug, trace};

use crate::causal::{CausalState, Snapshot};
use crate::clock::ClockMatrix;
use crate::error::ProtocolError;
use crate::message::{ClockReport, ClockSource, Message, Payload, Simple};
use crate::types::{NodeId, RoundOp, RoundStep, Topology};

// ============================================================================
// Events and Outputs
// ============================================================================

/// An input to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// An inbound message from a peer.
    Message(Message),
    /// The workload requests one application send.
    Traffic {
        /// The chosen neighbor.
        to: NodeId,
    },
    /// The workload has exhausted its send budget.
    WorkloadDone,
    /// A round plan injected locally (this node is the plan's first
    /// executor).
    Protocol(Vec<RoundStep>),
}

/// A message the shell must send to a specific peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    /// The recipient.
    pub to: NodeId,
    /// The message to deliver.
    pub message: Message,
}

/// A baton hand-off the shell must perform after a randomized delay.
///
/// Delaying in the shell keeps the engine free of time; the delay itself is
/// cosmetic (it spreads rounds out relative to background traffic) and
/// carries no correctness weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    /// The next executor (may be this node itself).
    pub to: NodeId,
    /// The remaining plan, head first; the head names `to`.
    pub plan: Vec<RoundStep>,
}

/// Everything the shell must do after one engine step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    /// Messages to send, in order.
    pub messages: Vec<Outbound>,
    /// A delayed baton hand-off, if a round just finished with steps left.
    pub forward: Option<Forward>,
}

// ============================================================================
// Phases
// ============================================================================

/// A round in progress: the convergecast bookkeeping of one checkpoint or
/// recovery handshake.
#[derive(Debug, Clone)]
pub(crate) struct RoundState {
    /// Which operation this round performs.
    pub(crate) op: RoundOp,
    /// The peer whose request pulled this node into the round; `None` for
    /// the initiator.
    pub(crate) origin: Option<NodeId>,
    /// Remaining plan steps to forward once the round ends (initiator only).
    pub(crate) plan_tail: Vec<RoundStep>,
    /// Peers whose acknowledgment is still outstanding.
    pub(crate) pending: BTreeSet<NodeId>,
    /// The tentative snapshot (checkpoint rounds only).
    pub(crate) tentative: Option<Snapshot>,
    /// Application events deferred until the round ends, in arrival order.
    pub(crate) deferred: VecDeque<Event>,
}

/// The initiator's clock-gathering step after its round committed.
#[derive(Debug, Clone)]
pub(crate) struct GatherState {
    /// Which clock the probes asked for.
    pub(crate) source: ClockSource,
    /// Remaining plan steps to forward once verification passes.
    pub(crate) plan_tail: Vec<RoundStep>,
    /// The rows collected so far.
    pub(crate) matrix: ClockMatrix,
}

#[derive(Debug, Clone)]
pub(crate) enum Phase {
    Idle,
    Round(RoundState),
    Gather(GatherState),
    Closed,
}

impl Phase {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Round(round) => match round.op {
                RoundOp::Checkpoint => "checkpoint round",
                RoundOp::Recovery => "recovery round",
            },
            Phase::Gather(_) => "gather",
            Phase::Closed => "closed",
        }
    }
}

// ============================================================================
// Node State
// ============================================================================

/// The complete protocol state of one node.
#[derive(Debug, Clone)]
pub struct NodeState {
    topology: Topology,
    causal: CausalState,
    /// The last committed checkpoint; rollback target, never mutated by a
    /// rollback itself.
    permanent: Snapshot,
    phase: Phase,
    /// Per-node completion flags, merged from `Complete` broadcasts.
    complete: Vec<bool>,
}

impl NodeState {
    /// Creates the startup state for one node.
    pub fn new(topology: Topology) -> Self {
        let n = topology.node_count();
        let id = topology.id();
        Self {
            topology,
            causal: CausalState::new(id, n),
            permanent: Snapshot::initial(n),
            phase: Phase::Idle,
            complete: vec![false; n],
        }
    }

    /// Returns this node's id.
    pub fn id(&self) -> NodeId {
        self.topology.id()
    }

    /// Returns the live causal state.
    pub fn causal(&self) -> &CausalState {
        &self.causal
    }

    /// Returns the last committed checkpoint.
    pub fn permanent(&self) -> &Snapshot {
        &self.permanent
    }

    /// Returns true once every node's completion flag is set and no round
    /// is in progress; the shell exits.
    pub fn is_closed(&self) -> bool {
        matches!(self.phase, Phase::Closed)
    }

    /// Applies one event, returning the successor state and what the shell
    /// must do. An error is a fatal invariant violation; the node halts.
    pub fn process(mut self, event: Event) -> Result<(Self, Output), ProtocolError> {
        let mut out = Output::default();
        self.dispatch(event, &mut out)?;
        Ok((self, out))
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn dispatch(&mut self, event: Event, out: &mut Output) -> Result<(), ProtocolError> {
        match event {
            Event::Message(message) => self.on_message(message, out),
            Event::Traffic { to } => self.on_traffic(to, out),
            Event::WorkloadDone => self.on_workload_done(out),
            Event::Protocol(plan) => self.on_protocol(plan, out),
        }
    }

    fn on_message(&mut self, message: Message, out: &mut Output) -> Result<(), ProtocolError> {
        let from = message.from;
        trace!(
            node = %self.id(),
            %from,
            payload = message.payload.name(),
            phase = self.phase.name(),
            "message",
        );
        match message.payload {
            Payload::Simple(simple) => self.on_simple(from, simple, out),
            Payload::Complete => self.on_complete(from, out),
            Payload::Protocol(protocol) => self.on_protocol(protocol.plan, out),
            Payload::Checkpoint(request) => self.on_checkpoint_request(from, request, out),
            Payload::CheckpointAck => self.on_checkpoint_ack(from, out),
            Payload::Recovery(request) => self.on_recovery_request(from, request, out),
            Payload::RecoveryAck => self.on_recovery_ack(from, out),
            Payload::ClockProbe(source) => self.on_clock_probe(from, source, out),
            Payload::ClockReport(report) => self.on_clock_report(from, report, out),
        }
    }

    // ------------------------------------------------------------------
    // Application traffic
    // ------------------------------------------------------------------

    fn on_simple(
        &mut self,
        from: NodeId,
        simple: Simple,
        _out: &mut Output,
    ) -> Result<(), ProtocolError> {
        match &mut self.phase {
            Phase::Idle | Phase::Gather(_) => {
                self.causal.observe(from, simple.label, &simple.clock);
                trace!(
                    node = %self.id(),
                    %from,
                    label = %simple.label,
                    clock = %self.causal.clock(),
                    "delivered",
                );
                Ok(())
            }
            Phase::Round(round) => {
                round
                    .deferred
                    .push_back(Event::Message(Message::new(from, Payload::Simple(simple))));
                Ok(())
            }
            Phase::Closed => {
                // Every node reported completion before we closed; nothing
                // arriving now belongs to an epoch we still track.
                trace!(node = %self.id(), %from, "dropping Simple after close");
                Ok(())
            }
        }
    }

    fn on_traffic(&mut self, to: NodeId, out: &mut Output) -> Result<(), ProtocolError> {
        match &mut self.phase {
            Phase::Idle | Phase::Gather(_) => {
                let label = self.causal.label_send(to, true);
                let simple = Simple {
                    label,
                    clock: self.causal.clock().clone(),
                };
                trace!(node = %self.id(), %to, %label, "sending");
                out.messages.push(Outbound {
                    to,
                    message: Message::new(self.id(), Payload::Simple(simple)),
                });
                Ok(())
            }
            Phase::Round(round) => {
                round.deferred.push_back(Event::Traffic { to });
                Ok(())
            }
            Phase::Closed => {
                trace!(node = %self.id(), %to, "dropping send request after close");
                Ok(())
            }
        }
    }

    fn on_workload_done(&mut self, out: &mut Output) -> Result<(), ProtocolError> {
        match &mut self.phase {
            Phase::Idle | Phase::Gather(_) => {
                debug!(node = %self.id(), "workload complete");
                let own = self.id().as_usize();
                self.complete[own] = true;
                let recipients: Vec<NodeId> = self.topology.others().collect();
                for to in recipients {
                    self.send(out, to, Payload::Complete);
                }
                self.check_closed();
                Ok(())
            }
            Phase::Round(round) => {
                round.deferred.push_back(Event::WorkloadDone);
                Ok(())
            }
            Phase::Closed => Ok(()),
        }
    }

    fn on_complete(&mut self, from: NodeId, _out: &mut Output) -> Result<(), ProtocolError> {
        debug!(node = %self.id(), %from, "peer complete");
        self.complete[from.as_usize()] = true;
        self.check_closed();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Round control
    // ------------------------------------------------------------------

    fn on_protocol(
        &mut self,
        plan: Vec<RoundStep>,
        out: &mut Output,
    ) -> Result<(), ProtocolError> {
        if !matches!(self.phase, Phase::Idle) {
            return Err(ProtocolError::UnexpectedMessage {
                payload: "Protocol",
                from: self.id(),
                phase: self.phase.name(),
            });
        }
        let Some((head, tail)) = plan.split_first() else {
            // An empty plan is a no-op baton; nothing to execute or forward.
            return Ok(());
        };
        if head.node != self.id() {
            return Err(ProtocolError::MisdirectedBaton {
                addressed: head.node,
                own: self.id(),
            });
        }
        debug!(
            node = %self.id(),
            op = %head.op,
            remaining = tail.len(),
            "initiating round",
        );
        match head.op {
            RoundOp::Checkpoint => self.begin_checkpoint(None, tail.to_vec(), out),
            RoundOp::Recovery => self.begin_recovery(None, tail.to_vec(), out),
        }
    }

    // ------------------------------------------------------------------
    // Helpers shared by the coordinators
    // ------------------------------------------------------------------

    /// Sends a protocol-internal message: the label counter and LLS advance,
    /// FLS does not (only application traffic marks epoch dependencies).
    pub(crate) fn send(&mut self, out: &mut Output, to: NodeId, payload: Payload) {
        self.causal.label_send(to, false);
        out.messages.push(Outbound {
            to,
            message: Message::new(self.id(), payload),
        });
    }

    pub(crate) fn topology(&self) -> &Topology {
        &self.topology
    }

    pub(crate) fn causal_mut(&mut self) -> &mut CausalState {
        &mut self.causal
    }

    pub(crate) fn set_permanent(&mut self, snapshot: Snapshot) {
        self.permanent = snapshot;
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    /// Takes the current phase, leaving `Idle` behind. The coordinators use
    /// this to move `RoundState`/`GatherState` out by value when a round
    /// finishes.
    pub(crate) fn take_phase(&mut self) -> Phase {
        mem::replace(&mut self.phase, Phase::Idle)
    }

    pub(crate) fn phase(&self) -> &Phase {
        &self.phase
    }

    pub(crate) fn phase_mut(&mut self) -> &mut Phase {
        &mut self.phase
    }

    /// Replays events deferred during a round, oldest first.
    pub(crate) fn replay_deferred(
        &mut self,
        deferred: VecDeque<Event>,
        out: &mut Output,
    ) -> Result<(), ProtocolError> {
        for event in deferred {
            self.dispatch(event, out)?;
        }
        Ok(())
    }

    /// Transitions to `Closed` when every completion flag is set. Only an
    /// idle node closes; a node mid-round re-checks on returning to idle.
    pub(crate) fn check_closed(&mut self) {
        if matches!(self.phase, Phase::Idle) && self.complete.iter().all(|&done| done) {
            debug!(node = %self.id(), "all nodes complete, closing");
            self.phase = Phase::Closed;
        }
    }

    // ------------------------------------------------------------------
    // Verification probes (answered in every phase)
    // ------------------------------------------------------------------

    fn on_clock_probe(
        &mut self,
        from: NodeId,
        source: ClockSource,
        out: &mut Output,
    ) -> Result<(), ProtocolError> {
        let clock = match source {
            ClockSource::Live => self.causal.clock().clone(),
            ClockSource::Stable => self.permanent.clock.clone(),
        };
        self.send(
            out,
            from,
            Payload::ClockReport(ClockReport { source, clock }),
        );
        Ok(())
    }
}

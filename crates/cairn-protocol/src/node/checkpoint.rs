//! Checkpoint round coordination.
//!
//! A checkpoint round is a convergecast over the dependency tree: the
//! coordinator takes a tentative snapshot, asks every neighbor it received
//! from this epoch to do the same, and commits once the whole subtree has
//! acknowledged. A neighbor that did not send into the coordinator's epoch
//! is left out entirely (selective propagation).

use std::collections::{BTreeSet, VecDeque};

use tracing::{debug, trace};

use crate::error::ProtocolError;
use crate::message::{CheckpointRequest, ClockSource, Payload};
use crate::node::{NodeState, Output, Phase, RoundState};
use crate::types::{NodeId, RoundOp, RoundStep};

impl NodeState {
    /// Starts a checkpoint round on this node, as initiator (`origin` =
    /// `None`) or because `origin`'s request pulled us in.
    pub(crate) fn begin_checkpoint(
        &mut self,
        origin: Option<NodeId>,
        plan_tail: Vec<RoundStep>,
        out: &mut Output,
    ) -> Result<(), ProtocolError> {
        let tentative = self.causal_mut().begin_epoch();

        // Only neighbors we actually received from this epoch hold state
        // that could depend on ours; the rest keep their old checkpoints.
        let dependents: Vec<(NodeId, _)> = self
            .topology()
            .neighbors()
            .filter(|&peer| Some(peer) != origin)
            .filter_map(|peer| tentative.llr.get(peer).map(|label| (peer, label)))
            .collect();

        let mut pending = BTreeSet::new();
        for (peer, last_recv) in dependents {
            trace!(node = %self.id(), %peer, %last_recv, "checkpoint request");
            self.send(
                out,
                peer,
                Payload::Checkpoint(CheckpointRequest {
                    last_recv: Some(last_recv),
                }),
            );
            pending.insert(peer);
        }

        let round = RoundState {
            op: RoundOp::Checkpoint,
            origin,
            plan_tail,
            pending,
            tentative: Some(tentative),
            deferred: VecDeque::new(),
        };
        if round.pending.is_empty() {
            self.finish_checkpoint(round, out)
        } else {
            self.set_phase(Phase::Round(round));
            Ok(())
        }
    }

    /// Handles an inbound `Checkpoint` request.
    pub(crate) fn on_checkpoint_request(
        &mut self,
        from: NodeId,
        request: CheckpointRequest,
        out: &mut Output,
    ) -> Result<(), ProtocolError> {
        match self.phase() {
            Phase::Idle => {
                // Join iff we sent into the requester's epoch and it saw
                // our first such send; otherwise our checkpoint already
                // agrees with its tentative one.
                let joins = match self.causal().fls(from) {
                    Some(first_sent) => request.last_recv >= Some(first_sent),
                    None => false,
                };
                if joins {
                    debug!(node = %self.id(), origin = %from, "joining checkpoint round");
                    self.begin_checkpoint(Some(from), Vec::new(), out)
                } else {
                    trace!(node = %self.id(), origin = %from, "checkpoint not needed");
                    self.send(out, from, Payload::CheckpointAck);
                    Ok(())
                }
            }
            Phase::Round(round) if round.op == RoundOp::Checkpoint => {
                // Already in this round via another path through the graph;
                // acknowledging immediately keeps the convergecast a tree.
                trace!(node = %self.id(), origin = %from, "duplicate checkpoint request");
                self.send(out, from, Payload::CheckpointAck);
                Ok(())
            }
            Phase::Round(round) => Err(ProtocolError::CrossRoundRequest {
                incoming: RoundOp::Checkpoint,
                from,
                current: round.op,
            }),
            Phase::Gather(_) => Err(ProtocolError::UnexpectedMessage {
                payload: "Checkpoint",
                from,
                phase: self.phase().name(),
            }),
            Phase::Closed => {
                trace!(node = %self.id(), %from, "dropping Checkpoint after close");
                Ok(())
            }
        }
    }

    /// Handles a `CheckpointAck` from a pending subtree.
    pub(crate) fn on_checkpoint_ack(
        &mut self,
        from: NodeId,
        out: &mut Output,
    ) -> Result<(), ProtocolError> {
        match self.phase_mut() {
            Phase::Round(round) if round.op == RoundOp::Checkpoint => {
                if !round.pending.remove(&from) {
                    return Err(ProtocolError::StrayAck {
                        op: RoundOp::Checkpoint,
                        from,
                    });
                }
                if round.pending.is_empty() {
                    if let Phase::Round(round) = self.take_phase() {
                        self.finish_checkpoint(round, out)?;
                    }
                }
                Ok(())
            }
            phase => Err(ProtocolError::UnexpectedMessage {
                payload: "CheckpointAck",
                from,
                phase: phase.name(),
            }),
        }
    }

    /// Commits the round: the tentative snapshot becomes permanent, the
    /// initiator moves on to gathering clocks, a participant acknowledges
    /// its origin. Deferred traffic replays after the commit.
    fn finish_checkpoint(
        &mut self,
        round: RoundState,
        out: &mut Output,
    ) -> Result<(), ProtocolError> {
        let RoundState {
            origin,
            plan_tail,
            tentative,
            deferred,
            ..
        } = round;
        if let Some(tentative) = tentative {
            self.causal_mut().commit_epoch(&tentative);
            self.set_permanent(tentative);
        }
        debug!(node = %self.id(), clock = %self.permanent().clock, "checkpoint committed");

        match origin {
            Some(origin) => {
                self.send(out, origin, Payload::CheckpointAck);
                self.set_phase(Phase::Idle);
                self.replay_deferred(deferred, out)?;
                self.check_closed();
                Ok(())
            }
            None => {
                self.enter_gather(ClockSource::Stable, plan_tail, out)?;
                self.replay_deferred(deferred, out)
            }
        }
    }
}

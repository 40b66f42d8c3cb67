//! Recovery round coordination.
//!
//! Recovery mirrors the checkpoint convergecast with the propagation test
//! moved to the receiver: the coordinator tells every neighbor its
//! pre-rollback state, and a neighbor rolls back iff it received something
//! the coordinator's restored state will not remember sending. Rollback
//! itself happens only once the node's own subtree has acknowledged, so a
//! node never serves its pre-rollback state to a peer after discarding it.

use std::collections::{BTreeSet, VecDeque};

use tracing::{debug, trace};

use crate::error::ProtocolError;
use crate::message::{ClockSource, Payload, RecoveryRequest};
use crate::node::{NodeState, Output, Phase, RoundState};
use crate::types::{NodeId, RoundOp, RoundStep};

impl NodeState {
    /// Starts a recovery round on this node, as initiator (`origin` =
    /// `None`) or pulled in by `origin`'s request.
    pub(crate) fn begin_recovery(
        &mut self,
        origin: Option<NodeId>,
        plan_tail: Vec<RoundStep>,
        out: &mut Output,
    ) -> Result<(), ProtocolError> {
        // Every request in this round must carry the same state, so capture
        // it before the sends below advance the label counter. The LLS map
        // comes from the checkpoint being restored: a peer compares its
        // deliveries against what our post-rollback state will remember
        // having sent, not against the history we are about to discard.
        let label = self.causal().last_label();
        let clock = self.causal().clock().clone();
        let lls = self.permanent().lls.clone();

        let peers: Vec<NodeId> = self
            .topology()
            .neighbors()
            .filter(|&peer| Some(peer) != origin)
            .collect();

        let mut pending = BTreeSet::new();
        for peer in peers {
            trace!(node = %self.id(), %peer, "recovery request");
            self.send(
                out,
                peer,
                Payload::Recovery(RecoveryRequest {
                    label,
                    clock: clock.clone(),
                    lls: lls.clone(),
                }),
            );
            pending.insert(peer);
        }

        let round = RoundState {
            op: RoundOp::Recovery,
            origin,
            plan_tail,
            pending,
            tentative: None,
            deferred: VecDeque::new(),
        };
        if round.pending.is_empty() {
            self.finish_recovery(round, out)
        } else {
            self.set_phase(Phase::Round(round));
            Ok(())
        }
    }

    /// Handles an inbound `Recovery` request.
    pub(crate) fn on_recovery_request(
        &mut self,
        from: NodeId,
        request: RecoveryRequest,
        out: &mut Output,
    ) -> Result<(), ProtocolError> {
        match self.phase() {
            Phase::Idle => {
                // Roll back iff we received a message the requester's
                // restored state will not remember sending. `None < Some`
                // covers both "nothing received" and "never sent to us".
                let orphaned = self.causal().llr(from) > request.lls.get(self.id());
                if orphaned {
                    debug!(node = %self.id(), origin = %from, "joining recovery round");
                    self.begin_recovery(Some(from), Vec::new(), out)
                } else {
                    trace!(node = %self.id(), origin = %from, "rollback not needed");
                    self.send(out, from, Payload::RecoveryAck);
                    Ok(())
                }
            }
            Phase::Round(round) if round.op == RoundOp::Recovery => {
                trace!(node = %self.id(), origin = %from, "duplicate recovery request");
                self.send(out, from, Payload::RecoveryAck);
                Ok(())
            }
            Phase::Round(round) => Err(ProtocolError::CrossRoundRequest {
                incoming: RoundOp::Recovery,
                from,
                current: round.op,
            }),
            Phase::Gather(_) => Err(ProtocolError::UnexpectedMessage {
                payload: "Recovery",
                from,
                phase: self.phase().name(),
            }),
            Phase::Closed => {
                trace!(node = %self.id(), %from, "dropping Recovery after close");
                Ok(())
            }
        }
    }

    /// Handles a `RecoveryAck` from a pending subtree.
    pub(crate) fn on_recovery_ack(
        &mut self,
        from: NodeId,
        out: &mut Output,
    ) -> Result<(), ProtocolError> {
        match self.phase_mut() {
            Phase::Round(round) if round.op == RoundOp::Recovery => {
                if !round.pending.remove(&from) {
                    return Err(ProtocolError::StrayAck {
                        op: RoundOp::Recovery,
                        from,
                    });
                }
                if round.pending.is_empty() {
                    if let Phase::Round(round) = self.take_phase() {
                        self.finish_recovery(round, out)?;
                    }
                }
                Ok(())
            }
            phase => Err(ProtocolError::UnexpectedMessage {
                payload: "RecoveryAck",
                from,
                phase: phase.name(),
            }),
        }
    }

    /// Rolls back to the last committed checkpoint once the subtree has
    /// acknowledged, then replays deferred traffic against the restored
    /// state.
    fn finish_recovery(
        &mut self,
        round: RoundState,
        out: &mut Output,
    ) -> Result<(), ProtocolError> {
        let RoundState {
            origin,
            plan_tail,
            deferred,
            ..
        } = round;
        let permanent = self.permanent().clone();
        self.causal_mut().rollback(&permanent);
        debug!(node = %self.id(), clock = %self.causal().clock(), "rolled back");

        match origin {
            Some(origin) => {
                self.send(out, origin, Payload::RecoveryAck);
                self.set_phase(Phase::Idle);
                self.replay_deferred(deferred, out)?;
                self.check_closed();
                Ok(())
            }
            None => {
                self.enter_gather(ClockSource::Live, plan_tail, out)?;
                self.replay_deferred(deferred, out)
            }
        }
    }
}

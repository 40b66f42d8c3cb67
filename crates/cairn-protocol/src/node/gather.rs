//! Post-round global snapshot verification.
//!
//! After its own round commits, the initiator probes every node for a clock
//! (the permanent checkpoint's clock after a checkpoint round, the live one
//! after recovery), assembles the reports into an n×n matrix, and checks
//! that the union forms a consistent cut. A violation means a round
//! committed an inconsistent global state and is fatal.

use tracing::{debug, info};

use crate::clock::ClockMatrix;
use crate::error::ProtocolError;
use crate::message::{ClockReport, ClockSource, Payload};
use crate::node::{Forward, GatherState, NodeState, Output, Phase};
use crate::types::{NodeId, RoundStep};

impl NodeState {
    /// Broadcasts clock probes and starts collecting rows. Completes
    /// immediately in a single-node graph.
    pub(crate) fn enter_gather(
        &mut self,
        source: ClockSource,
        plan_tail: Vec<RoundStep>,
        out: &mut Output,
    ) -> Result<(), ProtocolError> {
        let mut matrix = ClockMatrix::new(self.topology().node_count());
        let own_row = match source {
            ClockSource::Live => self.causal().clock().clone(),
            ClockSource::Stable => self.permanent().clock.clone(),
        };
        matrix.record(self.id(), own_row);

        let peers: Vec<NodeId> = self.topology().others().collect();
        for peer in peers {
            self.send(out, peer, Payload::ClockProbe(source));
        }

        let gather = GatherState {
            source,
            plan_tail,
            matrix,
        };
        if gather.matrix.is_complete() {
            self.finish_gather(gather, out)
        } else {
            self.set_phase(Phase::Gather(gather));
            Ok(())
        }
    }

    /// Handles a `ClockReport`; only the gathering initiator may see one.
    pub(crate) fn on_clock_report(
        &mut self,
        from: NodeId,
        report: ClockReport,
        out: &mut Output,
    ) -> Result<(), ProtocolError> {
        let id = self.id();
        match self.phase_mut() {
            Phase::Gather(gather) => {
                if report.source != gather.source || gather.matrix.has_row(from) {
                    return Err(ProtocolError::UnexpectedMessage {
                        payload: "ClockReport",
                        from,
                        phase: "gather",
                    });
                }
                debug!(node = %id, %from, clock = %report.clock, "clock report");
                gather.matrix.record(from, report.clock);
                if gather.matrix.is_complete() {
                    if let Phase::Gather(gather) = self.take_phase() {
                        self.finish_gather(gather, out)?;
                    }
                }
                Ok(())
            }
            phase => Err(ProtocolError::UnexpectedMessage {
                payload: "ClockReport",
                from,
                phase: phase.name(),
            }),
        }
    }

    /// Verifies the gathered cut and hands the baton on.
    fn finish_gather(
        &mut self,
        gather: GatherState,
        out: &mut Output,
    ) -> Result<(), ProtocolError> {
        gather
            .matrix
            .verify()
            .map_err(ProtocolError::InconsistentCut)?;
        info!(node = %self.id(), "global state verified consistent");

        self.set_phase(Phase::Idle);
        if let Some(next) = gather.plan_tail.first() {
            // The shell owes this hand-off even if the node closes on the
            // same step; it drains pending forwards before exiting.
            out.forward = Some(Forward {
                to: next.node,
                plan: gather.plan_tail,
            });
        }
        self.check_closed();
        Ok(())
    }
}

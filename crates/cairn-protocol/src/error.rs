//! Protocol error types.
//!
//! Every variant is a fatal invariant violation: the engine returns it from
//! [`crate::NodeState::process`] and the shell halts the node. None of these
//! are recovered from locally.

use thiserror::Error;

use crate::clock::CutViolation;
use crate::types::{NodeId, RoundOp};

/// A fatal protocol invariant violation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A message type arrived in a phase that cannot accept it.
    #[error("unexpected {payload} from node {from} in {phase} phase")]
    UnexpectedMessage {
        /// The offending message type.
        payload: &'static str,
        /// Its sender.
        from: NodeId,
        /// The phase the engine was in.
        phase: &'static str,
    },

    /// A round baton named a different node as its first executor.
    #[error("protocol baton for node {addressed} delivered to node {own}")]
    MisdirectedBaton {
        /// The node the plan's head step names.
        addressed: NodeId,
        /// The node that received the baton.
        own: NodeId,
    },

    /// An acknowledgment arrived from a peer the round was not waiting on.
    #[error("{op} ack from node {from}, which is not pending")]
    StrayAck {
        /// The round operation in progress.
        op: RoundOp,
        /// The unexpected responder.
        from: NodeId,
    },

    /// A request for the opposite operation arrived mid-round; rounds are
    /// strictly one at a time.
    #[error("{incoming} request from node {from} during a {current} round")]
    CrossRoundRequest {
        /// The operation the intruding request asks for.
        incoming: RoundOp,
        /// Its sender.
        from: NodeId,
        /// The operation already in progress.
        current: RoundOp,
    },

    /// The gathered global state is not a consistent cut.
    #[error(
        "inconsistent cut: node {observer} observed {claimed} events from \
         node {owner}, which recorded only {recorded}",
        observer = .0.observer,
        claimed = .0.claimed,
        owner = .0.owner,
        recorded = .0.recorded,
    )]
    InconsistentCut(CutViolation),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_parties() {
        let err = ProtocolError::InconsistentCut(CutViolation {
            observer: NodeId::new(1),
            owner: NodeId::new(0),
            claimed: 5,
            recorded: 3,
        });
        let text = err.to_string();
        assert!(text.contains("node 1"));
        assert!(text.contains("5 events"));
        assert!(text.contains("only 3"));
    }
}

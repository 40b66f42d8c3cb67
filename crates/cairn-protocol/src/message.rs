//! Cairn wire protocol messages.
//!
//! This module defines all messages exchanged between nodes:
//!
//! ## Application Traffic
//! - [`Simple`] - Node → Neighbor: labeled application message
//! - `Complete` - Node → All: my send budget is exhausted
//!
//! ## Round Control
//! - [`Protocol`] - Previous executor → Next: the round baton with the
//!   remaining plan steps
//!
//! ## Checkpoint Round
//! - [`CheckpointRequest`] - Coordinator → Dependent neighbor: take a
//!   tentative checkpoint
//! - `CheckpointAck` - Participant → Coordinator: my subtree committed
//!
//! ## Recovery Round
//! - [`RecoveryRequest`] - Coordinator → Neighbor: roll back with me
//! - `RecoveryAck` - Participant → Coordinator: my subtree rolled back
//!
//! ## Verification
//! - `ClockProbe` - Initiator → All: report your clock
//! - [`ClockReport`] - Node → Initiator: here it is

use serde::{Deserialize, Serialize};

use crate::causal::LabelMap;
use crate::clock::VectorClock;
use crate::types::{Label, NodeId, RoundStep};

// ============================================================================
// Message Envelope
// ============================================================================

/// A protocol message with routing information.
///
/// All messages are wrapped in this envelope, which carries the sender's
/// identity. The receiver uses it for dependency bookkeeping and for routing
/// acknowledgments back up the round tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The node that sent this message.
    pub from: NodeId,

    /// The message payload.
    pub payload: Payload,
}

impl Message {
    /// Creates a new message.
    pub fn new(from: NodeId, payload: Payload) -> Self {
        Self { from, payload }
    }
}

// ============================================================================
// Message Payload
// ============================================================================

/// The payload of a protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    // === Application Traffic ===
    /// Node → Neighbor: labeled application message.
    Simple(Simple),

    /// Node → All: my send budget is exhausted.
    Complete,

    // === Round Control ===
    /// Previous executor → Next: the round baton.
    Protocol(Protocol),

    // === Checkpoint Round ===
    /// Coordinator → Dependent neighbor: take a tentative checkpoint.
    Checkpoint(CheckpointRequest),

    /// Participant → Coordinator: my subtree committed.
    CheckpointAck,

    // === Recovery Round ===
    /// Coordinator → Neighbor: roll back with me.
    Recovery(RecoveryRequest),

    /// Participant → Coordinator: my subtree rolled back.
    RecoveryAck,

    // === Verification ===
    /// Initiator → All: report your clock.
    ClockProbe(ClockSource),

    /// Node → Initiator: the requested clock.
    ClockReport(ClockReport),
}

impl Payload {
    /// Returns a human-readable name for the message type.
    pub fn name(&self) -> &'static str {
        match self {
            Payload::Simple(_) => "Simple",
            Payload::Complete => "Complete",
            Payload::Protocol(_) => "Protocol",
            Payload::Checkpoint(_) => "Checkpoint",
            Payload::CheckpointAck => "CheckpointAck",
            Payload::Recovery(_) => "Recovery",
            Payload::RecoveryAck => "RecoveryAck",
            Payload::ClockProbe(_) => "ClockProbe",
            Payload::ClockReport(_) => "ClockReport",
        }
    }
}

// ============================================================================
// Application Traffic
// ============================================================================

/// Node → Neighbor: a labeled application message.
///
/// Carries the sender's label for this send and the sender's vector clock
/// at send time; the receiver records the label as `LLR[from]` and merges
/// the clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Simple {
    /// The label the sender assigned to this send.
    pub label: Label,

    /// The sender's vector clock at send time.
    pub clock: VectorClock,
}

// ============================================================================
// Round Control
// ============================================================================

/// Previous executor → Next: the round baton.
///
/// Carries the remaining plan steps; the first step must name the receiving
/// node, which becomes the initiator of that round and forwards the tail
/// when done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protocol {
    /// The remaining round steps, head first.
    pub plan: Vec<RoundStep>,
}

// ============================================================================
// Checkpoint Round
// ============================================================================

/// Coordinator → Dependent neighbor: take a tentative checkpoint.
///
/// `last_recv` is the coordinator's `LLR` entry for the receiver, taken from
/// its tentative snapshot. The receiver joins the round iff it has sent into
/// the coordinator's current epoch: its `FLS` entry for the coordinator is
/// set and `last_recv >= FLS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRequest {
    /// The label of the last message the coordinator received from the
    /// addressee, or `None` if it received nothing this epoch.
    pub last_recv: Option<Label>,
}

// ============================================================================
// Recovery Round
// ============================================================================

/// Coordinator → Neighbor: roll back with me.
///
/// Carries the coordinator's pre-rollback clock and label, plus the LLS map
/// of the checkpoint it will restore. The receiver rolls back iff it
/// received something the coordinator's restored state will not remember
/// sending: `LLR[coordinator] > lls[self]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRequest {
    /// The coordinator's last assigned label before rollback.
    pub label: Option<Label>,

    /// The coordinator's vector clock before rollback.
    pub clock: VectorClock,

    /// The last-label-sent map of the checkpoint the coordinator is about
    /// to restore; entry `self` is what the receiver's propagation rule
    /// compares against.
    pub lls: LabelMap,
}

// ============================================================================
// Verification
// ============================================================================

/// Which clock a probe asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockSource {
    /// The live vector clock (used after a recovery round).
    Live,
    /// The permanent checkpoint's clock (used after a checkpoint round).
    Stable,
}

/// Node → Initiator: the requested clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockReport {
    /// Which clock this report carries.
    pub source: ClockSource,

    /// The reported clock, one matrix row.
    pub clock: VectorClock,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RoundOp;

    #[test]
    fn payload_names() {
        let probe = Payload::ClockProbe(ClockSource::Stable);
        assert_eq!(probe.name(), "ClockProbe");
        assert_eq!(Payload::CheckpointAck.name(), "CheckpointAck");
    }

    #[test]
    fn wire_roundtrip() {
        let msg = Message::new(
            NodeId::new(2),
            Payload::Protocol(Protocol {
                plan: vec![
                    RoundStep::new(RoundOp::Checkpoint, NodeId::new(1)),
                    RoundStep::new(RoundOp::Recovery, NodeId::new(0)),
                ],
            }),
        );
        let bytes = postcard::to_allocvec(&msg).unwrap();
        let decoded: Message = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }
}

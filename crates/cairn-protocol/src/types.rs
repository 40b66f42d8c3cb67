//! Core protocol types.

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Node Identity
// ============================================================================

/// Identity of a process in the communication graph (`0..n-1`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeId(u8);

impl NodeId {
    /// Creates a node ID from a raw value.
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Returns the raw value as an array index.
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Send Labels
// ============================================================================

/// A per-node logical sequence number, assigned once per outbound send
/// (application and protocol-internal sends alike).
///
/// "No label yet" is expressed as `Option<Label>`; `Option`'s ordering
/// (`None < Some(_)`) gives the sentinel comparisons the propagation rules
/// need.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Label(u64);

impl Label {
    /// The first label a node ever assigns.
    pub const ZERO: Self = Self(0);

    /// Creates a label from a raw value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the label following this one.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Round Sequence
// ============================================================================

/// The operation a round performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundOp {
    /// Take a coordinated checkpoint.
    Checkpoint,
    /// Roll back to the last committed checkpoint.
    Recovery,
}

impl RoundOp {
    /// Returns a human-readable name for the operation.
    pub const fn name(self) -> &'static str {
        match self {
            RoundOp::Checkpoint => "checkpoint",
            RoundOp::Recovery => "recovery",
        }
    }
}

impl fmt::Display for RoundOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One hop of the externally supplied round sequence: which node executes
/// which operation. A `Protocol` baton walks these steps in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundStep {
    /// The operation to perform.
    pub op: RoundOp,
    /// The node that executes it.
    pub node: NodeId,
}

impl RoundStep {
    /// Creates a round step.
    pub const fn new(op: RoundOp, node: NodeId) -> Self {
        Self { op, node }
    }
}

// ============================================================================
// Topology
// ============================================================================

/// A node's immutable view of the communication graph.
#[derive(Debug, Clone)]
pub struct Topology {
    id: NodeId,
    node_count: usize,
    neighbors: Vec<NodeId>,
}

impl Topology {
    /// Creates a topology view for one node.
    ///
    /// `neighbors` must not contain `id` itself or out-of-range ids.
    pub fn new(id: NodeId, node_count: usize, neighbors: Vec<NodeId>) -> Self {
        debug_assert!(id.as_usize() < node_count, "node id out of range");
        debug_assert!(
            neighbors
                .iter()
                .all(|&p| p != id && p.as_usize() < node_count),
            "invalid neighbor list"
        );
        Self {
            id,
            node_count,
            neighbors,
        }
    }

    /// Returns this node's id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Returns the total process count.
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Iterates over this node's neighbors.
    pub fn neighbors(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.neighbors.iter().copied()
    }

    /// Returns true if `id` is a neighbor of this node.
    pub fn is_neighbor(&self, id: NodeId) -> bool {
        self.neighbors.contains(&id)
    }

    /// Iterates over every node except this one.
    pub fn others(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.node_count)
            .map(|i| NodeId::new(i as u8))
            .filter(move |&i| i != self.id)
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn label_ordering_with_sentinel() {
        // None plays the role of the source's -1 sentinel.
        assert!(None < Some(Label::ZERO));
        assert!(Some(Label::new(3)) > Some(Label::new(2)));
        assert_eq!(Label::ZERO.next(), Label::new(1));
    }

    #[test]
    fn topology_others_excludes_self() {
        let topo = Topology::new(NodeId::new(1), 3, vec![NodeId::new(0), NodeId::new(2)]);
        let others: Vec<_> = topo.others().collect();
        assert_eq!(others, vec![NodeId::new(0), NodeId::new(2)]);
        assert!(topo.is_neighbor(NodeId::new(0)));
        assert!(!topo.is_neighbor(NodeId::new(1)));
    }

    #[test_case(RoundOp::Checkpoint, "checkpoint")]
    #[test_case(RoundOp::Recovery, "recovery")]
    fn round_op_names(op: RoundOp, name: &str) {
        assert_eq!(op.name(), name);
        assert_eq!(op.to_string(), name);
    }
}

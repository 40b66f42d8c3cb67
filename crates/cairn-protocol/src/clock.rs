//! Vector clocks and the gathered clock matrix.
//!
//! A vector clock holds one entry per process; entry `k` is this node's
//! knowledge of node `k`'s delivery-event count. Merging on delivery takes
//! the pointwise maximum and then increments the local node's own entry,
//! so a node's own entry is monotonically non-decreasing except on rollback.
//!
//! After each checkpoint or recovery round the initiator gathers every
//! node's resulting clock into a [`ClockMatrix`] and checks that the union
//! forms a consistent cut: no node's record shows it observed more events
//! from a peer than that peer itself recorded.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

// ============================================================================
// Vector Clock
// ============================================================================

/// An `n`-entry vector clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock(Vec<u64>);

impl VectorClock {
    /// Creates an all-zero clock for `n` processes.
    pub fn new(n: usize) -> Self {
        Self(vec![0; n])
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the clock has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the entry for `node`.
    pub fn get(&self, node: NodeId) -> u64 {
        self.0[node.as_usize()]
    }

    /// Merges an incoming clock on message delivery: pointwise maximum,
    /// then one increment of `own`'s entry.
    pub fn observe(&mut self, incoming: &VectorClock, own: NodeId) {
        debug_assert_eq!(self.0.len(), incoming.0.len(), "clock size mismatch");
        for (mine, theirs) in self.0.iter_mut().zip(&incoming.0) {
            *mine = (*mine).max(*theirs);
        }
        self.0[own.as_usize()] += 1;
    }

    /// Iterates over `(node, entry)` pairs.
    pub fn entries(&self) -> impl Iterator<Item = (NodeId, u64)> + '_ {
        self.0
            .iter()
            .enumerate()
            .map(|(i, &v)| (NodeId::new(i as u8), v))
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, "]")
    }
}

// ============================================================================
// Clock Matrix
// ============================================================================

/// A consistent-cut violation: `observer` claims to have seen `claimed`
/// events from `owner`, but `owner` itself recorded only `recorded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutViolation {
    /// The node whose row over-claims.
    pub observer: NodeId,
    /// The node whose own entry falls short.
    pub owner: NodeId,
    /// `matrix[observer][owner]`.
    pub claimed: u64,
    /// `matrix[owner][owner]`.
    pub recorded: u64,
}

/// The n×n matrix gathered after a round: row `i` is node `i`'s reported
/// vector clock. Built fresh per round, discarded after the check.
#[derive(Debug, Clone)]
pub struct ClockMatrix {
    rows: Vec<Option<VectorClock>>,
}

impl ClockMatrix {
    /// Creates an empty matrix for `n` processes.
    pub fn new(n: usize) -> Self {
        Self {
            rows: vec![None; n],
        }
    }

    /// Records `node`'s reported clock as row `node`.
    pub fn record(&mut self, node: NodeId, clock: VectorClock) {
        self.rows[node.as_usize()] = Some(clock);
    }

    /// Returns true if row `node` has been recorded.
    pub fn has_row(&self, node: NodeId) -> bool {
        self.rows[node.as_usize()].is_some()
    }

    /// Returns true once every row is populated.
    pub fn is_complete(&self) -> bool {
        self.rows.iter().all(Option::is_some)
    }

    /// Checks the consistency predicate: for all pairs `(i, j)`,
    /// `matrix[i][i] >= matrix[j][i]` — node `i`'s own recorded event count
    /// must be at least what node `j` claims to have observed from `i`.
    ///
    /// Must only be called on a complete matrix.
    pub fn verify(&self) -> Result<(), CutViolation> {
        debug_assert!(self.is_complete(), "verify on incomplete matrix");
        for (i, owner_row) in self.rows.iter().enumerate() {
            let owner = NodeId::new(i as u8);
            let Some(owner_row) = owner_row else { continue };
            let recorded = owner_row.get(owner);
            for (j, observer_row) in self.rows.iter().enumerate() {
                let Some(observer_row) = observer_row else {
                    continue;
                };
                let claimed = observer_row.get(owner);
                if recorded < claimed {
                    return Err(CutViolation {
                        observer: NodeId::new(j as u8),
                        owner,
                        claimed,
                        recorded,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn clock(entries: &[u64]) -> VectorClock {
        VectorClock(entries.to_vec())
    }

    #[test]
    fn observe_takes_pointwise_max_and_increments_own() {
        let mut a = clock(&[2, 0, 5]);
        let b = clock(&[1, 3, 4]);
        a.observe(&b, NodeId::new(0));
        assert_eq!(a, clock(&[3, 3, 5]));
    }

    #[test]
    fn consistent_matrix_passes() {
        let mut m = ClockMatrix::new(2);
        m.record(NodeId::new(0), clock(&[3, 1]));
        m.record(NodeId::new(1), clock(&[2, 4]));
        assert!(m.is_complete());
        assert!(m.verify().is_ok());
    }

    #[test]
    fn orphan_receive_is_detected() {
        // Node 1 claims 5 events from node 0, but node 0 recorded only 3.
        let mut m = ClockMatrix::new(2);
        m.record(NodeId::new(0), clock(&[3, 0]));
        m.record(NodeId::new(1), clock(&[5, 2]));
        let violation = m.verify().unwrap_err();
        assert_eq!(violation.owner, NodeId::new(0));
        assert_eq!(violation.observer, NodeId::new(1));
        assert_eq!(violation.claimed, 5);
        assert_eq!(violation.recorded, 3);
    }

    #[test]
    fn matrix_completeness() {
        let mut m = ClockMatrix::new(2);
        assert!(!m.is_complete());
        m.record(NodeId::new(1), clock(&[0, 0]));
        assert!(m.has_row(NodeId::new(1)));
        assert!(!m.has_row(NodeId::new(0)));
        assert!(!m.is_complete());
        m.record(NodeId::new(0), clock(&[0, 0]));
        assert!(m.is_complete());
    }

    proptest! {
        /// Merging never decreases any entry (monotonicity outside rollback).
        #[test]
        fn prop_observe_is_monotone(
            mine in proptest::collection::vec(0u64..1000, 4),
            theirs in proptest::collection::vec(0u64..1000, 4),
            own in 0u8..4,
        ) {
            let mut merged = VectorClock(mine.clone());
            merged.observe(&VectorClock(theirs), NodeId::new(own));
            for (i, &before) in mine.iter().enumerate() {
                prop_assert!(merged.0[i] >= before);
            }
            // Own entry strictly advances on delivery.
            prop_assert!(merged.0[own as usize] > mine[own as usize]);
        }
    }
}

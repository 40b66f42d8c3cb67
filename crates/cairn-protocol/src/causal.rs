//! Per-node causal bookkeeping.
//!
//! Besides its vector clock, every node keeps three per-link label arrays
//! that drive the propagation decisions:
//!
//! - **LLR** (last label received): the label of the most recent application
//!   message received from each origin since the last checkpoint. Cleared
//!   when a checkpoint round starts a fresh epoch.
//! - **FLS** (first label sent): the label of the first application message
//!   sent to each destination since the last checkpoint; first-write-wins,
//!   cleared with LLR.
//! - **LLS** (last label sent): the label of the most recent send to each
//!   destination, overwritten on every send and persisted across
//!   checkpoints. Consulted only by the recovery decision rule.
//!
//! All updates happen inside the owning node's dispatch loop; cross-node
//! effects travel only as messages.

use serde::{Deserialize, Serialize};

use crate::clock::VectorClock;
use crate::types::{Label, NodeId};

// ============================================================================
// Label Map
// ============================================================================

/// A per-peer array of optional labels (`None` = "no message yet").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMap(Vec<Option<Label>>);

impl LabelMap {
    /// Creates an all-unset map for `n` processes.
    pub fn new(n: usize) -> Self {
        Self(vec![None; n])
    }

    /// Returns the entry for `node`.
    pub fn get(&self, node: NodeId) -> Option<Label> {
        self.0[node.as_usize()]
    }

    /// Unconditionally overwrites the entry for `node`.
    pub fn set(&mut self, node: NodeId, label: Label) {
        self.0[node.as_usize()] = Some(label);
    }

    /// Sets the entry for `node` only if it is currently unset.
    pub fn set_if_unset(&mut self, node: NodeId, label: Label) {
        let slot = &mut self.0[node.as_usize()];
        if slot.is_none() {
            *slot = Some(label);
        }
    }

    /// Clears every entry.
    pub fn clear(&mut self) {
        self.0.fill(None);
    }

    /// Returns true if any entry is set.
    pub fn any_set(&self) -> bool {
        self.0.iter().any(Option::is_some)
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// A checkpoint: the causal state frozen at one point in logical time.
///
/// Each node owns two instances: a *tentative* snapshot built during a
/// checkpoint round, and a *permanent* one committed when the round fully
/// completes. Rollback restores live state from the permanent snapshot and
/// never mutates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Last label this node had assigned.
    pub label: Option<Label>,
    /// The vector clock at snapshot time.
    pub clock: VectorClock,
    /// Last-label-received at snapshot time.
    pub llr: LabelMap,
    /// First-label-sent at snapshot time.
    pub fls: LabelMap,
    /// Last-label-sent at snapshot time.
    pub lls: LabelMap,
}

impl Snapshot {
    /// The empty snapshot a node starts with before any checkpoint commits.
    pub fn initial(n: usize) -> Self {
        Self {
            label: None,
            clock: VectorClock::new(n),
            llr: LabelMap::new(n),
            fls: LabelMap::new(n),
            lls: LabelMap::new(n),
        }
    }
}

// ============================================================================
// Causal State
// ============================================================================

/// The live causal bookkeeping of one node.
#[derive(Debug, Clone)]
pub struct CausalState {
    own: NodeId,
    clock: VectorClock,
    last_label: Option<Label>,
    llr: LabelMap,
    fls: LabelMap,
    lls: LabelMap,
}

impl CausalState {
    /// Creates the startup state: all-zero clock, no labels assigned,
    /// every per-link entry unset.
    pub fn new(own: NodeId, n: usize) -> Self {
        Self {
            own,
            clock: VectorClock::new(n),
            last_label: None,
            llr: LabelMap::new(n),
            fls: LabelMap::new(n),
            lls: LabelMap::new(n),
        }
    }

    /// Returns the live vector clock.
    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    /// Returns the last label this node assigned, if any.
    pub fn last_label(&self) -> Option<Label> {
        self.last_label
    }

    /// Returns the last label received from `from` in the current epoch.
    pub fn llr(&self, from: NodeId) -> Option<Label> {
        self.llr.get(from)
    }

    /// Returns the first label sent to `to` in the current epoch.
    pub fn fls(&self, to: NodeId) -> Option<Label> {
        self.fls.get(to)
    }

    /// Returns the last label ever sent to `to`.
    pub fn lls(&self, to: NodeId) -> Option<Label> {
        self.lls.get(to)
    }

    /// Returns the full last-label-sent map.
    pub fn lls_map(&self) -> &LabelMap {
        &self.lls
    }

    /// Assigns the label for an outbound send to `to`.
    ///
    /// Every send advances the label counter and overwrites `LLS[to]`.
    /// Only application traffic participates in the FLS dependency record:
    /// protocol-internal sends must not mark a fresh epoch dependency, or
    /// every round would force checkpoints on every neighbor.
    pub fn label_send(&mut self, to: NodeId, application: bool) -> Label {
        let label = self.last_label.map_or(Label::ZERO, Label::next);
        self.last_label = Some(label);
        if application {
            self.fls.set_if_unset(to, label);
        }
        self.lls.set(to, label);
        label
    }

    /// Records the delivery of an application message from `from`:
    /// updates `LLR[from]` and merges the carried clock.
    pub fn observe(&mut self, from: NodeId, label: Label, clock: &VectorClock) {
        self.llr.set(from, label);
        self.clock.observe(clock, self.own);
    }

    /// Copies the live state into a tentative snapshot and opens a fresh
    /// epoch: LLR and FLS are cleared, clock/label/LLS keep running.
    pub fn begin_epoch(&mut self) -> Snapshot {
        let snapshot = Snapshot {
            label: self.last_label,
            clock: self.clock.clone(),
            llr: self.llr.clone(),
            fls: self.fls.clone(),
            lls: self.lls.clone(),
        };
        self.llr.clear();
        self.fls.clear();
        snapshot
    }

    /// Finishes a checkpoint commit: the committed snapshot's LLS becomes
    /// the live LLS (LLR/FLS were already cleared at epoch start).
    pub fn commit_epoch(&mut self, committed: &Snapshot) {
        self.lls = committed.lls.clone();
    }

    /// Rolls the live state back to a committed snapshot: label, clock and
    /// LLS are restored, LLR and FLS cleared. The snapshot is not mutated.
    pub fn rollback(&mut self, committed: &Snapshot) {
        self.last_label = committed.label;
        self.clock = committed.clock.clone();
        self.lls = committed.lls.clone();
        self.llr.clear();
        self.fls.clear();
    }
}

//! Cairn protocol engine.
//!
//! This crate implements the core of a coordinated checkpoint-and-recovery
//! protocol (Koo-Toueg style) for a network of message-passing processes
//! arranged in an arbitrary communication graph. Each node tracks causal
//! dependencies via per-link label counters and a vector clock; on command it
//! takes a consistent distributed checkpoint or rolls back to the last one,
//! and the round initiator verifies afterwards that the resulting global
//! state forms a consistent cut.
//!
//! # Architecture
//!
//! The engine is a pure, deterministic state machine:
//! - Takes events (inbound messages, traffic requests) as input
//! - Produces outgoing messages and baton hand-offs as output
//! - No I/O, no clocks, no randomness
//!
//! The imperative shell (`cairn-net`) owns the transport and the mailbox and
//! drives [`NodeState::process`] one event at a time.
//!
//! # Key Types
//!
//! - [`NodeState`]: the per-node dispatch state machine
//! - [`Event`] / [`Output`]: engine input and output
//! - [`CausalState`]: vector clock and LLR/FLS/LLS bookkeeping
//! - [`Message`] / [`Payload`]: the wire protocol

pub mod causal;
pub mod clock;
pub mod error;
pub mod message;
pub mod node;
pub mod types;

#[cfg(test)]
mod tests;

pub use causal::{CausalState, LabelMap, Snapshot};
pub use clock::{ClockMatrix, CutViolation, VectorClock};
pub use error::ProtocolError;
pub use message::{
    CheckpointRequest, ClockReport, ClockSource, Message, Payload, Protocol, RecoveryRequest,
    Simple,
};
pub use node::{Event, Forward, NodeState, Outbound, Output};
pub use types::{Label, NodeId, RoundOp, RoundStep, Topology};

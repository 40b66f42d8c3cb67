//! Network shell for the Cairn protocol engine.
//!
//! Everything impure lives here: the TCP transport with its synchronous
//! acknowledged framing, the listener feeding each node's mailbox, the
//! dispatch loop that drives [`cairn_protocol::NodeState`], and the
//! background workload. The engine itself stays free of I/O, time, and
//! randomness.

pub mod error;
pub mod frame;
pub mod runtime;
pub mod transport;
pub mod workload;

pub use error::{Error, Result};
pub use runtime::{Runtime, schedule_plan};
pub use transport::{AddressBook, Transport, spawn_listener};
pub use workload::Workload;

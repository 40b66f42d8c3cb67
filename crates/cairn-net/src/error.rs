//! Error types for the network shell.

use cairn_protocol::{NodeId, ProtocolError};
use thiserror::Error;

/// Network shell errors.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),

    /// A frame exceeded the size limit.
    #[error("oversized frame: {len} bytes (limit {limit})")]
    OversizedFrame {
        /// The claimed frame length.
        len: usize,
        /// The enforced limit.
        limit: usize,
    },

    /// A peer never became reachable.
    #[error("could not connect to node {peer} after {attempts} attempts")]
    ConnectFailed {
        /// The unreachable peer.
        peer: NodeId,
        /// How many times we tried.
        attempts: u32,
    },

    /// A peer closed its side mid-exchange (missing ack or truncated frame).
    #[error("connection to node {peer} closed unexpectedly")]
    PeerClosed {
        /// The peer that went away.
        peer: NodeId,
    },

    /// The engine hit a fatal protocol invariant violation.
    #[error(transparent)]
    Engine(#[from] ProtocolError),
}

/// Result alias for network shell operations.
pub type Result<T> = std::result::Result<T, Error>;

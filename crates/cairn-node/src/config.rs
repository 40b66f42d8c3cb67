//! Run configuration: topology, round plan, and workload knobs.
//!
//! One TOML file describes the whole run and is shared by every node; each
//! process picks its own entry by id. Example:
//!
//! ```toml
//! [[node]]
//! id = 0
//! host = "127.0.0.1"
//! port = 7100
//! neighbors = [1]
//!
//! [[node]]
//! id = 1
//! host = "127.0.0.1"
//! port = 7101
//! neighbors = [0, 2]
//!
//! [[node]]
//! id = 2
//! host = "127.0.0.1"
//! port = 7102
//! neighbors = [1]
//!
//! [[step]]
//! op = "checkpoint"
//! node = 1
//!
//! [[step]]
//! op = "recovery"
//! node = 0
//!
//! [workload]
//! messages = 50
//! send_delay_ms = 40
//! round_delay_ms = 2000
//! ```

use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

use cairn_protocol::{NodeId, RoundOp, RoundStep, Topology};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// No nodes defined.
    #[error("configuration defines no nodes")]
    Empty,

    /// Node ids must be exactly 0..n in file order.
    #[error("node ids must be contiguous from 0; entry {index} has id {id}")]
    NonContiguousIds {
        /// Position in the `[[node]]` list.
        index: usize,
        /// The id found there.
        id: u8,
    },

    /// A neighbor reference points outside the node list.
    #[error("node {node} lists unknown neighbor {neighbor}")]
    UnknownNeighbor {
        /// The referring node.
        node: u8,
        /// The missing neighbor id.
        neighbor: u8,
    },

    /// A node lists itself as a neighbor.
    #[error("node {0} lists itself as a neighbor")]
    SelfNeighbor(u8),

    /// The neighbor relation is not symmetric.
    #[error("node {a} lists neighbor {b}, but not vice versa")]
    AsymmetricNeighbors {
        /// The node with the one-sided entry.
        a: u8,
        /// The peer missing the back-reference.
        b: u8,
    },

    /// A plan step names an unknown node.
    #[error("plan step {index} names unknown node {node}")]
    UnknownPlanNode {
        /// Position in the `[[step]]` list.
        index: usize,
        /// The missing node id.
        node: u8,
    },

    /// A host:port pair did not resolve.
    #[error("cannot resolve address {0}")]
    Unresolvable(String),
}

/// One `[[node]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    /// Node id (0-indexed, contiguous).
    pub id: u8,

    /// Host name or address to bind and connect to.
    pub host: String,

    /// Listen port.
    pub port: u16,

    /// Ids of this node's neighbors in the communication graph.
    pub neighbors: Vec<u8>,
}

/// One `[[step]]` entry of the round plan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StepEntry {
    /// The operation this step performs.
    pub op: RoundOp,

    /// The node that initiates it.
    pub node: u8,
}

/// The `[workload]` table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkloadEntry {
    /// Application messages each node sends before declaring completion.
    pub messages: u32,

    /// Mean inter-send delay in milliseconds.
    pub send_delay_ms: u64,

    /// Delay before the first plan step fires, and the upper bound on the
    /// random delay before each baton hand-off.
    pub round_delay_ms: u64,
}

/// The whole run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// All nodes, in id order.
    #[serde(rename = "node")]
    pub nodes: Vec<NodeEntry>,

    /// The round plan, walked by the baton in order. May be empty.
    #[serde(rename = "step", default)]
    pub steps: Vec<StepEntry>,

    /// Traffic parameters.
    pub workload: WorkloadEntry,
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks structural invariants: contiguous ids, known and symmetric
    /// neighbors, no self-edges, in-range plan steps.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::Empty);
        }
        let n = self.nodes.len();
        for (index, node) in self.nodes.iter().enumerate() {
            if node.id as usize != index {
                return Err(ConfigError::NonContiguousIds { index, id: node.id });
            }
        }
        for node in &self.nodes {
            for &neighbor in &node.neighbors {
                if neighbor == node.id {
                    return Err(ConfigError::SelfNeighbor(node.id));
                }
                let Some(peer) = self.nodes.get(neighbor as usize) else {
                    return Err(ConfigError::UnknownNeighbor {
                        node: node.id,
                        neighbor,
                    });
                };
                if !peer.neighbors.contains(&node.id) {
                    return Err(ConfigError::AsymmetricNeighbors {
                        a: node.id,
                        b: neighbor,
                    });
                }
            }
        }
        for (index, step) in self.steps.iter().enumerate() {
            if step.node as usize >= n {
                return Err(ConfigError::UnknownPlanNode {
                    index,
                    node: step.node,
                });
            }
        }
        Ok(())
    }

    /// Returns the process count.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Builds node `id`'s view of the graph.
    pub fn topology(&self, id: NodeId) -> Topology {
        let entry = &self.nodes[id.as_usize()];
        let neighbors = entry.neighbors.iter().copied().map(NodeId::new).collect();
        Topology::new(id, self.node_count(), neighbors)
    }

    /// Resolves every node's listen address, in id order.
    pub fn addresses(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.nodes
            .iter()
            .map(|node| {
                let spec = format!("{}:{}", node.host, node.port);
                spec.to_socket_addrs()
                    .ok()
                    .and_then(|mut addrs| addrs.next())
                    .ok_or(ConfigError::Unresolvable(spec))
            })
            .collect()
    }

    /// The round plan as engine steps.
    pub fn plan(&self) -> Vec<RoundStep> {
        self.steps
            .iter()
            .map(|step| RoundStep::new(step.op, NodeId::new(step.node)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const GOOD: &str = r#"
        [[node]]
        id = 0
        host = "127.0.0.1"
        port = 7100
        neighbors = [1]

        [[node]]
        id = 1
        host = "127.0.0.1"
        port = 7101
        neighbors = [0]

        [[step]]
        op = "checkpoint"
        node = 1

        [workload]
        messages = 10
        send_delay_ms = 5
        round_delay_ms = 100
    "#;

    fn parse(text: &str) -> Config {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn load_roundtrip() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(GOOD.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.node_count(), 2);
        assert_eq!(config.workload.messages, 10);
        let plan = config.plan();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0], RoundStep::new(RoundOp::Checkpoint, NodeId::new(1)));

        let topo = config.topology(NodeId::new(0));
        assert!(topo.is_neighbor(NodeId::new(1)));

        let addrs = config.addresses().unwrap();
        assert_eq!(addrs[1].port(), 7101);
    }

    #[test]
    fn rejects_asymmetric_neighbors() {
        let mut config = parse(GOOD);
        config.nodes[1].neighbors.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::AsymmetricNeighbors { a: 0, b: 1 })
        ));
    }

    #[test]
    fn rejects_self_neighbor() {
        let mut config = parse(GOOD);
        config.nodes[0].neighbors = vec![0];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SelfNeighbor(0))
        ));
    }

    #[test]
    fn rejects_gap_in_ids() {
        let mut config = parse(GOOD);
        config.nodes[1].id = 5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NonContiguousIds { index: 1, id: 5 })
        ));
    }

    #[test]
    fn rejects_plan_step_out_of_range() {
        let mut config = parse(GOOD);
        config.steps.push(StepEntry {
            op: RoundOp::Recovery,
            node: 9,
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownPlanNode { index: 1, node: 9 })
        ));
    }
}

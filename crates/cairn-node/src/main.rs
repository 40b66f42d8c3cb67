//! Cairn node binary.
//!
//! Runs one process of a Cairn deployment: binds the listen socket, starts
//! the background workload, injects the round plan if this node is its
//! first executor, and drives the dispatch loop until every node has
//! reported completion.

mod config;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use cairn_net::{AddressBook, Runtime, Transport, Workload, schedule_plan, spawn_listener};
use cairn_protocol::{NodeId, NodeState};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "cairn-node", version, about = "Cairn checkpoint/recovery node")]
struct Args {
    /// Path to the shared run configuration.
    #[arg(long)]
    config: PathBuf,

    /// This node's id in the configuration.
    #[arg(long)]
    id: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let id = NodeId::new(args.id);
    anyhow::ensure!(
        id.as_usize() < config.node_count(),
        "node id {id} out of range (configuration has {} nodes)",
        config.node_count(),
    );

    let topology = config.topology(id);
    let neighbors: Vec<NodeId> = topology.neighbors().collect();
    let addresses = config.addresses()?;
    let book = AddressBook::new(addresses.clone());

    let listener = TcpListener::bind(addresses[id.as_usize()])
        .await
        .with_context(|| format!("binding {}", addresses[id.as_usize()]))?;
    info!(node = %id, addr = %addresses[id.as_usize()], "listening");

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    spawn_listener(listener, events_tx.clone());

    cairn_net::workload::spawn(
        Workload {
            neighbors,
            messages: config.workload.messages,
            mean_interval: Duration::from_millis(config.workload.send_delay_ms),
        },
        events_tx.clone(),
    );

    let round_delay = Duration::from_millis(config.workload.round_delay_ms);
    let plan = config.plan();
    if plan.first().is_some_and(|step| step.node == id) {
        info!(node = %id, steps = plan.len(), "this node starts the round plan");
        schedule_plan(events_tx.clone(), plan, round_delay);
    }

    let node = NodeState::new(topology);
    let runtime = Runtime::new(
        node,
        Transport::new(id, book.clone()),
        book,
        events_rx,
        events_tx,
        round_delay,
    );
    runtime.run().await?;
    info!(node = %id, "done");
    Ok(())
}

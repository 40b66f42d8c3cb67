//! Background traffic generation.
//!
//! The workload task asks the dispatch loop for sends rather than sending
//! itself: each tick it picks a uniformly random neighbor and enqueues
//! [`Event::Traffic`], and once its budget is spent it enqueues
//! [`Event::WorkloadDone`]. Routing sends through the mailbox keeps the
//! causal bookkeeping under the dispatch task alone.

use std::time::Duration;

use cairn_protocol::{Event, NodeId};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

/// Parameters of one node's background traffic.
#[derive(Debug, Clone)]
pub struct Workload {
    /// Candidate destinations (this node's neighbors).
    pub neighbors: Vec<NodeId>,
    /// How many application messages to send in total.
    pub messages: u32,
    /// Mean of the exponentially distributed inter-send interval.
    pub mean_interval: Duration,
}

/// Spawns the traffic task.
pub fn spawn(workload: Workload, events: UnboundedSender<Event>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rng = SmallRng::from_entropy();
        let sends = if workload.neighbors.is_empty() {
            0
        } else {
            workload.messages
        };
        for _ in 0..sends {
            sleep(interval(workload.mean_interval, &mut rng)).await;
            let to = workload.neighbors[rng.gen_range(0..workload.neighbors.len())];
            if events.send(Event::Traffic { to }).is_err() {
                return;
            }
        }
        debug!(messages = sends, "workload budget spent");
        let _ = events.send(Event::WorkloadDone);
    })
}

/// Draws an exponentially distributed interval with the given mean.
fn interval(mean: Duration, rng: &mut SmallRng) -> Duration {
    let u: f64 = rng.gen_range(f64::EPSILON..1.0);
    mean.mul_f64(-u.ln())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn budget_then_done() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let workload = Workload {
            neighbors: vec![NodeId::new(1), NodeId::new(2)],
            messages: 4,
            mean_interval: Duration::from_millis(10),
        };
        spawn(workload, tx);

        let mut traffic = 0;
        loop {
            match rx.recv().await.unwrap() {
                Event::Traffic { to } => {
                    assert!(to == NodeId::new(1) || to == NodeId::new(2));
                    traffic += 1;
                }
                Event::WorkloadDone => break,
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(traffic, 4);
    }

    #[tokio::test]
    async fn no_neighbors_completes_immediately() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let workload = Workload {
            neighbors: Vec::new(),
            messages: 100,
            mean_interval: Duration::from_secs(3600),
        };
        spawn(workload, tx);
        assert_eq!(rx.recv().await.unwrap(), Event::WorkloadDone);
    }
}

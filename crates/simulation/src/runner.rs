//! Deterministic simulation runner.
//!
//! Processes events in deterministic order and executes actions. Given the
//! same seed, a run produces identical results. Each node is an independent
//! [`ReplicaState`]; the runner owns the clock, the timers, and the network.

use crate::network::{NetworkConfig, SimulatedNetwork};
use crate::NodeIndex;
use pbft_core::{Action, Event, EventPriority, StateMachine, TimerId};
use pbft_replica::{ReplicaConfig, ReplicaState};
use pbft_types::{AcceptAllOracle, ReplicaId};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Deterministic ordering key for queued events: time, then priority, then
/// insertion sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct EventKey {
    at: Duration,
    priority: EventPriority,
    sequence: u64,
}

/// Statistics collected during a simulation.
#[derive(Debug, Default, Clone)]
pub struct SimulationStats {
    /// Total events processed.
    pub events_processed: u64,
    /// Total actions generated.
    pub actions_generated: u64,
    /// Messages scheduled for delivery.
    pub messages_sent: u64,
    /// Messages dropped due to network partition.
    pub messages_dropped_partition: u64,
    /// Messages dropped due to packet loss.
    pub messages_dropped_loss: u64,
    /// Timers set.
    pub timers_set: u64,
    /// Timers cancelled.
    pub timers_cancelled: u64,
}

impl SimulationStats {
    /// Total messages dropped (partition + packet loss).
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped_partition + self.messages_dropped_loss
    }

    /// Message delivery rate.
    pub fn delivery_rate(&self) -> f64 {
        let total = self.messages_sent + self.messages_dropped();
        if total == 0 {
            1.0
        } else {
            self.messages_sent as f64 / total as f64
        }
    }
}

/// Deterministic simulation runner for a group of PBFT replicas.
pub struct SimulationRunner {
    /// All replicas, indexed by [`NodeIndex`].
    nodes: Vec<ReplicaState>,

    /// Global event queue, ordered deterministically.
    queue: BTreeMap<EventKey, (NodeIndex, Event)>,

    /// Insertion counter for deterministic ordering.
    sequence: u64,

    /// Current simulation time.
    now: Duration,

    network: SimulatedNetwork,

    /// RNG for network conditions (seeded for determinism).
    rng: ChaCha8Rng,

    /// Timer registry for cancellation support.
    timers: HashMap<(NodeIndex, TimerId), EventKey>,

    stats: SimulationStats,
}

impl SimulationRunner {
    /// Create a runner with one replica per node in the network config.
    pub fn new(replica_config: ReplicaConfig, network_config: NetworkConfig, seed: u64) -> Self {
        let network = SimulatedNetwork::new(network_config.clone());
        let rng = ChaCha8Rng::seed_from_u64(seed);

        let nodes: Vec<ReplicaState> = (0..network_config.total_nodes)
            .map(|index| {
                ReplicaState::new(
                    ReplicaId(index as u64),
                    replica_config.clone(),
                    Arc::new(AcceptAllOracle),
                )
            })
            .collect();

        info!(
            num_nodes = nodes.len(),
            seed,
            "created simulation runner"
        );

        Self {
            nodes,
            queue: BTreeMap::new(),
            sequence: 0,
            now: Duration::ZERO,
            network,
            rng,
            timers: HashMap::new(),
            stats: SimulationStats::default(),
        }
    }

    // ─── Accessors ───

    pub fn node(&self, index: NodeIndex) -> Option<&ReplicaState> {
        self.nodes.get(index as usize)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn network(&self) -> &SimulatedNetwork {
        &self.network
    }

    /// Mutable network access for partition/loss configuration.
    pub fn network_mut(&mut self) -> &mut SimulatedNetwork {
        &mut self.network
    }

    // ─── Scheduling ───

    /// Schedule an event for `node` after `delay`.
    pub fn schedule_event(&mut self, node: NodeIndex, delay: Duration, event: Event) {
        let key = EventKey {
            at: self.now + delay,
            priority: event.priority(),
            sequence: self.sequence,
        };
        self.sequence += 1;
        self.queue.insert(key, (node, event));
    }

    // ─── Execution ───

    /// Process events until the queue is empty or `max_events` is hit.
    /// Returns the number of events processed.
    pub fn run_to_quiescence(&mut self, max_events: u64) -> u64 {
        let mut processed = 0;
        while processed < max_events && self.step() {
            processed += 1;
        }
        processed
    }

    /// Process events with a timestamp at or before `deadline`.
    pub fn run_until(&mut self, deadline: Duration) -> u64 {
        let mut processed = 0;
        loop {
            let Some((&key, _)) = self.queue.iter().next() else {
                break;
            };
            if key.at > deadline {
                break;
            }
            if !self.step() {
                break;
            }
            processed += 1;
        }
        self.now = self.now.max(deadline);
        processed
    }

    /// Process a single event. Returns false when the queue is empty.
    pub fn step(&mut self) -> bool {
        let Some((&key, _)) = self.queue.iter().next() else {
            return false;
        };
        let Some((node, event)) = self.queue.remove(&key) else {
            return false;
        };
        self.now = key.at;

        // A fired timer is no longer pending.
        if matches!(event, Event::RequestTimer) {
            self.timers.remove(&(node, TimerId::Request));
        }

        trace!(node, kind = event.type_name(), at = ?self.now, "dispatching event");
        self.stats.events_processed += 1;

        let actions = match self.nodes.get_mut(node as usize) {
            Some(replica) => replica.handle(event),
            None => return true,
        };
        self.stats.actions_generated += actions.len() as u64;
        self.execute_actions(node, actions);
        true
    }

    fn execute_actions(&mut self, node: NodeIndex, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Broadcast { message } => {
                    // Deliver to every replica, self included. The message
                    // is snapshotted per destination before dispatch.
                    for dest in self.network.all_nodes() {
                        self.deliver(node, dest, message.clone());
                    }
                }
                Action::SendTo { node: dest, message } => {
                    self.deliver(node, dest.0 as NodeIndex, message);
                }
                Action::SetTimer { id, duration } => {
                    // Re-arming replaces any pending timer with the same id.
                    if let Some(old_key) = self.timers.remove(&(node, id)) {
                        self.queue.remove(&old_key);
                    }
                    let key = EventKey {
                        at: self.now + duration,
                        priority: EventPriority::Timer,
                        sequence: self.sequence,
                    };
                    self.sequence += 1;
                    self.queue.insert(key, (node, Event::RequestTimer));
                    self.timers.insert((node, id), key);
                    self.stats.timers_set += 1;
                }
                Action::CancelTimer { id } => {
                    if let Some(key) = self.timers.remove(&(node, id)) {
                        self.queue.remove(&key);
                    }
                    self.stats.timers_cancelled += 1;
                }
            }
        }
    }

    fn deliver(&mut self, from: NodeIndex, to: NodeIndex, message: pbft_types::ConsensusMessage) {
        if self.network.is_partitioned(from, to) {
            self.stats.messages_dropped_partition += 1;
            return;
        }
        match self.network.should_deliver(from, to, &mut self.rng) {
            Some(latency) => {
                self.stats.messages_sent += 1;
                let key = EventKey {
                    at: self.now + latency,
                    priority: EventPriority::Network,
                    sequence: self.sequence,
                };
                self.sequence += 1;
                self.queue
                    .insert(key, (to, Event::MessageReceived { message }));
            }
            None => {
                debug!(from, to, "packet lost");
                self.stats.messages_dropped_loss += 1;
            }
        }
    }
}

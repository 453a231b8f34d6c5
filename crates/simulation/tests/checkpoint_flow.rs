//! End-to-end checkpoint tests on the deterministic runner.
//!
//! Four replicas, f = 1, checkpoints every 3 sequences, window K = 6. All
//! execution is synchronous with simulated time; the same seed always
//! produces the same run.

use pbft_core::Event;
use pbft_replica::ReplicaConfig;
use pbft_simulation::{NetworkConfig, SimulationRunner};
use pbft_types::{ClientId, Digest, MessagePayload, Prepare, ReplicaId, Reply, ViewId};
use std::time::Duration;
use tracing_test::traced_test;

fn test_config() -> ReplicaConfig {
    ReplicaConfig {
        total_replicas: 4,
        max_faulty: 1,
        checkpoint_interval: 3,
        watermark_window: 6,
        warmup_checkpoint: None,
        request_timeout: Duration::from_secs(5),
    }
}

fn make_runner(seed: u64) -> SimulationRunner {
    SimulationRunner::new(test_config(), NetworkConfig::default(), seed)
}

fn reply(seq: u64, state_digest: Digest) -> Reply {
    Reply {
        view: ViewId(0),
        seq,
        client: ClientId::new("alice"),
        timestamp: seq,
        state_digest,
    }
}

#[traced_test]
#[test]
fn checkpoint_stabilizes_on_every_replica() {
    let mut runner = make_runner(42);
    let digest = Digest::of(b"state-after-3");

    // Every replica reports execution through sequence 3; each broadcasts a
    // checkpoint proof.
    for node in 0..4 {
        runner.schedule_event(node, Duration::ZERO, Event::RequestExecuted {
            reply: reply(3, digest),
        });
    }
    runner.run_to_quiescence(10_000);

    for node in 0..4 {
        let replica = runner.node(node).expect("node exists");
        assert_eq!(replica.low_mark(), 3, "node {node} low mark");
        assert_eq!(replica.high_mark(), 9, "node {node} high mark");
        let stable = replica.last_stable().expect("stable slot");
        assert_eq!(stable.seq, 3);
        assert!(stable.stable);
        assert_eq!(stable.digest, digest);
        assert!(replica.log().is_empty(), "node {node} log purged");
    }
    assert!(runner.stats().messages_sent >= 16, "4 broadcasts x 4 peers");
}

#[traced_test]
#[test]
fn quorum_survives_one_faulty_digest() {
    let mut runner = make_runner(7);
    let honest = Digest::of(b"honest-state");
    let tampered = Digest::of(b"tampered-state");

    for node in 0..3 {
        runner.schedule_event(node, Duration::ZERO, Event::RequestExecuted {
            reply: reply(3, honest),
        });
    }
    // Replica 3 disagrees about the state digest.
    runner.schedule_event(3, Duration::ZERO, Event::RequestExecuted {
        reply: reply(3, tampered),
    });
    runner.run_to_quiescence(10_000);

    for node in 0..4 {
        let replica = runner.node(node).expect("node exists");
        assert_eq!(replica.low_mark(), 3, "node {node} stabilized");
        let stable = replica.last_stable().expect("stable slot");
        assert_eq!(stable.digest, honest, "stability lands on the 2f+1 digest");
        // Replica 3's proof is retained on the replicas that received it.
        assert!(stable.matching(honest) >= 3);
    }
}

#[test]
fn out_of_window_messages_leave_log_unchanged() {
    let mut runner = make_runner(3);
    let digest = Digest::of(b"state-after-3");

    for node in 0..4 {
        runner.schedule_event(node, Duration::ZERO, Event::RequestExecuted {
            reply: reply(3, digest),
        });
    }
    runner.run_to_quiescence(10_000);
    assert_eq!(runner.node(0).unwrap().low_mark(), 3);

    // Below and above the (3, 9] window.
    for seq in [2u64, 10] {
        let prepare = Prepare {
            view: ViewId(0),
            seq,
            digest: Digest::of(b"op"),
            node: ReplicaId(1),
        };
        runner.schedule_event(0, Duration::ZERO, Event::MessageReceived {
            message: pbft_types::ConsensusMessage::broadcast(
                ReplicaId(1),
                MessagePayload::Prepare(prepare),
            ),
        });
    }
    runner.run_to_quiescence(100);

    assert!(runner.node(0).unwrap().log().is_empty());
}

#[test]
fn isolated_replica_does_not_stabilize() {
    let mut runner = make_runner(11);
    runner.network_mut().isolate_node(3);
    let digest = Digest::of(b"state-after-3");

    for node in 0..4 {
        runner.schedule_event(node, Duration::ZERO, Event::RequestExecuted {
            reply: reply(3, digest),
        });
    }
    runner.run_to_quiescence(10_000);

    // The connected majority stabilizes; the isolated node only holds its
    // own proof.
    for node in 0..3 {
        assert_eq!(runner.node(node).unwrap().low_mark(), 3);
    }
    assert_eq!(runner.node(3).unwrap().low_mark(), 0);
    assert!(runner.stats().messages_dropped_partition > 0);
}

#[test]
fn same_seed_same_run() {
    let run = |seed| {
        let mut runner = make_runner(seed);
        let digest = Digest::of(b"state-after-3");
        for node in 0..4 {
            runner.schedule_event(node, Duration::ZERO, Event::RequestExecuted {
                reply: reply(3, digest),
            });
        }
        runner.run_to_quiescence(10_000);
        (
            runner.stats().events_processed,
            runner.stats().messages_sent,
            runner.now(),
        )
    };

    assert_eq!(run(99), run(99));
}

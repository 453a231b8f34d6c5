//! End-to-end view-change tests on the deterministic runner.
//!
//! Four replicas, f = 1, checkpoints every 3 sequences, window K = 6. The
//! group stabilizes a checkpoint at sequence 3, the backup timers expire,
//! and node 1 (primary of view 1) drives the transition.

use pbft_core::Event;
use pbft_replica::{ReplicaConfig, ReplicaStatus, Stage};
use pbft_simulation::{NetworkConfig, NodeIndex, SimulationRunner};
use pbft_types::{
    ClientId, ConsensusMessage, Digest, MessagePayload, PrePrepare, Prepare, ReplicaId, Reply,
    ViewId,
};
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

/// Drive every replica to a stable checkpoint at sequence 3.
fn stabilize_at_3(runner: &mut SimulationRunner) -> Digest {
    let digest = Digest::of(b"state-after-3");
    for node in 0..4 {
        runner.schedule_event(node, Duration::ZERO, Event::RequestExecuted {
            reply: Reply {
                view: ViewId(0),
                seq: 3,
                client: ClientId::new("alice"),
                timestamp: 3,
                state_digest: digest,
            },
        });
    }
    runner.run_to_quiescence(10_000);
    for node in 0..4 {
        assert_eq!(runner.node(node).unwrap().low_mark(), 3);
    }
    digest
}

/// Feed `node` a prepared certificate for `seq` at view 0: the primary's
/// pre-prepare plus prepares from replicas 1 and 2.
fn seed_prepared(runner: &mut SimulationRunner, node: NodeIndex, seq: u64, digest: Digest) {
    let pp = PrePrepare {
        view: ViewId(0),
        seq,
        digest,
    };
    runner.schedule_event(node, Duration::ZERO, Event::MessageReceived {
        message: ConsensusMessage::broadcast(ReplicaId(0), MessagePayload::PrePrepare(pp)),
    });
    for voter in [1u64, 2] {
        let prepare = Prepare {
            view: ViewId(0),
            seq,
            digest,
            node: ReplicaId(voter),
        };
        runner.schedule_event(node, Duration::ZERO, Event::MessageReceived {
            message: ConsensusMessage::broadcast(
                ReplicaId(voter),
                MessagePayload::Prepare(prepare),
            ),
        });
    }
    runner.run_to_quiescence(100);
    assert!(runner.node(node).unwrap().log().is_prepared(seq, &test_config()));
}

#[traced_test]
#[test]
fn coordinated_view_change_with_empty_p() {
    let mut runner = make_runner(42);
    stabilize_at_3(&mut runner);

    // Every replica suspects the primary of view 0.
    for node in 0..4 {
        runner.schedule_event(node, Duration::from_millis(100), Event::RequestTimer);
    }
    runner.run_to_quiescence(10_000);

    for node in 0..4 {
        let replica = runner.node(node).unwrap();
        assert_eq!(replica.view(), ViewId(1), "node {node} moved to view 1");
        assert_eq!(replica.status(), ReplicaStatus::Serving);
        assert_eq!(replica.low_mark(), 3);
        assert_eq!(replica.current_sequence(), 3, "empty P keeps the sequence");
    }

    // Nothing survived into the new view's log on the backups.
    for node in [0u32, 2, 3] {
        assert!(runner.node(node).unwrap().log().is_empty());
    }
}

#[traced_test]
#[test]
fn surviving_certificate_is_reissued_in_the_new_view() {
    let mut runner = make_runner(17);
    stabilize_at_3(&mut runner);

    // Replicas 2 and 3 prepared sequence 4 before the primary went quiet.
    let op4 = Digest::of(b"op4");
    seed_prepared(&mut runner, 2, 4, op4);
    seed_prepared(&mut runner, 3, 4, op4);

    for node in [1u32, 2, 3] {
        runner.schedule_event(node, Duration::from_millis(100), Event::RequestTimer);
    }
    runner.run_to_quiescence(10_000);

    for node in 0..4 {
        let replica = runner.node(node).unwrap();
        assert_eq!(replica.view(), ViewId(1), "node {node} moved to view 1");
        assert_eq!(replica.current_sequence(), 4);
    }

    // Backups re-seed sequence 4 from O with the original digest.
    for node in [0u32, 2, 3] {
        let replica = runner.node(node).unwrap();
        let entry = replica.log().entry(4).expect("re-seeded entry");
        assert_eq!(entry.stage, Stage::PrePrepared);
        let pp = entry.pre_prepare.as_ref().unwrap();
        assert_eq!(pp.digest, op4, "agreement carries across the view change");
        assert_eq!(pp.view, ViewId(1));
    }
}

#[traced_test]
#[test]
fn sequence_gap_is_filled_with_null_requests() {
    let mut runner = make_runner(23);
    stabilize_at_3(&mut runner);

    // Certificates survive for 4 and 6 but not 5.
    let op4 = Digest::of(b"op4");
    let op6 = Digest::of(b"op6");
    for node in [2u32, 3] {
        seed_prepared(&mut runner, node, 4, op4);
        seed_prepared(&mut runner, node, 6, op6);
    }

    for node in [1u32, 2, 3] {
        runner.schedule_event(node, Duration::from_millis(100), Event::RequestTimer);
    }
    runner.run_to_quiescence(10_000);

    for node in [0u32, 2, 3] {
        let replica = runner.node(node).unwrap();
        assert_eq!(replica.view(), ViewId(1));
        assert_eq!(replica.current_sequence(), 6);

        assert_eq!(
            replica.log().entry(4).unwrap().pre_prepare.as_ref().unwrap().digest,
            op4
        );
        assert_eq!(
            replica.log().entry(6).unwrap().pre_prepare.as_ref().unwrap().digest,
            op6
        );
        let filler = replica.log().entry(5).expect("gap filled");
        assert!(filler.pre_prepare.as_ref().unwrap().digest.is_null());
    }
}

#[traced_test]
#[test]
fn lagging_replica_catches_up_through_new_view() {
    let mut runner = make_runner(31);

    // Node 0 misses the checkpoint round entirely.
    runner.network_mut().isolate_node(0);
    let digest = Digest::of(b"state-after-3");
    for node in 1..4 {
        runner.schedule_event(node, Duration::ZERO, Event::RequestExecuted {
            reply: Reply {
                view: ViewId(0),
                seq: 3,
                client: ClientId::new("alice"),
                timestamp: 3,
                state_digest: digest,
            },
        });
    }
    runner.run_to_quiescence(10_000);
    assert_eq!(runner.node(0).unwrap().low_mark(), 0);

    // Connectivity returns; the suspected primary triggers a view change.
    runner.network_mut().heal_all();
    for node in [1u32, 2, 3] {
        runner.schedule_event(node, Duration::from_millis(100), Event::RequestTimer);
    }
    runner.run_to_quiescence(10_000);

    // The NEW-VIEW's witness C set pulls node 0 up to the checkpoint.
    let lagging = runner.node(0).unwrap();
    assert_eq!(lagging.view(), ViewId(1));
    assert_eq!(lagging.low_mark(), 3);
    assert_eq!(lagging.last_executed(), 3);
}

//! Checkpoint slots.
//!
//! One slot per checkpoint sequence, accumulating CHECKPOINT proofs until
//! `2f + 1` of them match on the same digest. A proof whose digest disagrees
//! with the eventual quorum is retained but never counted.

use pbft_types::{Checkpoint, Digest, ReplicaId, SeqNum, ViewId};
use std::collections::BTreeMap;

/// Accumulated checkpoint state for one sequence.
#[derive(Debug, Clone)]
pub struct CheckpointSlot {
    pub seq: SeqNum,
    /// Digest the quorum agreed on. Meaningful once `stable`.
    pub digest: Digest,
    /// View in which the slot was created.
    pub view: ViewId,
    pub stable: bool,
    /// Proofs keyed by signer; at most one message per replica.
    pub proofs: BTreeMap<ReplicaId, Checkpoint>,
}

impl CheckpointSlot {
    /// Create an empty, unstable slot.
    pub fn new(seq: SeqNum, view: ViewId) -> Self {
        Self {
            seq,
            digest: Digest::NULL,
            view,
            stable: false,
            proofs: BTreeMap::new(),
        }
    }

    /// Record a proof. Idempotent: a replica's first message wins, so the
    /// proof set never holds two distinct messages from the same signer.
    pub fn insert_proof(&mut self, proof: Checkpoint) {
        self.proofs.entry(proof.node).or_insert(proof);
    }

    /// The digest backed by at least `quorum` distinct signers, if any.
    pub fn quorum_digest(&self, quorum: usize) -> Option<Digest> {
        let mut by_digest: BTreeMap<Digest, usize> = BTreeMap::new();
        for proof in self.proofs.values() {
            *by_digest.entry(proof.digest).or_default() += 1;
        }
        by_digest
            .into_iter()
            .find(|(_, count)| *count >= quorum)
            .map(|(digest, _)| digest)
    }

    /// Number of proofs matching `digest`.
    pub fn matching(&self, digest: Digest) -> usize {
        self.proofs
            .values()
            .filter(|proof| proof.digest == digest)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proof(seq: SeqNum, node: u64, digest: Digest) -> Checkpoint {
        Checkpoint {
            seq,
            node: ReplicaId(node),
            view: ViewId(0),
            digest,
        }
    }

    #[test]
    fn quorum_forms_on_matching_digest() {
        let mut slot = CheckpointSlot::new(3, ViewId(0));
        let good = Digest::of(b"state");
        let bad = Digest::of(b"tampered");

        slot.insert_proof(proof(3, 0, good));
        slot.insert_proof(proof(3, 1, good));
        slot.insert_proof(proof(3, 3, bad));
        assert_eq!(slot.quorum_digest(3), None);

        slot.insert_proof(proof(3, 2, good));
        assert_eq!(slot.quorum_digest(3), Some(good));
        // The disagreeing proof is retained but never counted.
        assert_eq!(slot.matching(good), 3);
        assert_eq!(slot.proofs.len(), 4);
    }

    #[test]
    fn repeat_proofs_do_not_inflate_quorum() {
        let mut slot = CheckpointSlot::new(3, ViewId(0));
        let digest = Digest::of(b"state");
        for _ in 0..5 {
            slot.insert_proof(proof(3, 1, digest));
        }
        assert_eq!(slot.proofs.len(), 1);
        assert_eq!(slot.quorum_digest(3), None);
    }

    #[test]
    fn first_proof_from_a_signer_wins() {
        let mut slot = CheckpointSlot::new(3, ViewId(0));
        let first = Digest::of(b"first");
        slot.insert_proof(proof(3, 1, first));
        slot.insert_proof(proof(3, 1, Digest::of(b"second")));
        assert_eq!(slot.proofs[&ReplicaId(1)].digest, first);
    }
}

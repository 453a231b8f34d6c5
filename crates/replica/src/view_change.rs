//! View-change validation, collection, and the new-view decision procedure.
//!
//! The decision procedure ([`decide`]) is a pure function over a set of
//! VIEW-CHANGE messages so the prospective primary and every backup compute
//! it independently and must agree bit-for-bit.

use crate::{ProtocolError, ReplicaConfig};
use pbft_types::{NewView, PrePrepare, ReplicaId, SeqNum, ViewChange, ViewId};
use std::collections::{BTreeMap, BTreeSet};

/// Cache of view-change traffic at one replica.
///
/// Holds the VIEW-CHANGE messages collected for the prospective new view and
/// the NEW-VIEW messages emitted or accepted so far, so a primary emits at
/// most one NEW-VIEW per view.
#[derive(Debug, Default)]
pub struct ViewChangeCache {
    view_changes: BTreeMap<ReplicaId, ViewChange>,
    new_views: BTreeMap<ViewId, NewView>,
}

impl ViewChangeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a view-change message, keyed by sender. A later message from
    /// the same replica replaces the earlier one.
    pub fn push(&mut self, vc: ViewChange) {
        self.view_changes.insert(vc.node, vc);
    }

    /// Replace the collected set wholesale (backup processing a NEW-VIEW).
    pub fn replace(&mut self, set: BTreeMap<ReplicaId, ViewChange>) {
        self.view_changes = set;
    }

    /// The collected view-change set.
    pub fn view_changes(&self) -> &BTreeMap<ReplicaId, ViewChange> {
        &self.view_changes
    }

    /// Number of distinct senders collected.
    pub fn len(&self) -> usize {
        self.view_changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.view_changes.is_empty()
    }

    /// Whether a NEW-VIEW for `view` was already emitted or accepted.
    pub fn has_new_view(&self, view: ViewId) -> bool {
        self.new_views.contains_key(&view)
    }

    /// Record an emitted or accepted NEW-VIEW.
    pub fn record_new_view(&mut self, nv: NewView) {
        self.new_views.insert(nv.new_view, nv);
    }
}

/// Validate an inbound VIEW-CHANGE against the local view and the
/// protocol's certificate rules.
///
/// The C set needs a **weak** certificate: one view bucket with strictly
/// more than `f` distinct signers, all referencing the advertised stable
/// sequence. Each P entry needs a **prepared** certificate: `2f` distinct
/// signers in one view bucket, every prepare consistent with its
/// pre-prepare.
pub fn validate_view_change(
    vc: &ViewChange,
    current_view: ViewId,
    config: &ReplicaConfig,
) -> Result<(), ProtocolError> {
    if current_view > vc.new_view {
        return Err(ProtocolError::StaleView {
            got: vc.new_view,
            current: current_view,
        });
    }

    let faulty = config.max_faulty as usize;
    if vc.checkpoint_proofs.len() <= faulty {
        return Err(ProtocolError::InsufficientCheckpointProofs {
            have: vc.checkpoint_proofs.len(),
            faulty,
        });
    }

    // Weak certificate over the checkpoint proofs. Proofs claiming the
    // target view or later cannot vouch for a checkpoint that predates it.
    let mut buckets: BTreeMap<ViewId, BTreeSet<ReplicaId>> = BTreeMap::new();
    for (signer, proof) in &vc.checkpoint_proofs {
        if proof.view >= vc.new_view {
            continue;
        }
        if proof.seq != vc.last_stable_seq {
            return Err(ProtocolError::CheckpointSeqMismatch {
                proof_seq: proof.seq,
                stable_seq: vc.last_stable_seq,
            });
        }
        buckets.entry(proof.view).or_default().insert(*signer);
    }
    if !buckets.values().any(|signers| signers.len() > faulty) {
        return Err(ProtocolError::NoWeakCertificate);
    }

    // Prepared certificates for every advertised P entry.
    if !vc.prepared.is_empty() {
        let low = vc.last_stable_seq;
        let high = vc.last_stable_seq + config.watermark_window;
        let mut buckets: BTreeMap<ViewId, BTreeSet<ReplicaId>> = BTreeMap::new();
        for (seq, tuple) in &vc.prepared {
            if *seq <= low || *seq > high {
                return Err(ProtocolError::PreparedOutOfRange {
                    seq: *seq,
                    low,
                    high,
                });
            }
            let pp = &tuple.pre_prepare;
            if pp.view >= vc.new_view {
                return Err(ProtocolError::PreparedViewTooNew {
                    seq: *seq,
                    view: pp.view,
                    target: vc.new_view,
                });
            }
            for (node, prepare) in &tuple.prepares {
                if prepare.view != pp.view
                    || prepare.seq != *seq
                    || prepare.digest != pp.digest
                {
                    return Err(ProtocolError::InconsistentPrepare {
                        seq: *seq,
                        node: *node,
                    });
                }
                buckets.entry(pp.view).or_default().insert(*node);
            }
        }
        if !buckets
            .values()
            .any(|signers| signers.len() >= config.prepared_quorum())
        {
            return Err(ProtocolError::NoPreparedCertificate);
        }
    }

    Ok(())
}

/// Output of the new-view decision procedure.
#[derive(Debug, Clone)]
pub struct Decision {
    /// Largest advertised stable checkpoint (the paper's `maxNinV`); the
    /// starting point of the new view.
    pub start_seq: SeqNum,
    /// Largest prepared sequence observed (`maxNinO`); the new view's
    /// current sequence.
    pub next_seq: SeqNum,
    /// O: pre-prepares re-issued in the new view for surviving prepared
    /// certificates.
    pub reissued: BTreeMap<SeqNum, PrePrepare>,
    /// N: null-request pre-prepares filling the gaps.
    pub fillers: BTreeMap<SeqNum, PrePrepare>,
    /// The view-change whose C set witnesses the starting checkpoint.
    pub witness: Option<ViewChange>,
}

/// The decision procedure: pick the starting checkpoint and the O/N sets
/// for `new_view` from a collected view-change set.
///
/// Sequences are filled over `(start_seq, next_seq]`, upper bound inclusive.
/// The P-tuple merge is first-writer-wins in replica-id order, which is
/// deterministic, and collisions can only carry the same digest for honest
/// certificates anyway.
pub fn decide(view_changes: &BTreeMap<ReplicaId, ViewChange>, new_view: ViewId) -> Decision {
    let mut start_seq: SeqNum = 0;
    let mut next_seq: SeqNum = 0;
    let mut witness: Option<&ViewChange> = None;
    let mut merged: BTreeMap<SeqNum, &PrePrepare> = BTreeMap::new();

    for vc in view_changes.values() {
        if vc.last_stable_seq > start_seq {
            start_seq = vc.last_stable_seq;
            witness = Some(vc);
        }
        for (seq, tuple) in &vc.prepared {
            merged.entry(*seq).or_insert(&tuple.pre_prepare);
            if *seq > next_seq {
                next_seq = *seq;
            }
        }
    }

    let mut reissued = BTreeMap::new();
    let mut fillers = BTreeMap::new();
    for seq in (start_seq + 1)..=next_seq {
        match merged.get(&seq) {
            Some(pp) => {
                reissued.insert(seq, pp.restamped(new_view));
            }
            None => {
                fillers.insert(seq, PrePrepare::null(new_view, seq));
            }
        }
    }

    // A gapless history can leave next_seq behind the chosen checkpoint.
    let next_seq = next_seq.max(start_seq);

    Decision {
        start_seq,
        next_seq,
        reissued,
        fillers,
        witness: witness.cloned(),
    }
}

/// Compare two pre-prepare assignments by sequence and digest, ignoring the
/// view stamp (both sides resolve it to the same new view).
pub fn same_assignments(
    a: &BTreeMap<SeqNum, PrePrepare>,
    b: &BTreeMap<SeqNum, PrePrepare>,
) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().all(|(seq, pp)| {
        b.get(seq)
            .map(|other| other.digest == pp.digest)
            .unwrap_or(false)
    })
}

//! Protocol error type.

use crate::Stage;
use pbft_types::{Digest, ReplicaId, SeqNum, ViewId};

/// Errors raised while ingesting consensus messages.
///
/// Validation errors never poison replica state: the transition that raised
/// the error simply does not apply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Sequence outside the `(h, H]` window.
    #[error("sequence {seq} outside window ({low}, {high}]")]
    OutOfWindow {
        seq: SeqNum,
        low: SeqNum,
        high: SeqNum,
    },

    /// Message view is behind the replica's current view.
    #[error("stale view {got}, replica is at {current}")]
    StaleView { got: ViewId, current: ViewId },

    /// Message view does not match the replica's current view.
    #[error("view {got} does not match current view {current}")]
    WrongView { got: ViewId, current: ViewId },

    /// Prepare/commit digest disagrees with the stored pre-prepare.
    #[error("digest mismatch at seq {seq}: expected {expected}, got {got}")]
    WrongDigest {
        seq: SeqNum,
        expected: Digest,
        got: Digest,
    },

    /// No pre-prepare stored for the referenced sequence.
    #[error("no pre-prepare stored for seq {seq}")]
    MissingPrePrepare { seq: SeqNum },

    /// A different pre-prepare was already accepted for this sequence.
    #[error("conflicting pre-prepare for seq {seq} in {view}")]
    ConflictingPrePrepare { seq: SeqNum, view: ViewId },

    /// Attempted stage transition backwards.
    #[error("stage regression at seq {seq}: {from:?} -> {to:?}")]
    StageRegression { seq: SeqNum, from: Stage, to: Stage },

    /// VIEW-CHANGE carried fewer than `f + 1` checkpoint proofs.
    #[error("view change carries {have} checkpoint proofs, need more than {faulty}")]
    InsufficientCheckpointProofs { have: usize, faulty: usize },

    /// A checkpoint proof references a different sequence than the
    /// advertised stable checkpoint.
    #[error("checkpoint proof for seq {proof_seq} does not match advertised stable seq {stable_seq}")]
    CheckpointSeqMismatch {
        proof_seq: SeqNum,
        stable_seq: SeqNum,
    },

    /// No view bucket of checkpoint proofs reached the weak certificate.
    #[error("no weak certificate among checkpoint proofs")]
    NoWeakCertificate,

    /// A P-set entry lies outside `(h, h + K]`.
    #[error("prepared entry for seq {seq} outside ({low}, {high}]")]
    PreparedOutOfRange {
        seq: SeqNum,
        low: SeqNum,
        high: SeqNum,
    },

    /// A P-set pre-prepare claims a view at or above the target view.
    #[error("prepared entry at seq {seq} from {view}, not earlier than target {target}")]
    PreparedViewTooNew {
        seq: SeqNum,
        view: ViewId,
        target: ViewId,
    },

    /// A prepare inside a P-tuple disagrees with its pre-prepare.
    #[error("prepare from {node} inconsistent with pre-prepare at seq {seq}")]
    InconsistentPrepare { seq: SeqNum, node: ReplicaId },

    /// No view bucket of prepare signers reached `2f` distinct replicas.
    #[error("no prepared certificate in view change P set")]
    NoPreparedCertificate,

    /// Backup recomputation of the decision procedure disagrees with the
    /// primary's NEW-VIEW. The paper's remedy is to move straight to the
    /// next view.
    #[error("new-view {set} set diverges from local recomputation")]
    DivergentNewView { set: &'static str },

    /// The signing oracle rejected the message.
    #[error("signature rejected for message from {from}")]
    SignatureRejected { from: ReplicaId },
}

impl ProtocolError {
    /// Whether this is expected steady-state noise (dropped without a
    /// warning) rather than evidence of a malformed or Byzantine message.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            ProtocolError::OutOfWindow { .. } | ProtocolError::StaleView { .. }
        )
    }
}

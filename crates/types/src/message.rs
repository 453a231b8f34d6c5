//! Wire messages for the consensus protocol.
//!
//! All consensus traffic travels as a [`ConsensusMessage`] envelope carrying
//! one of the eight payload kinds. The engine dispatches on the payload with
//! an exhaustive match.

use crate::{ClientId, Digest, ReplicaId, SeqNum, ViewId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Client payload submitted for ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Originating client.
    pub client: ClientId,
    /// Client-local timestamp; requests are identified by `(client, timestamp)`.
    pub timestamp: u64,
    /// Opaque operation body.
    pub payload: Vec<u8>,
    /// Digest of the body.
    pub digest: Digest,
}

impl Request {
    /// Create a request, digesting the payload.
    pub fn new(client: ClientId, timestamp: u64, payload: Vec<u8>) -> Self {
        let digest = Digest::of(&payload);
        Self {
            client,
            timestamp,
            payload,
            digest,
        }
    }
}

/// Execution result reported back through the replica after a request runs.
///
/// `state_digest` is the digest of the application state after executing
/// through `seq` — the replica treats the application as a digestable opaque
/// state and uses this value when emitting checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub view: ViewId,
    pub seq: SeqNum,
    pub client: ClientId,
    pub timestamp: u64,
    pub state_digest: Digest,
}

/// Binding between sequence `seq` and request digest `digest` in `view`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrePrepare {
    pub view: ViewId,
    pub seq: SeqNum,
    pub digest: Digest,
}

impl PrePrepare {
    /// A null-request pre-prepare used to fill a sequence gap in a new view.
    pub fn null(view: ViewId, seq: SeqNum) -> Self {
        Self {
            view,
            seq,
            digest: Digest::NULL,
        }
    }

    /// Re-stamp this pre-prepare into a new view, keeping sequence and digest.
    pub fn restamped(&self, view: ViewId) -> Self {
        Self {
            view,
            seq: self.seq,
            digest: self.digest,
        }
    }
}

/// Backup `node`'s vote that the pre-prepare is well formed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepare {
    pub view: ViewId,
    pub seq: SeqNum,
    pub digest: Digest,
    pub node: ReplicaId,
}

/// Backup `node`'s commitment to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub view: ViewId,
    pub seq: SeqNum,
    pub digest: Digest,
    pub node: ReplicaId,
}

/// Replica `node`'s assertion that application state after executing through
/// `seq` has digest `digest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub seq: SeqNum,
    pub node: ReplicaId,
    pub view: ViewId,
    pub digest: Digest,
}

/// A prepared-certificate witness: a pre-prepare plus the matching prepares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PTuple {
    pub pre_prepare: PrePrepare,
    pub prepares: BTreeMap<ReplicaId, Prepare>,
}

impl PTuple {
    /// Build a witness from a pre-prepare and its prepare set.
    pub fn new(pre_prepare: PrePrepare, prepares: BTreeMap<ReplicaId, Prepare>) -> Self {
        Self {
            pre_prepare,
            prepares,
        }
    }
}

/// A replica's vote to move the system into `new_view`.
///
/// `checkpoint_proofs` (the paper's C set) proves the advertised stable
/// checkpoint; `prepared` (the P set) carries one [`PTuple`] per sequence
/// above that checkpoint that prepared locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChange {
    pub new_view: ViewId,
    pub last_stable_seq: SeqNum,
    pub node: ReplicaId,
    pub checkpoint_proofs: BTreeMap<ReplicaId, Checkpoint>,
    pub prepared: BTreeMap<SeqNum, PTuple>,
}

/// The new primary's decision, broadcast once `2f` view-changes are in hand.
///
/// `reissued` (O) re-stamps surviving prepared certificates into the new
/// view; `fillers` (N) closes the gaps with null requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewView {
    pub new_view: ViewId,
    pub view_changes: BTreeMap<ReplicaId, ViewChange>,
    pub reissued: BTreeMap<SeqNum, PrePrepare>,
    pub fillers: BTreeMap<SeqNum, PrePrepare>,
}

/// Tagged payload of a consensus message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessagePayload {
    Request(Request),
    PrePrepare(PrePrepare),
    Prepare(Prepare),
    Commit(Commit),
    Checkpoint(Checkpoint),
    ViewChange(Box<ViewChange>),
    NewView(Box<NewView>),
    Reply(Reply),
}

impl MessagePayload {
    /// Human-readable payload kind for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            MessagePayload::Request(_) => "Request",
            MessagePayload::PrePrepare(_) => "PrePrepare",
            MessagePayload::Prepare(_) => "Prepare",
            MessagePayload::Commit(_) => "Commit",
            MessagePayload::Checkpoint(_) => "Checkpoint",
            MessagePayload::ViewChange(_) => "ViewChange",
            MessagePayload::NewView(_) => "NewView",
            MessagePayload::Reply(_) => "Reply",
        }
    }

    /// Messages still accepted while the replica is changing views.
    pub fn accepted_while_view_changing(&self) -> bool {
        matches!(
            self,
            MessagePayload::Checkpoint(_)
                | MessagePayload::ViewChange(_)
                | MessagePayload::NewView(_)
        )
    }
}

/// Point-to-point envelope: sender, optional unicast target, payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusMessage {
    pub from: ReplicaId,
    /// `None` for broadcast traffic.
    pub to: Option<ReplicaId>,
    pub payload: MessagePayload,
}

impl ConsensusMessage {
    /// Build a broadcast envelope.
    pub fn broadcast(from: ReplicaId, payload: MessagePayload) -> Self {
        Self {
            from,
            to: None,
            payload,
        }
    }

    /// Build a unicast envelope.
    pub fn unicast(from: ReplicaId, to: ReplicaId, payload: MessagePayload) -> Self {
        Self {
            from,
            to: Some(to),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restamp_keeps_sequence_and_digest() {
        let pp = PrePrepare {
            view: ViewId(0),
            seq: 7,
            digest: Digest::of(b"op"),
        };
        let restamped = pp.restamped(ViewId(3));
        assert_eq!(restamped.view, ViewId(3));
        assert_eq!(restamped.seq, pp.seq);
        assert_eq!(restamped.digest, pp.digest);
    }

    #[test]
    fn view_changing_filter_admits_recovery_traffic() {
        let cp = MessagePayload::Checkpoint(Checkpoint {
            seq: 3,
            node: ReplicaId(0),
            view: ViewId(0),
            digest: Digest::NULL,
        });
        assert!(cp.accepted_while_view_changing());

        let prepare = MessagePayload::Prepare(Prepare {
            view: ViewId(0),
            seq: 4,
            digest: Digest::NULL,
            node: ReplicaId(1),
        });
        assert!(!prepare.accepted_while_view_changing());
    }
}

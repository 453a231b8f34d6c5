//! Action types for the deterministic state machine.

use crate::TimerId;
use pbft_types::{ConsensusMessage, ReplicaId};
use std::time::Duration;

/// Actions the state machine wants to perform.
///
/// Actions are **commands** — they describe something to do. The runner
/// executes actions after the state transition that produced them has
/// completed; broadcasts are therefore never awaited while the replica is
/// mid-mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Deliver `message` to all replicas, self included. Best effort, no
    /// ordering guarantees across destinations.
    Broadcast { message: ConsensusMessage },

    /// Unicast `message` to one replica. Best effort.
    SendTo {
        node: ReplicaId,
        message: ConsensusMessage,
    },

    /// Arm (or re-arm) a timer.
    SetTimer { id: TimerId, duration: Duration },

    /// Cancel a previously set timer.
    CancelTimer { id: TimerId },
}

impl Action {
    /// Action kind name for logging and stats.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::SendTo { .. } => "SendTo",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
        }
    }

    /// Whether this action reaches the network.
    pub fn is_network(&self) -> bool {
        matches!(self, Action::Broadcast { .. } | Action::SendTo { .. })
    }
}

//! Event types for the deterministic state machine.

use pbft_types::{ConsensusMessage, Reply, Request};

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same simulation time are processed in priority order.
/// Lower values = higher priority (processed first). This preserves
/// causality: consequences of prior processing are handled before new
/// external inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Internal events: consequences of prior event processing.
    Internal = 0,
    /// Timer events: scheduled by the node itself.
    Timer = 1,
    /// Network events: external inputs from other nodes.
    Network = 2,
    /// Client events: external inputs from users.
    Client = 3,
}

/// All possible events a replica can receive.
///
/// Events are **passive data** — they describe something that happened.
/// The state machine processes events and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    /// The per-request backup timer expired: the primary is suspected.
    RequestTimer,

    /// A consensus message arrived from the transport.
    ///
    /// Sender identity comes from the (oracle-verified) envelope.
    MessageReceived { message: ConsensusMessage },

    /// A client submitted a request for ordering.
    ClientRequest { request: Request },

    /// The normal-case collaborator finished executing a request.
    ///
    /// Execution is strictly in sequence order; the reply carries the digest
    /// of the application state after executing through `reply.seq`.
    RequestExecuted { reply: Reply },
}

impl Event {
    /// Ordering priority of this event.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::RequestTimer => EventPriority::Timer,
            Event::MessageReceived { .. } => EventPriority::Network,
            Event::ClientRequest { .. } => EventPriority::Client,
            Event::RequestExecuted { .. } => EventPriority::Internal,
        }
    }

    /// Event kind name for logging and stats.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::RequestTimer => "RequestTimer",
            Event::MessageReceived { .. } => "MessageReceived",
            Event::ClientRequest { .. } => "ClientRequest",
            Event::RequestExecuted { .. } => "RequestExecuted",
        }
    }
}

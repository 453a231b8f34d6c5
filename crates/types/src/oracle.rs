//! Signing/authentication seam.
//!
//! All consensus messages are logically signed. The core does not pick an
//! algorithm; it only requires a yes/no answer on ingest. Signatures are not
//! persisted.

use crate::ConsensusMessage;

/// Authentication oracle consulted before any inbound message touches
/// replica state.
pub trait SignatureOracle: Send + Sync {
    /// Whether `msg` carries a valid authenticator from `msg.from`.
    fn verify(&self, msg: &ConsensusMessage) -> bool;
}

/// Oracle that accepts everything. Used by tests and the simulation runner,
/// where authenticity is established by construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllOracle;

impl SignatureOracle for AcceptAllOracle {
    fn verify(&self, _msg: &ConsensusMessage) -> bool {
        true
    }
}

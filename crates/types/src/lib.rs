//! Core types for the PBFT replication engine.
//!
//! This crate provides the foundational types used throughout the replica
//! implementation:
//!
//! - **Primitives**: digests and protocol identifiers
//! - **Wire messages**: the eight consensus message kinds and their envelope
//! - **Oracles**: the signing/authentication seam
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer.

mod digest;
mod identifiers;
mod message;
mod oracle;

pub use digest::Digest;
pub use identifiers::{ClientId, ReplicaId, SeqNum, ViewId};
pub use message::{
    Checkpoint, Commit, ConsensusMessage, MessagePayload, NewView, PTuple, PrePrepare, Prepare,
    Reply, Request, ViewChange,
};
pub use oracle::{AcceptAllOracle, SignatureOracle};

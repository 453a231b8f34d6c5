//! PBFT replica state machine.
//!
//! This crate implements the core of a PBFT replica as a synchronous,
//! event-driven state machine: the sliding-window message log, the
//! checkpoint engine that garbage-collects it and advances the water marks,
//! the view-change engine that recovers from a faulty primary, and the
//! replica state engine that owns all of it and routes inbound messages.
//!
//! # Architecture
//!
//! - `Event::MessageReceived` → exhaustive dispatch over the eight message
//!   kinds; checkpoint and view-change traffic is still accepted while the
//!   replica is changing views
//! - `Event::ClientRequest` → record the pending request, arm the backup
//!   timer
//! - `Event::RequestExecuted` → advance the executed sequence, emit a
//!   checkpoint when the interval is crossed
//! - `Event::RequestTimer` → suspect the primary, start a view change
//!
//! All I/O is performed by the runner via returned `Action`s.
//!
//! # Safety & Liveness
//!
//! - **Water marks**: only sequences in `(h, H]` are admitted; a checkpoint
//!   with `2f+1` matching proofs becomes stable, pins `h`, and purges
//!   everything it subsumes.
//! - **View changes**: `2f` validated VIEW-CHANGE messages let the new
//!   primary pick a starting checkpoint and re-issue surviving prepared
//!   certificates, so agreement carries across view boundaries.

mod checkpoint;
mod client;
mod config;
mod error;
mod log;
mod state;
mod view_change;

pub use checkpoint::CheckpointSlot;
pub use client::ClientRecord;
pub use config::ReplicaConfig;
pub use error::ProtocolError;
pub use log::{LogEntry, MessageLog, Stage};
pub use state::{ReplicaState, ReplicaStatus};
pub use view_change::{decide, same_assignments, validate_view_change, Decision, ViewChangeCache};

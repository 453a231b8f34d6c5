//! Sliding-window message log for normal-case state.
//!
//! One [`LogEntry`] per sequence in `(h, H]`, holding the accepted
//! pre-prepare and the prepare/commit vote sets. Stage transitions are
//! strictly monotone per sequence; votes from the same replica coalesce
//! silently.

use crate::{ProtocolError, ReplicaConfig};
use pbft_types::{ClientId, Commit, PrePrepare, Prepare, ReplicaId, SeqNum};
use std::collections::BTreeMap;

/// Per-sequence protocol stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Idle,
    PrePrepared,
    Prepared,
    Committed,
    Executed,
}

/// Normal-case state for one sequence number.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub pre_prepare: Option<PrePrepare>,
    pub prepares: BTreeMap<ReplicaId, Prepare>,
    pub commits: BTreeMap<ReplicaId, Commit>,
    pub stage: Stage,
    pub client: Option<ClientId>,
}

impl LogEntry {
    fn new() -> Self {
        Self {
            pre_prepare: None,
            prepares: BTreeMap::new(),
            commits: BTreeMap::new(),
            stage: Stage::Idle,
            client: None,
        }
    }
}

/// The message log. Window enforcement is the owner's job; the log itself
/// only tracks entries and stages.
#[derive(Debug, Default)]
pub struct MessageLog {
    entries: BTreeMap<SeqNum, LogEntry>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry.
    pub fn entry(&self, seq: SeqNum) -> Option<&LogEntry> {
        self.entries.get(&seq)
    }

    /// Iterate entries in sequence order.
    pub fn iter(&self) -> impl Iterator<Item = (&SeqNum, &LogEntry)> {
        self.entries.iter()
    }

    /// Accept a pre-prepare, creating the entry and moving it to
    /// `PrePrepared`. A pre-prepare is immutable once accepted: a second one
    /// with a different digest for the same sequence is rejected.
    pub fn insert_pre_prepare(&mut self, pp: PrePrepare) -> Result<(), ProtocolError> {
        let seq = pp.seq;
        let entry = self.entries.entry(seq).or_insert_with(LogEntry::new);
        match &entry.pre_prepare {
            Some(existing) if existing.digest != pp.digest || existing.view != pp.view => {
                return Err(ProtocolError::ConflictingPrePrepare { seq, view: pp.view });
            }
            Some(_) => return Ok(()), // duplicate
            None => {}
        }
        if entry.stage > Stage::Idle {
            return Err(ProtocolError::StageRegression {
                seq,
                from: entry.stage,
                to: Stage::PrePrepared,
            });
        }
        entry.pre_prepare = Some(pp);
        entry.stage = Stage::PrePrepared;
        Ok(())
    }

    /// Accept a prepare vote. Requires a stored pre-prepare matching
    /// `(view, seq, digest)`; duplicate votes from the same replica are
    /// coalesced.
    pub fn insert_prepare(&mut self, prepare: Prepare) -> Result<(), ProtocolError> {
        let seq = prepare.seq;
        let entry = self
            .entries
            .get_mut(&seq)
            .ok_or(ProtocolError::MissingPrePrepare { seq })?;
        let pp = entry
            .pre_prepare
            .as_ref()
            .ok_or(ProtocolError::MissingPrePrepare { seq })?;
        if pp.view != prepare.view {
            return Err(ProtocolError::WrongView {
                got: prepare.view,
                current: pp.view,
            });
        }
        if pp.digest != prepare.digest {
            return Err(ProtocolError::WrongDigest {
                seq,
                expected: pp.digest,
                got: prepare.digest,
            });
        }
        entry.prepares.entry(prepare.node).or_insert(prepare);
        Ok(())
    }

    /// Accept a commit vote, with the same matching rules as prepares.
    pub fn insert_commit(&mut self, commit: Commit) -> Result<(), ProtocolError> {
        let seq = commit.seq;
        let entry = self
            .entries
            .get_mut(&seq)
            .ok_or(ProtocolError::MissingPrePrepare { seq })?;
        let pp = entry
            .pre_prepare
            .as_ref()
            .ok_or(ProtocolError::MissingPrePrepare { seq })?;
        if pp.view != commit.view {
            return Err(ProtocolError::WrongView {
                got: commit.view,
                current: pp.view,
            });
        }
        if pp.digest != commit.digest {
            return Err(ProtocolError::WrongDigest {
                seq,
                expected: pp.digest,
                got: commit.digest,
            });
        }
        entry.commits.entry(commit.node).or_insert(commit);
        Ok(())
    }

    /// Prepared predicate: a pre-prepare plus `2f` matching prepares from
    /// distinct non-primary replicas.
    pub fn is_prepared(&self, seq: SeqNum, config: &ReplicaConfig) -> bool {
        let Some(entry) = self.entries.get(&seq) else {
            return false;
        };
        let Some(pp) = &entry.pre_prepare else {
            return false;
        };
        let primary = config.primary_of(pp.view);
        let backups = entry.prepares.keys().filter(|node| **node != primary).count();
        backups >= config.prepared_quorum()
    }

    /// Committed predicate: prepared plus `2f + 1` matching commits from
    /// distinct replicas (self included).
    pub fn is_committed(&self, seq: SeqNum, config: &ReplicaConfig) -> bool {
        let Some(entry) = self.entries.get(&seq) else {
            return false;
        };
        self.is_prepared(seq, config) && entry.commits.len() >= config.strong_quorum()
    }

    /// Monotone stage advance. Regressions are rejected; re-asserting the
    /// current stage is a no-op.
    pub fn advance_stage(&mut self, seq: SeqNum, to: Stage) -> Result<(), ProtocolError> {
        let entry = self
            .entries
            .get_mut(&seq)
            .ok_or(ProtocolError::MissingPrePrepare { seq })?;
        if to < entry.stage {
            return Err(ProtocolError::StageRegression {
                seq,
                from: entry.stage,
                to,
            });
        }
        entry.stage = to;
        Ok(())
    }

    /// Record which client a sequence serves.
    pub fn set_client(&mut self, seq: SeqNum, client: ClientId) {
        if let Some(entry) = self.entries.get_mut(&seq) {
            entry.client = Some(client);
        }
    }

    /// Drop every entry with sequence `<= seq`. Their prepared/committed
    /// history is subsumed by a stable checkpoint.
    pub fn purge_through(&mut self, seq: SeqNum) {
        self.entries.retain(|entry_seq, _| *entry_seq > seq);
    }

    /// Drop everything. A view change replaces the log; it never mutates
    /// previous contents.
    pub fn flush(&mut self) {
        self.entries.clear();
    }
}

//! Replica configuration.

use pbft_types::{ReplicaId, SeqNum, ViewId};
use std::time::Duration;

/// Configuration for a PBFT replica.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Total number of replicas (N). Must satisfy `N >= 3f + 1`.
    pub total_replicas: u64,

    /// Maximum number of Byzantine replicas tolerated (f).
    pub max_faulty: u64,

    /// Sequence distance between checkpoints (CP_INTERVAL).
    pub checkpoint_interval: SeqNum,

    /// High-water-mark window (K). `H = h + K`.
    pub watermark_window: SeqNum,

    /// Extra bootstrap checkpoint sequence. The first stable checkpoint
    /// would otherwise not form until `checkpoint_interval` requests have
    /// executed, leaving view changes without a provable C set.
    pub warmup_checkpoint: Option<SeqNum>,

    /// How long a backup waits on an unexecuted request before suspecting
    /// the primary.
    pub request_timeout: Duration,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            total_replicas: 4,
            max_faulty: 1,
            checkpoint_interval: 100,
            watermark_window: 200,
            warmup_checkpoint: Some(3),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl ReplicaConfig {
    /// Whether `N >= 3f + 1` holds.
    pub fn is_valid(&self) -> bool {
        self.total_replicas >= 3 * self.max_faulty + 1
    }

    /// Strong quorum: `2f + 1` matching messages from distinct replicas.
    pub fn strong_quorum(&self) -> usize {
        (2 * self.max_faulty + 1) as usize
    }

    /// Weak certificate: `f + 1` matching messages from distinct replicas,
    /// guaranteeing at least one honest witness.
    pub fn weak_quorum(&self) -> usize {
        (self.max_faulty + 1) as usize
    }

    /// Prepared certificate size: `2f` matching prepares on top of the
    /// pre-prepare.
    pub fn prepared_quorum(&self) -> usize {
        (2 * self.max_faulty) as usize
    }

    /// VIEW-CHANGE messages the prospective primary collects before it may
    /// emit a NEW-VIEW.
    pub fn new_view_quorum(&self) -> usize {
        (2 * self.max_faulty) as usize
    }

    /// The primary replica for `view`.
    pub fn primary_of(&self, view: ViewId) -> ReplicaId {
        view.primary_of(self.total_replicas)
    }

    /// Whether `seq` is a checkpoint trigger.
    pub fn is_checkpoint_seq(&self, seq: SeqNum) -> bool {
        (seq > 0 && seq % self.checkpoint_interval == 0) || self.warmup_checkpoint == Some(seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ReplicaConfig::default().is_valid());
    }

    #[test]
    fn quorum_sizes() {
        let config = ReplicaConfig::default();
        assert_eq!(config.strong_quorum(), 3);
        assert_eq!(config.weak_quorum(), 2);
        assert_eq!(config.prepared_quorum(), 2);
    }

    #[test]
    fn warmup_is_a_checkpoint_trigger() {
        let config = ReplicaConfig {
            checkpoint_interval: 100,
            warmup_checkpoint: Some(3),
            ..Default::default()
        };
        assert!(config.is_checkpoint_seq(3));
        assert!(config.is_checkpoint_seq(100));
        assert!(config.is_checkpoint_seq(200));
        assert!(!config.is_checkpoint_seq(4));
        assert!(!config.is_checkpoint_seq(0));
    }
}

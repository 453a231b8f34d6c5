//! Per-client bookkeeping.

use pbft_types::{Reply, Request};
use std::collections::BTreeMap;

/// Last reply and pending requests for one client.
///
/// Pending requests are keyed by the client timestamp, the identity PBFT
/// uses to deduplicate requests. A pending request whose timestamp predates
/// the last reply has already been served and can be dropped.
#[derive(Debug, Clone, Default)]
pub struct ClientRecord {
    pub last_reply: Option<Reply>,
    pub last_reply_time: u64,
    pub pending: BTreeMap<u64, Request>,
}

impl ClientRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a request awaiting execution.
    pub fn record_request(&mut self, request: Request) {
        self.pending.entry(request.timestamp).or_insert(request);
    }

    /// Record the reply for an executed request and drop the matching
    /// pending entry.
    pub fn save_reply(&mut self, reply: Reply) {
        self.pending.remove(&reply.timestamp);
        self.last_reply_time = self.last_reply_time.max(reply.timestamp);
        self.last_reply = Some(reply);
    }

    /// Drop pending requests that predate the last reply.
    pub fn prune_stale(&mut self) -> usize {
        let before = self.pending.len();
        let cutoff = self.last_reply_time;
        self.pending.retain(|timestamp, _| *timestamp >= cutoff);
        before - self.pending.len()
    }

    /// Whether this client still has a request awaiting execution.
    pub fn has_outstanding(&self) -> bool {
        !self.pending.is_empty()
    }
}

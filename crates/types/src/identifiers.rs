//! Protocol identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sequence number assigned by the primary. Monotonically increasing.
pub type SeqNum = u64;

/// Replica identifier in `[0, N)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ReplicaId(pub u64);

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// View identifier. The primary of view `v` is `v mod N`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ViewId(pub u64);

impl ViewId {
    /// The primary replica for this view in a group of `total` replicas.
    pub fn primary_of(&self, total: u64) -> ReplicaId {
        ReplicaId(self.0 % total)
    }

    /// The successor view.
    pub fn next(&self) -> ViewId {
        ViewId(self.0 + 1)
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Client identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

impl ClientId {
    /// Build a client id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        ClientId(id.into())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_rotates_with_view() {
        assert_eq!(ViewId(0).primary_of(4), ReplicaId(0));
        assert_eq!(ViewId(1).primary_of(4), ReplicaId(1));
        assert_eq!(ViewId(5).primary_of(4), ReplicaId(1));
    }
}

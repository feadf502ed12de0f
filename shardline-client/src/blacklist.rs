//! Process-wide node blacklist with per-entry expiry

use crate::model::NodeId;
use moka::sync::Cache;
use std::time::Duration;
use tracing::info;

/// Why a node was blacklisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlacklistReason {
    /// Node answered a put with `NO_SPACE`
    NoSpace,
    /// Authority rejected a commit naming the node
    Authority,
}

/// Nodes excluded from selection until their TTL lapses
#[derive(Clone)]
pub struct NodeBlacklist {
    entries: Cache<NodeId, BlacklistReason>,
}

impl NodeBlacklist {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Cache::builder().max_capacity(65_536).time_to_live(ttl).build(),
        }
    }

    pub fn insert(&self, node: &NodeId, reason: BlacklistReason) {
        info!(node = %node, ?reason, "Blacklisting storage node");
        self.entries.insert(node.clone(), reason);
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.entries.contains_key(node)
    }

    pub fn reason(&self, node: &NodeId) -> Option<BlacklistReason> {
        self.entries.get(node)
    }

    pub fn remove(&self, node: &NodeId) {
        self.entries.invalidate(node);
    }
}

impl std::fmt::Debug for NodeBlacklist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeBlacklist")
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_remove() {
        let blacklist = NodeBlacklist::new(Duration::from_secs(60));
        let node = NodeId::from("n1");

        assert!(!blacklist.contains(&node));
        blacklist.insert(&node, BlacklistReason::NoSpace);
        assert!(blacklist.contains(&node));
        assert_eq!(blacklist.reason(&node), Some(BlacklistReason::NoSpace));

        blacklist.remove(&node);
        assert!(!blacklist.contains(&node));
    }

    #[test]
    fn test_entries_expire() {
        let blacklist = NodeBlacklist::new(Duration::from_millis(50));
        let node = NodeId::from("n1");
        blacklist.insert(&node, BlacklistReason::Authority);
        assert!(blacklist.contains(&node));

        std::thread::sleep(Duration::from_millis(120));
        assert!(!blacklist.contains(&node));
    }

    #[test]
    fn test_clones_share_entries() {
        let blacklist = NodeBlacklist::new(Duration::from_secs(60));
        let other = blacklist.clone();
        other.insert(&NodeId::from("n2"), BlacklistReason::NoSpace);
        assert!(blacklist.contains(&NodeId::from("n2")));
    }
}

use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfChangeKind {
    AddNode,
    AddLearner,
    RemoveNode,
}

/// Single-step membership change carried by a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfChange {
    pub kind: ConfChangeKind,
    pub node_id: NodeId,
    #[serde(default)]
    pub url: String,
}

impl ConfChange {
    pub fn add_node(node_id: NodeId, url: impl Into<String>) -> Self {
        Self {
            kind: ConfChangeKind::AddNode,
            node_id,
            url: url.into(),
        }
    }

    pub fn add_learner(node_id: NodeId, url: impl Into<String>) -> Self {
        Self {
            kind: ConfChangeKind::AddLearner,
            node_id,
            url: url.into(),
        }
    }

    pub fn remove_node(node_id: NodeId) -> Self {
        Self {
            kind: ConfChangeKind::RemoveNode,
            node_id,
            url: String::new(),
        }
    }
}

/// Voters and learners of the raft group, with their peer URLs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub voters: BTreeMap<NodeId, String>,
    pub learners: BTreeMap<NodeId, String>,
}

impl Membership {
    pub fn is_voter(&self, id: NodeId) -> bool {
        self.voters.contains_key(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.voters.contains_key(&id) || self.learners.contains_key(&id)
    }

    pub fn voter_ids(&self) -> BTreeSet<NodeId> {
        self.voters.keys().copied().collect()
    }

    /// Every member other than `id`, voters first.
    pub fn peers_of(&self, id: NodeId) -> Vec<NodeId> {
        self.voters
            .keys()
            .chain(self.learners.keys())
            .copied()
            .filter(|peer| *peer != id)
            .collect()
    }

    pub fn url(&self, id: NodeId) -> Option<&str> {
        self.voters
            .get(&id)
            .or_else(|| self.learners.get(&id))
            .map(String::as_str)
    }

    /// Applies `change`; returns false when it changes nothing. Adding an
    /// existing learner as a node promotes it.
    pub fn apply(&mut self, change: &ConfChange) -> bool {
        match change.kind {
            ConfChangeKind::AddNode => {
                if self.voters.contains_key(&change.node_id) {
                    return false;
                }
                let url = self
                    .learners
                    .remove(&change.node_id)
                    .filter(|_| change.url.is_empty())
                    .unwrap_or_else(|| change.url.clone());
                self.voters.insert(change.node_id, url);
                true
            }
            ConfChangeKind::AddLearner => {
                if self.contains(change.node_id) {
                    return false;
                }
                self.learners.insert(change.node_id, change.url.clone());
                true
            }
            ConfChangeKind::RemoveNode => {
                self.voters.remove(&change.node_id).is_some()
                    | self.learners.remove(&change.node_id).is_some()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn learner_promotion_keeps_url() {
        let mut membership = Membership::default();
        assert!(membership.apply(&ConfChange::add_node(NodeId::new(1), "mr-1")));
        assert!(membership.apply(&ConfChange::add_learner(NodeId::new(2), "mr-2")));
        assert!(!membership.is_voter(NodeId::new(2)));
        assert!(!membership.apply(&ConfChange::add_learner(NodeId::new(2), "mr-2")));

        assert!(membership.apply(&ConfChange::add_node(NodeId::new(2), "")));
        assert!(membership.is_voter(NodeId::new(2)));
        assert_eq!(membership.url(NodeId::new(2)), Some("mr-2"));
        assert!(membership.learners.is_empty());
    }

    #[test]
    fn remove_reports_whether_anything_changed() {
        let mut membership = Membership::default();
        membership.apply(&ConfChange::add_node(NodeId::new(1), "mr-1"));
        membership.apply(&ConfChange::add_node(NodeId::new(3), "mr-3"));
        assert_eq!(membership.peers_of(NodeId::new(1)), vec![NodeId::new(3)]);
        assert!(membership.apply(&ConfChange::remove_node(NodeId::new(3))));
        assert!(!membership.apply(&ConfChange::remove_node(NodeId::new(3))));
        assert!(membership.peers_of(NodeId::new(1)).is_empty());
    }
}

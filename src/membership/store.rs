//! Membership state: the voting ring, the client registry and the per-node
//! protocol bookkeeping that lives next to them under one lock.

use super::election::Election;
use super::types::NodeId;

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Insertion-ordered ring of voting members. Position 0 is the leader.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberList {
    members: Vec<NodeId>,
}

impl MemberList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<NodeId> {
        self.members.clone()
    }

    pub fn as_slice(&self) -> &[NodeId] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn first(&self) -> Option<&NodeId> {
        self.members.first()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.members.contains(node)
    }

    pub fn is_first(&self, node: &NodeId) -> bool {
        self.first() == Some(node)
    }

    fn neighbour(&self, node: &NodeId, offset: usize) -> Option<&NodeId> {
        let n = self.members.len();
        if n <= 1 {
            return None;
        }
        let index = self.members.iter().position(|m| m == node)?;
        self.members.get((index + offset) % n)
    }

    pub fn successor(&self, node: &NodeId) -> Option<&NodeId> {
        self.neighbour(node, 1)
    }

    pub fn predecessor(&self, node: &NodeId) -> Option<&NodeId> {
        self.neighbour(node, self.members.len().saturating_sub(1))
    }

    /// Adds `node`, replacing in place any other identity on the same endpoint.
    pub fn insert(&mut self, node: NodeId) -> bool {
        match self.members.iter().position(|m| m.same_endpoint(&node)) {
            Some(index) if self.members[index] == node => false,
            Some(index) => {
                self.members[index] = node;
                true
            }
            None => {
                self.members.push(node);
                true
            }
        }
    }

    /// Appends every member of `others` whose endpoint is not already present.
    pub fn union(&mut self, others: &[NodeId]) -> bool {
        let mut changed = false;
        for node in others {
            if !self.members.iter().any(|m| m.same_endpoint(node)) {
                self.members.push(node.clone());
                changed = true;
            }
        }
        changed
    }

    pub fn remove(&mut self, node: &NodeId) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m != node);
        self.members.len() != before
    }

    pub fn replace(&mut self, members: Vec<NodeId>) -> bool {
        if self.members == members {
            return false;
        }
        self.members = members;
        true
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }
}

/// Clients known to the leader, with the instant each was last heard from.
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<NodeId, Instant>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or refreshes `client`. Other identities on the same endpoint
    /// are evicted and returned: that is a client that reconnected.
    pub fn register(&self, client: &NodeId, now: Instant) -> Vec<NodeId> {
        let stale: Vec<NodeId> = self
            .clients
            .iter()
            .filter(|entry| entry.key().same_endpoint(client) && entry.key() != client)
            .map(|entry| entry.key().clone())
            .collect();

        for old in &stale {
            self.clients.remove(old);
        }
        self.clients.insert(client.clone(), now);
        stale
    }

    pub fn contains(&self, client: &NodeId) -> bool {
        self.clients.contains_key(client)
    }

    pub fn remove(&self, client: &NodeId) -> bool {
        self.clients.remove(client).is_some()
    }

    /// Drops clients silent for longer than `window`.
    pub fn prune(&self, window: Duration, now: Instant) -> Vec<NodeId> {
        let expired: Vec<NodeId> = self
            .clients
            .iter()
            .filter(|entry| now.saturating_duration_since(*entry.value()) > window)
            .map(|entry| entry.key().clone())
            .collect();

        for client in &expired {
            self.clients.remove(client);
        }
        expired
    }

    pub fn snapshot(&self) -> Vec<NodeId> {
        let mut clients: Vec<NodeId> = self.clients.iter().map(|e| e.key().clone()).collect();
        clients.sort();
        clients
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn clear(&self) {
        self.clients.clear();
    }
}

/// Everything the protocol engine and heartbeat daemon mutate together.
#[derive(Debug, Default)]
pub struct ClusterState {
    pub members: MemberList,
    pub election: Election,
    pub joined: bool,
    /// `join()` is blocked waiting for a membership snapshot.
    pub joining: bool,
    /// An ADD_REQ was re-issued outside `join()`; the next snapshot is taken as-is.
    pub rejoining: bool,
    /// Current ring predecessor and when it was last heard from.
    pub predecessor: Option<(NodeId, Instant)>,
    /// Heartbeat target whose HELLO_RES is awaited.
    pub awaiting_hello: Option<NodeId>,
    pub hello_answered: bool,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the heartbeat wait; returns the previous answer flag.
    pub fn finish_hello(&mut self) -> bool {
        self.awaiting_hello = None;
        std::mem::take(&mut self.hello_answered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(port: u16) -> NodeId {
        NodeId::new(
            format!("127.0.0.1:{}", port).parse().unwrap(),
            false,
            vec![1],
        )
    }

    #[test]
    fn test_ring_neighbours_wrap_around() {
        let mut list = MemberList::new();
        for port in [1, 2, 3] {
            list.insert(node(port));
        }

        assert_eq!(list.successor(&node(1)), Some(&node(2)));
        assert_eq!(list.successor(&node(3)), Some(&node(1)));
        assert_eq!(list.predecessor(&node(1)), Some(&node(3)));
        assert_eq!(list.predecessor(&node(2)), Some(&node(1)));
    }

    #[test]
    fn test_ring_neighbours_undefined_for_single_member() {
        let mut list = MemberList::new();
        list.insert(node(1));

        assert_eq!(list.successor(&node(1)), None);
        assert_eq!(list.predecessor(&node(1)), None);
        assert_eq!(list.successor(&node(9)), None);
    }

    #[test]
    fn test_insert_dedups_by_endpoint() {
        let mut list = MemberList::new();
        assert!(list.insert(node(1)));
        assert!(list.insert(node(2)));
        assert!(!list.insert(node(1)));

        let restarted = NodeId::new(node(1).addr, false, vec![2]);
        assert!(list.insert(restarted.clone()));
        assert_eq!(list.as_slice(), &[restarted, node(2)]);
    }

    #[test]
    fn test_union_appends_only_novel_members() {
        let mut list = MemberList::new();
        list.insert(node(1));
        list.insert(node(2));

        assert!(list.union(&[node(3), node(1), node(4)]));
        assert_eq!(list.snapshot(), vec![node(1), node(2), node(3), node(4)]);
        assert!(!list.union(&[node(2)]));
    }

    #[test]
    fn test_replace_reports_change() {
        let mut list = MemberList::new();
        assert!(list.replace(vec![node(1), node(2)]));
        assert!(!list.replace(vec![node(1), node(2)]));
        assert!(list.replace(vec![node(2), node(1)]));
    }

    #[test]
    fn test_client_reconnect_evicts_old_identity() {
        let registry = ClientRegistry::new();
        let now = Instant::now();
        let first = NodeId::new("127.0.0.1:9000".parse().unwrap(), true, vec![1]);
        let second = NodeId::new("127.0.0.1:9000".parse().unwrap(), true, vec![2]);
        let other = NodeId::new("127.0.0.1:9001".parse().unwrap(), true, vec![1]);

        assert!(registry.register(&first, now).is_empty());
        assert!(registry.register(&other, now).is_empty());
        assert_eq!(registry.register(&second, now), vec![first.clone()]);

        assert!(!registry.contains(&first));
        assert!(registry.contains(&second));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_client_prune_by_silence() {
        let registry = ClientRegistry::new();
        let start = Instant::now();
        let quiet = NodeId::new("127.0.0.1:9000".parse().unwrap(), true, vec![]);
        let chatty = NodeId::new("127.0.0.1:9001".parse().unwrap(), true, vec![]);

        registry.register(&quiet, start);
        registry.register(&chatty, start + Duration::from_secs(4));

        let pruned = registry.prune(Duration::from_secs(3), start + Duration::from_secs(5));
        assert_eq!(pruned, vec![quiet]);
        assert_eq!(registry.snapshot(), vec![chatty]);
    }
}

//! The node table.
//!
//! Every node of the cluster has an entry here, including this one
//! (`this_sid`). Connection state lives in the RPC layer keyed by SID; the
//! node record carries identity, the reconnect throttle and the per-node
//! identity mappings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::user_group::IdMapping;

/// SID reserved for "no node"; also the SID of virtual directories.
pub const NODE_ID_NONE: u32 = 0;

/// Default port a node listens on when the configuration names none.
pub const DEFAULT_PORT: u16 = 12323;

/// One node of the cluster.
pub struct Node {
    pub id: u32,
    pub data: Mutex<NodeData>,
}

/// Mutable state of a node, behind its mutex.
pub struct NodeData {
    pub name: String,
    /// DNS name or address.
    pub host: String,
    pub port: u16,
    /// Last connect attempt, for the reconnect back-off window.
    pub last_connect: Option<Instant>,
    /// Mark-and-sweep bit of the configuration reader.
    pub marked: bool,
    /// Mapping between cluster uids and this node's uids.
    pub uid_map: IdMapping,
    /// Mapping between cluster gids and this node's gids.
    pub gid_map: IdMapping,
}

impl Node {
    fn new(id: u32, name: &str, host: &str, port: u16) -> Arc<Node> {
        Arc::new(Node {
            id,
            data: Mutex::new(NodeData {
                name: name.to_owned(),
                host: host.to_owned(),
                port,
                last_connect: None,
                marked: false,
                uid_map: IdMapping::new(),
                gid_map: IdMapping::new(),
            }),
        })
    }

    /// `host:port` the node listens on.
    pub fn address(&self) -> String {
        let data = self.data.lock();
        format!("{}:{}", data.host, data.port)
    }

    /// Record a connect attempt; returns false while the back-off window
    /// since the previous attempt has not elapsed.
    pub fn may_connect(&self, backoff: std::time::Duration) -> bool {
        let mut data = self.data.lock();
        let now = Instant::now();
        match data.last_connect {
            Some(last) if now.duration_since(last) < backoff => false,
            _ => {
                data.last_connect = Some(now);
                true
            }
        }
    }
}

/// All nodes of the cluster.
pub struct NodeTable {
    nodes: HashMap<u32, Arc<Node>>,
    /// SID of this daemon.
    pub this_sid: u32,
}

impl NodeTable {
    pub fn new(this_sid: u32) -> NodeTable {
        NodeTable { nodes: HashMap::new(), this_sid }
    }

    pub fn lookup(&self, id: u32) -> Option<Arc<Node>> {
        self.nodes.get(&id).cloned()
    }

    pub fn lookup_name(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.values().find(|n| n.data.lock().name == name).cloned()
    }

    pub fn this_node(&self) -> Option<Arc<Node>> {
        self.lookup(self.this_sid)
    }

    /// Create the node or re-assert an existing one, clearing its mark.
    /// An ID or name clash with a different existing node is rejected.
    pub fn try_create(&mut self, id: u32, name: &str, host: &str, port: u16) -> Option<Arc<Node>> {
        if let Some(existing) = self.nodes.get(&id) {
            let mut data = existing.data.lock();
            if data.name != name {
                return None;
            }
            data.host = host.to_owned();
            data.port = port;
            data.marked = false;
            return Some(existing.clone());
        }
        if self.lookup_name(name).is_some() {
            return None;
        }
        let node = Node::new(id, name, host, port);
        self.nodes.insert(id, node.clone());
        Some(node)
    }

    pub fn mark_all(&self) {
        for node in self.nodes.values() {
            node.data.lock().marked = true;
        }
    }

    /// Remove nodes still marked after a configuration reload.
    pub fn take_marked(&mut self) -> Vec<Arc<Node>> {
        let marked: Vec<u32> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.data.lock().marked)
            .map(|(&id, _)| id)
            .collect();
        marked.into_iter().filter_map(|id| self.nodes.remove(&id)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn create_and_reassert() {
        let mut table = NodeTable::new(1);
        let node = table.try_create(1, "orion", "10.0.0.1", DEFAULT_PORT).unwrap();
        node.data.lock().marked = true;

        // re-assertion updates the address and clears the mark
        let again = table.try_create(1, "orion", "10.0.0.2", DEFAULT_PORT).unwrap();
        assert!(Arc::ptr_eq(&node, &again));
        assert!(!node.data.lock().marked);
        assert_eq!(node.address(), "10.0.0.2:12323");

        // clashes are rejected
        assert!(table.try_create(1, "vega", "10.0.0.3", DEFAULT_PORT).is_none());
        assert!(table.try_create(2, "orion", "10.0.0.3", DEFAULT_PORT).is_none());
    }

    #[test]
    fn sweep_removes_stale_nodes() {
        let mut table = NodeTable::new(1);
        table.try_create(1, "orion", "10.0.0.1", DEFAULT_PORT).unwrap();
        table.try_create(2, "vega", "10.0.0.2", DEFAULT_PORT).unwrap();
        table.mark_all();
        table.try_create(1, "orion", "10.0.0.1", DEFAULT_PORT).unwrap();

        let gone = table.take_marked();
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].id, 2);
        assert!(table.this_node().is_some());
    }

    #[test]
    fn connect_backoff() {
        let table = {
            let mut t = NodeTable::new(1);
            t.try_create(2, "vega", "10.0.0.2", DEFAULT_PORT).unwrap();
            t
        };
        let node = table.lookup(2).unwrap();
        assert!(node.may_connect(Duration::from_secs(30)));
        assert!(!node.may_connect(Duration::from_secs(30)));
        assert!(node.may_connect(Duration::ZERO));
    }
}

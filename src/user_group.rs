//! Cluster users, groups and identity mappings.
//!
//! The cluster namespace speaks its own uid/gid space. Each node maps
//! between that space and its local ids through a per-node table, falling
//! back to the global table and finally to the configured defaults.

use std::collections::HashMap;

/// Uid and gid used when no mapping applies.
pub const DEFAULT_ANONYMOUS_ID: u32 = 65534;

/// A bidirectional id translation table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMapping {
    to_node: HashMap<u32, u32>,
    to_cluster: HashMap<u32, u32>,
}

impl IdMapping {
    pub fn new() -> IdMapping {
        IdMapping::default()
    }

    /// Assert a pair; later assertions win, both directions stay in step.
    pub fn insert(&mut self, cluster_id: u32, node_id: u32) {
        if let Some(old_node) = self.to_node.insert(cluster_id, node_id) {
            self.to_cluster.remove(&old_node);
        }
        if let Some(old_cluster) = self.to_cluster.insert(node_id, cluster_id) {
            if old_cluster != cluster_id {
                self.to_node.remove(&old_cluster);
            }
        }
    }

    pub fn to_node(&self, cluster_id: u32) -> Option<u32> {
        self.to_node.get(&cluster_id).copied()
    }

    pub fn to_cluster(&self, node_id: u32) -> Option<u32> {
        self.to_cluster.get(&node_id).copied()
    }

    pub fn clear(&mut self) {
        self.to_node.clear();
        self.to_cluster.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.to_node.is_empty()
    }
}

#[derive(Debug, Clone)]
struct NamedEntry {
    name: String,
    marked: bool,
}

/// Users and groups of the cluster plus the global mapping tables.
pub struct UserGroupTable {
    users: HashMap<u32, NamedEntry>,
    groups: HashMap<u32, NamedEntry>,
    /// Global uid mapping applied when a node has no specific pair.
    pub global_uid_map: IdMapping,
    /// Global gid mapping applied when a node has no specific pair.
    pub global_gid_map: IdMapping,
    /// Local uid for unmapped cluster users.
    pub default_uid: u32,
    /// Local gid for unmapped cluster groups.
    pub default_gid: u32,
}

impl UserGroupTable {
    pub fn new(default_uid: u32, default_gid: u32) -> UserGroupTable {
        UserGroupTable {
            users: HashMap::new(),
            groups: HashMap::new(),
            global_uid_map: IdMapping::new(),
            global_gid_map: IdMapping::new(),
            default_uid,
            default_gid,
        }
    }

    pub fn assert_user(&mut self, id: u32, name: &str) {
        self.users.insert(id, NamedEntry { name: name.to_owned(), marked: false });
    }

    pub fn assert_group(&mut self, id: u32, name: &str) {
        self.groups.insert(id, NamedEntry { name: name.to_owned(), marked: false });
    }

    pub fn user_name(&self, id: u32) -> Option<&str> {
        self.users.get(&id).map(|e| e.name.as_str())
    }

    pub fn group_name(&self, id: u32) -> Option<&str> {
        self.groups.get(&id).map(|e| e.name.as_str())
    }

    pub fn user_by_name(&self, name: &str) -> Option<u32> {
        self.users.iter().find(|(_, e)| e.name == name).map(|(&id, _)| id)
    }

    pub fn group_by_name(&self, name: &str) -> Option<u32> {
        self.groups.iter().find(|(_, e)| e.name == name).map(|(&id, _)| id)
    }

    pub fn mark_users(&mut self) {
        for entry in self.users.values_mut() {
            entry.marked = true;
        }
    }

    pub fn mark_groups(&mut self) {
        for entry in self.groups.values_mut() {
            entry.marked = true;
        }
    }

    /// Destroy users still marked after a reload.
    pub fn sweep_users(&mut self) -> usize {
        let before = self.users.len();
        self.users.retain(|_, e| !e.marked);
        before - self.users.len()
    }

    /// Destroy groups still marked after a reload.
    pub fn sweep_groups(&mut self) -> usize {
        let before = self.groups.len();
        self.groups.retain(|_, e| !e.marked);
        before - self.groups.len()
    }

    /// Translate a cluster uid for a node; per-node pairs win over global
    /// ones, unmapped ids become the default.
    pub fn uid_to_node(&self, node_map: &IdMapping, uid: u32) -> u32 {
        node_map
            .to_node(uid)
            .or_else(|| self.global_uid_map.to_node(uid))
            .unwrap_or(self.default_uid)
    }

    /// Translate a node-local uid into the cluster space.
    pub fn uid_to_cluster(&self, node_map: &IdMapping, uid: u32) -> u32 {
        node_map
            .to_cluster(uid)
            .or_else(|| self.global_uid_map.to_cluster(uid))
            .unwrap_or(self.default_uid)
    }

    pub fn gid_to_node(&self, node_map: &IdMapping, gid: u32) -> u32 {
        node_map
            .to_node(gid)
            .or_else(|| self.global_gid_map.to_node(gid))
            .unwrap_or(self.default_gid)
    }

    pub fn gid_to_cluster(&self, node_map: &IdMapping, gid: u32) -> u32 {
        node_map
            .to_cluster(gid)
            .or_else(|| self.global_gid_map.to_cluster(gid))
            .unwrap_or(self.default_gid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_is_bidirectional_and_reassignable() {
        let mut map = IdMapping::new();
        map.insert(1000, 500);
        assert_eq!(map.to_node(1000), Some(500));
        assert_eq!(map.to_cluster(500), Some(1000));

        map.insert(1000, 501);
        assert_eq!(map.to_node(1000), Some(501));
        assert_eq!(map.to_cluster(500), None);
        assert_eq!(map.to_cluster(501), Some(1000));
    }

    #[test]
    fn lookup_order_node_global_default() {
        let mut table = UserGroupTable::new(DEFAULT_ANONYMOUS_ID, DEFAULT_ANONYMOUS_ID);
        table.global_uid_map.insert(1000, 2000);
        let mut node_map = IdMapping::new();
        node_map.insert(1000, 3000);

        assert_eq!(table.uid_to_node(&node_map, 1000), 3000);
        assert_eq!(table.uid_to_node(&IdMapping::new(), 1000), 2000);
        assert_eq!(table.uid_to_node(&IdMapping::new(), 42), DEFAULT_ANONYMOUS_ID);
    }

    #[test]
    fn user_sweep() {
        let mut table = UserGroupTable::new(DEFAULT_ANONYMOUS_ID, DEFAULT_ANONYMOUS_ID);
        table.assert_user(1, "root");
        table.assert_user(2, "stale");
        table.mark_users();
        table.assert_user(1, "root");
        assert_eq!(table.sweep_users(), 1);
        assert_eq!(table.user_by_name("root"), Some(1));
        assert!(table.user_by_name("stale").is_none());
    }
}

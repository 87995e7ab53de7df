//! Cluster configuration files stored on the config volume.
//!
//! `node_list`, `volume_list`, `volume_layout`, `user_list`, `group_list`
//! and the mapping files are TOML documents whose entries are re-asserted
//! on every reload; the reader marks a category, replays the file and
//! destroys what stayed marked.

use serde::Deserialize;

/// One `[[node]]` of `node_list`.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeEntry {
    pub id: u32,
    pub name: String,
    pub address: String,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeListFile {
    #[serde(default)]
    pub node: Vec<NodeEntry>,
}

/// One `[[volume]]` of `volume_list`.
#[derive(Debug, Clone, Deserialize)]
pub struct VolumeEntry {
    pub id: u32,
    pub name: String,
    pub mountpoint: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VolumeListFile {
    #[serde(default)]
    pub volume: Vec<VolumeEntry>,
}

/// A node of a volume's replication tree. The root masters the volume;
/// every edge runs master to slave.
#[derive(Debug, Clone, Deserialize)]
pub struct LayoutTree {
    pub node: String,
    #[serde(default)]
    pub children: Vec<LayoutTree>,
}

/// One `[[layout]]` of `volume_layout`.
#[derive(Debug, Clone, Deserialize)]
pub struct LayoutEntry {
    pub volume: u32,
    pub tree: LayoutTree,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VolumeLayoutFile {
    #[serde(default)]
    pub layout: Vec<LayoutEntry>,
}

/// One `[[user]]` / `[[group]]` of the id lists.
#[derive(Debug, Clone, Deserialize)]
pub struct IdNameEntry {
    pub id: u32,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserListFile {
    #[serde(default)]
    pub user: Vec<IdNameEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupListFile {
    #[serde(default)]
    pub group: Vec<IdNameEntry>,
}

/// One `[[map]]` of a mapping file: a cluster id paired with a node id.
#[derive(Debug, Clone, Deserialize)]
pub struct MapEntry {
    pub cluster: u32,
    pub node: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MappingFile {
    #[serde(default)]
    pub map: Vec<MapEntry>,
}

/// This node's place in one volume's replication tree: its master (`None`
/// at the root) and its slaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutPlace {
    pub master: Option<String>,
    pub slaves: Vec<String>,
}

/// Find `node` in the layout tree.
pub fn layout_place(tree: &LayoutTree, node: &str) -> Option<LayoutPlace> {
    fn walk(tree: &LayoutTree, parent: Option<&str>, node: &str) -> Option<LayoutPlace> {
        if tree.node == node {
            return Some(LayoutPlace {
                master: parent.map(str::to_owned),
                slaves: tree.children.iter().map(|c| c.node.clone()).collect(),
            });
        }
        tree.children.iter().find_map(|child| walk(child, Some(&tree.node), node))
    }
    walk(tree, None, node)
}

pub fn parse_node_list(text: &str) -> Result<NodeListFile, toml::de::Error> {
    toml::from_str(text)
}

pub fn parse_volume_list(text: &str) -> Result<VolumeListFile, toml::de::Error> {
    toml::from_str(text)
}

pub fn parse_volume_layout(text: &str) -> Result<VolumeLayoutFile, toml::de::Error> {
    toml::from_str(text)
}

pub fn parse_user_list(text: &str) -> Result<UserListFile, toml::de::Error> {
    toml::from_str(text)
}

pub fn parse_group_list(text: &str) -> Result<GroupListFile, toml::de::Error> {
    toml::from_str(text)
}

pub fn parse_mapping(text: &str) -> Result<MappingFile, toml::de::Error> {
    toml::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_list_parses() {
        let file = parse_node_list(
            r#"
            [[node]]
            id = 1
            name = "orion"
            address = "10.0.0.1"

            [[node]]
            id = 2
            name = "vega"
            address = "10.0.0.2"
            port = 12400
            "#,
        )
        .unwrap();
        assert_eq!(file.node.len(), 2);
        assert_eq!(file.node[1].port, Some(12400));
    }

    #[test]
    fn layout_place_finds_master_and_slaves() {
        let file = parse_volume_layout(
            r#"
            [[layout]]
            volume = 7
            tree = { node = "orion", children = [
                { node = "vega", children = [ { node = "altair" } ] },
                { node = "deneb" },
            ] }
            "#,
        )
        .unwrap();
        let tree = &file.layout[0].tree;

        assert_eq!(
            layout_place(tree, "orion").unwrap(),
            LayoutPlace { master: None, slaves: vec!["vega".into(), "deneb".into()] }
        );
        assert_eq!(
            layout_place(tree, "vega").unwrap(),
            LayoutPlace { master: Some("orion".into()), slaves: vec!["altair".into()] }
        );
        assert_eq!(
            layout_place(tree, "altair").unwrap(),
            LayoutPlace { master: Some("vega".into()), slaves: vec![] }
        );
        assert!(layout_place(tree, "unknown").is_none());
    }

    #[test]
    fn mapping_parses() {
        let file = parse_mapping("[[map]]\ncluster = 1000\nnode = 500\n").unwrap();
        assert_eq!(file.map[0].cluster, 1000);
        assert_eq!(file.map[0].node, 500);
    }
}

//! Local daemon configuration.
//!
//! Read once at startup from a TOML file and re-read on demand (SIGHUP or
//! a sentinel request to the configuration reader). Cluster-wide
//! configuration lives on the config volume and is handled by
//! [`shared`] and [`reader`].

pub mod reader;
pub mod shared;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::pool::PoolLimits;
use crate::user_group::DEFAULT_ANONYMOUS_ID;

/// Deepest allowed metadata directory fanout.
pub const MAX_METADATA_TREE_DEPTH: u32 = 4;

/// Errors loading the local configuration.
#[derive(Debug)]
pub enum ConfigError {
    IO(std::io::Error),
    Parse(toml::de::Error),
    /// A value is out of its documented range.
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IO(err) => write!(f, "config read failed: {err}"),
            ConfigError::Parse(err) => write!(f, "config parse failed: {err}"),
            ConfigError::Invalid(what) => write!(f, "invalid config value: {what}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// `[system]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Lock the daemon image in memory.
    pub mlock: bool,
    /// Fanout depth of the journal/interval/hardlink trees.
    pub metadata_tree_depth: u32,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig { mlock: false, metadata_tree_depth: 1 }
    }
}

/// `[threads]` section: one limit triple per pool.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ThreadsConfig {
    pub kernel_thread: PoolLimits,
    pub network_thread: PoolLimits,
    pub update_thread: PoolLimits,
}

/// `[local_node]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalNodeConfig {
    pub id: u32,
    pub name: String,
    /// Port this daemon listens on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// `[config_node]` section: where the config volume master lives.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigNodeConfig {
    pub id: u32,
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    crate::node::DEFAULT_PORT
}

/// `[users]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UsersConfig {
    pub default_uid: Option<u32>,
    pub default_user: Option<String>,
}

/// `[groups]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GroupsConfig {
    pub default_gid: Option<u32>,
    pub default_group: Option<String>,
}

/// One `[[volumes]]` entry: a volume cached on this node.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalVolumeConfig {
    pub id: u32,
    /// Cache size limit in bytes; zero is unlimited.
    #[serde(default)]
    pub cache_size: u64,
    pub local_path: PathBuf,
}

/// The whole local configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub threads: ThreadsConfig,
    pub local_node: LocalNodeConfig,
    pub config_node: Option<ConfigNodeConfig>,
    #[serde(default)]
    pub users: UsersConfig,
    #[serde(default)]
    pub groups: GroupsConfig,
    #[serde(default)]
    pub volumes: Vec<LocalVolumeConfig>,
}

impl LocalConfig {
    /// Parse and validate the file at `path`.
    pub fn load(path: &Path) -> Result<LocalConfig, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(ConfigError::IO)?;
        LocalConfig::parse(&text)
    }

    /// Parse and validate configuration text.
    pub fn parse(text: &str) -> Result<LocalConfig, ConfigError> {
        let config: LocalConfig = toml::from_str(text).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.local_node.id == crate::node::NODE_ID_NONE {
            return Err(ConfigError::Invalid("local_node.id must be nonzero"));
        }
        if self.local_node.name.is_empty() {
            return Err(ConfigError::Invalid("local_node.name must not be empty"));
        }
        if self.system.metadata_tree_depth > MAX_METADATA_TREE_DEPTH {
            return Err(ConfigError::Invalid("system.metadata_tree_depth out of range"));
        }
        for volume in &self.volumes {
            if volume.local_path.as_os_str().is_empty() {
                return Err(ConfigError::Invalid("volumes.local_path must not be empty"));
            }
        }
        Ok(())
    }

    /// The default uid for unmapped users; `default_user` requires the
    /// user list and is resolved later.
    pub fn default_uid(&self) -> u32 {
        self.users.default_uid.unwrap_or(DEFAULT_ANONYMOUS_ID)
    }

    pub fn default_gid(&self) -> u32 {
        self.groups.default_gid.unwrap_or(DEFAULT_ANONYMOUS_ID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [system]
        mlock = false
        metadata_tree_depth = 2

        [threads.kernel_thread]
        max_total = 32
        min_spare = 4
        max_spare = 8

        [local_node]
        id = 1
        name = "orion"

        [config_node]
        id = 1
        name = "orion"
        host = "127.0.0.1"

        [users]
        default_uid = 65533

        [[volumes]]
        id = 1
        cache_size = 0
        local_path = "/var/zfs/config"

        [[volumes]]
        id = 7
        cache_size = 1073741824
        local_path = "/var/zfs/home"
    "#;

    #[test]
    fn parses_the_documented_shape() {
        let config = LocalConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.system.metadata_tree_depth, 2);
        assert_eq!(config.threads.kernel_thread.max_total, 32);
        // unnamed sections fall back to defaults
        assert_eq!(config.threads.update_thread, PoolLimits::default());
        assert_eq!(config.local_node.name, "orion");
        assert_eq!(config.local_node.port, crate::node::DEFAULT_PORT);
        assert_eq!(config.default_uid(), 65533);
        assert_eq!(config.default_gid(), DEFAULT_ANONYMOUS_ID);
        assert_eq!(config.volumes.len(), 2);
        assert_eq!(config.volumes[1].cache_size, 1 << 30);
    }

    #[test]
    fn rejects_out_of_range_tree_depth() {
        let bad = SAMPLE.replace("metadata_tree_depth = 2", "metadata_tree_depth = 9");
        assert!(matches!(LocalConfig::parse(&bad), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_missing_local_node() {
        assert!(matches!(LocalConfig::parse("[system]\n"), Err(ConfigError::Parse(_))));
    }
}

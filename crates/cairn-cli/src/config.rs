use std::fs;
use std::path::Path;

use anyhow::Context;
use cairn_bus::BusConfig;
use cairn_store::StoreConfig;
use serde::{Deserialize, Serialize};

/// Everything a node needs to run: the repository and its worker pool.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub store: StoreConfig,
    pub bus: BusConfig,
}

impl NodeConfig {
    /// Read `path` if given, otherwise fall back to defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.store.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn defaults_without_a_file() {
        let config = NodeConfig::load(None).unwrap();
        assert_eq!(config.store, StoreConfig::default());
        assert_eq!(config.bus.worker_threads, BusConfig::default().worker_threads);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        fs::write(
            &path,
            "[store]\nroot = \"/srv/cairn\"\nkey_length = 3\n\n[bus]\nworker_threads = 2\n",
        )
        .unwrap();

        let config = NodeConfig::load(Some(&path)).unwrap();
        assert_eq!(config.store.root, PathBuf::from("/srv/cairn"));
        assert_eq!(config.store.key_length, 3);
        assert_eq!(config.store.max_loaded_pages, StoreConfig::default().max_loaded_pages);
        assert_eq!(config.bus.worker_threads, 2);
        assert_eq!(config.bus.thread_name, BusConfig::default().thread_name);
    }

    #[test]
    fn invalid_store_settings_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        fs::write(&path, "[store]\nkey_length = 9\n").unwrap();
        assert!(NodeConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = NodeConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(err.to_string().contains("absent.toml"));
    }
}

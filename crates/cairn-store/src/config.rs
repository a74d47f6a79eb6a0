use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::backoff::RetryPolicy;
use crate::error::{StoreError, StoreResult};
use crate::partition::MAX_KEY_LENGTH;

/// Configuration for a [`Repository`](crate::Repository).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the repository.
    pub root: PathBuf,
    /// Hex digits of the hash used to pick a bucket (1 to 4).
    pub key_length: usize,
    /// Upper bound on info buckets held in memory; 0 disables the bound.
    pub max_loaded_pages: usize,
    /// `fsync` journal markers and info shards as they are written.
    pub sync_writes: bool,
    /// Release a stored hash as soon as its put is committed, instead of
    /// waiting for an explicit acknowledgement.
    pub auto_acknowledge: bool,
    /// How long to wait for a busy info bucket.
    pub retry: RetryPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("cairn-data"),
            key_length: 2,
            max_loaded_pages: 64,
            sync_writes: false,
            auto_acknowledge: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl StoreConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.key_length == 0 || self.key_length > MAX_KEY_LENGTH {
            return Err(StoreError::Config(format!(
                "key_length must be between 1 and {MAX_KEY_LENGTH}, got {}",
                self.key_length
            )));
        }
        if self.root.as_os_str().is_empty() {
            return Err(StoreError::Config("root must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.key_length, 2);
        assert!(config.auto_acknowledge);
    }

    #[test]
    fn rejects_bad_key_length() {
        let config = StoreConfig {
            key_length: 5,
            ..StoreConfig::default()
        };
        assert!(matches!(config.validate(), Err(StoreError::Config(_))));
    }

    #[test]
    fn parses_nested_toml() {
        let config: StoreConfig = toml::from_str(
            r#"
            root = "/var/lib/cairn"
            key_length = 1

            [retry]
            timeout_ms = 100
            "#,
        )
        .unwrap();
        assert_eq!(config.root, PathBuf::from("/var/lib/cairn"));
        assert_eq!(config.key_length, 1);
        assert_eq!(config.retry.timeout_ms, Some(100));
        assert_eq!(config.max_loaded_pages, 64);
    }
}

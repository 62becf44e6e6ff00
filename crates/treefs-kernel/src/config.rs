//! Repository configuration.
//!
//! Loaded from a RON file; every field has a default so an empty `()` or a
//! missing file yields a working in-memory setup.
//!
//! ```ron
//! (
//!     database: Some("/var/lib/treefs/tree.db"),
//!     busy_timeout_ms: 5000,
//!     lock_timeout_ms: 2000,
//!     max_retries: 3,
//!     cache: (ttl_secs: Some(300), max_entries: 10000),
//! )
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Default config file name under the treefs config directory.
const CONFIG_FILE: &str = "config.ron";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),
}

/// Cache tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry lifetime; `None` keeps entries until invalidated or evicted.
    pub ttl_secs: Option<u64>,
    /// Upper bound on cached entries.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: Some(300),
            max_entries: 10_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

/// Top-level configuration for a [`crate::TreeRepository`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// SQLite database file. `None` opens a private in-memory store.
    pub database: Option<PathBuf>,
    /// How long the store waits on its own write lock.
    pub busy_timeout_ms: u64,
    /// How long a transaction waits for a row lock before giving up with a conflict.
    pub lock_timeout_ms: u64,
    /// Retries after a conflict before it reaches the caller.
    pub max_retries: u32,
    /// Pause between retries. Zero retries immediately.
    pub retry_backoff_ms: u64,
    pub cache: CacheConfig,
    /// Largest accepted file payload.
    pub max_content_bytes: usize,
    /// Default depth limit for `find`. `None` searches the whole subtree.
    pub find_max_depth: Option<usize>,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            database: None,
            busy_timeout_ms: 5000,
            lock_timeout_ms: 2000,
            max_retries: 3,
            retry_backoff_ms: 0,
            cache: CacheConfig::default(),
            max_content_bytes: 1024 * 1024,
            find_max_depth: None,
        }
    }
}

impl TreeConfig {
    /// Parse a RON document.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(text)?)
    }

    /// Load from a file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_ron(&text)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// `$XDG_CONFIG_HOME/treefs/config.ron`, if a config dir is known.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("treefs").join(CONFIG_FILE))
    }

    /// Same config, backed by the given database file.
    pub fn with_database(mut self, path: impl Into<PathBuf>) -> Self {
        self.database = Some(path.into());
        self
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_ron_is_default() {
        let config = TreeConfig::from_ron("()").unwrap();
        assert!(config.database.is_none());
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.cache.ttl_secs, Some(300));
        assert_eq!(config.lock_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_override() {
        let config = TreeConfig::from_ron(
            r#"(
                database: Some("/tmp/tree.db"),
                max_retries: 5,
                cache: (ttl_secs: None),
                find_max_depth: Some(10),
            )"#,
        )
        .unwrap();
        assert_eq!(config.database.as_deref(), Some(Path::new("/tmp/tree.db")));
        assert_eq!(config.max_retries, 5);
        assert!(config.cache.ttl().is_none());
        assert_eq!(config.cache.max_entries, 10_000);
        assert_eq!(config.find_max_depth, Some(10));
    }

    #[test]
    fn test_bad_ron_is_error() {
        assert!(matches!(
            TreeConfig::from_ron("(max_retries: \"three\")"),
            Err(ConfigError::Ron(_))
        ));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = TreeConfig::load_or_default(&dir.path().join("nope.ron")).unwrap();
        assert_eq!(config.busy_timeout_ms, 5000);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.ron");
        std::fs::write(&path, "(lock_timeout_ms: 50)").unwrap();
        let config = TreeConfig::load(&path).unwrap();
        assert_eq!(config.lock_timeout(), Duration::from_millis(50));
    }
}

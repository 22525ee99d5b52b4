use std::env;
use std::path::{Path, PathBuf};

/// Environment variable holding the database file path.
pub const ENV_DB_PATH: &str = "SMARTSTORE_DB_PATH";
/// Environment variable holding the store encryption key.
pub const ENV_KEY: &str = "SMARTSTORE_KEY";
/// Environment variable overriding the external storage directory.
pub const ENV_EXTERNAL_DIR: &str = "SMARTSTORE_EXTERNAL_DIR";

/// Configuration used to open a [`SmartStore`](crate::SmartStore).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database file. `None` opens an in-memory database.
    pub path: Option<PathBuf>,
    /// Key handed to the SQL engine (`PRAGMA key`) and used to derive the
    /// blob store encryption key. Empty means no database-level key.
    pub encryption_key: String,
    /// Parent directory of the per-soup external storage directories.
    pub external_storage_dir: Option<PathBuf>,
    /// Use write-ahead logging for file databases.
    pub wal_mode: bool,
    /// Capacity of the connection's compiled statement cache.
    pub statement_cache_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            encryption_key: String::new(),
            external_storage_dir: None,
            wal_mode: true,
            statement_cache_capacity: 64,
        }
    }
}

impl StoreConfig {
    /// Configuration for a file-backed store at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    /// Configuration for an in-memory store, mostly useful in tests.
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn with_encryption_key(mut self, key: &str) -> Self {
        self.encryption_key = key.to_string();
        self
    }

    pub fn with_external_storage_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.external_storage_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_wal_mode(mut self, enabled: bool) -> Self {
        self.wal_mode = enabled;
        self
    }

    /// Builds a configuration from the environment.
    ///
    /// `SMARTSTORE_DB_PATH` selects the database file (in-memory when unset or
    /// empty), `SMARTSTORE_KEY` the encryption key and `SMARTSTORE_EXTERNAL_DIR`
    /// the external storage directory.
    pub fn from_env() -> Self {
        let mut config = match env::var(ENV_DB_PATH) {
            Ok(path) if !path.is_empty() => Self::new(path),
            _ => Self::memory(),
        };
        if let Ok(key) = env::var(ENV_KEY) {
            config.encryption_key = key;
        }
        if let Ok(dir) = env::var(ENV_EXTERNAL_DIR) {
            if !dir.is_empty() {
                config.external_storage_dir = Some(PathBuf::from(dir));
            }
        }
        config
    }

    /// Directory holding external storage, if one can be determined.
    ///
    /// Defaults to `<db dir>/<db stem>_external` for file databases.
    pub fn resolved_external_storage_dir(&self) -> Option<PathBuf> {
        if let Some(dir) = &self.external_storage_dir {
            return Some(dir.clone());
        }
        let path = self.path.as_ref()?;
        let stem = path.file_stem()?.to_str()?;
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        Some(parent.join(format!("{}_external", stem)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_external_dir() {
        let config = StoreConfig::new("/tmp/stores/main.db");
        assert_eq!(
            config.resolved_external_storage_dir(),
            Some(PathBuf::from("/tmp/stores/main_external"))
        );
    }

    #[test]
    fn test_memory_has_no_external_dir() {
        assert!(StoreConfig::memory().resolved_external_storage_dir().is_none());
        let config = StoreConfig::memory().with_external_storage_dir("/tmp/ext");
        assert_eq!(config.resolved_external_storage_dir(), Some(PathBuf::from("/tmp/ext")));
    }
}

//! Encrypted key-value blob storage.
//!
//! [`KeyValueEncryptedFileStore`] keeps every entry as a pair of encrypted
//! files in a directory; [`KeyValueCachedStore`] puts a bounded LRU in front of
//! any [`KeyValueStore`].

pub mod cached;
pub mod file_store;
pub mod vault;

pub use cached::KeyValueCachedStore;
pub use file_store::KeyValueEncryptedFileStore;

use std::io::Read;

/// Basic operations of a key-value blob store.
///
/// I/O failures are logged and reported as `false`/`None` instead of errors.
pub trait KeyValueStore: Send + Sync {
    /// Stores `value` under `key`, replacing any previous value.
    fn save_value(&self, key: &str, value: &str) -> bool;
    /// Stores the full contents of `stream` under `key`.
    fn save_stream(&self, key: &str, stream: &mut dyn Read) -> bool;
    /// Returns the value last saved under `key`.
    fn get_value(&self, key: &str) -> Option<String>;
    /// Returns a reader over the value last saved under `key`.
    fn get_stream(&self, key: &str) -> Option<Box<dyn Read + Send>>;
    /// Removes `key`. Returns `false` if nothing was removed.
    fn delete_value(&self, key: &str) -> bool;
    /// Removes every entry.
    fn delete_all(&self);
    /// Number of entries.
    fn count(&self) -> usize;
    /// All keys currently stored.
    fn key_set(&self) -> Vec<String>;

    fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

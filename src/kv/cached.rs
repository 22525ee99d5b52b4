use std::io::{Cursor, Read};
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::kv::KeyValueStore;

/// LRU caching decorator for a [`KeyValueStore`].
///
/// Reads are served from the cache first and populate it on a miss; writes
/// populate it as well. Deleting a key evicts that key and `delete_all`
/// clears the cache.
pub struct KeyValueCachedStore<S: KeyValueStore> {
    inner: S,
    cache: Mutex<LruCache<String, Vec<u8>>>,
}

impl<S: KeyValueStore> KeyValueCachedStore<S> {
    pub fn new(inner: S, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Number of values currently held in memory.
    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_cached(&self, key: &str) -> bool {
        self.cache.lock().contains(key)
    }

    fn cached(&self, key: &str) -> Option<Vec<u8>> {
        self.cache.lock().get(key).cloned()
    }
}

impl<S: KeyValueStore> KeyValueStore for KeyValueCachedStore<S> {
    fn save_value(&self, key: &str, value: &str) -> bool {
        let saved = self.inner.save_value(key, value);
        let mut cache = self.cache.lock();
        if saved {
            cache.put(key.to_string(), value.as_bytes().to_vec());
        } else {
            cache.pop(key);
        }
        saved
    }

    fn save_stream(&self, key: &str, stream: &mut dyn Read) -> bool {
        let mut bytes = Vec::new();
        if stream.read_to_end(&mut bytes).is_err() {
            return false;
        }
        let saved = self.inner.save_stream(key, &mut Cursor::new(bytes.as_slice()));
        let mut cache = self.cache.lock();
        if saved {
            cache.put(key.to_string(), bytes);
        } else {
            cache.pop(key);
        }
        saved
    }

    fn get_value(&self, key: &str) -> Option<String> {
        if let Some(bytes) = self.cached(key) {
            return String::from_utf8(bytes).ok();
        }
        let value = self.inner.get_value(key)?;
        self.cache.lock().put(key.to_string(), value.as_bytes().to_vec());
        Some(value)
    }

    fn get_stream(&self, key: &str) -> Option<Box<dyn Read + Send>> {
        if let Some(bytes) = self.cached(key) {
            return Some(Box::new(Cursor::new(bytes)));
        }
        let mut bytes = Vec::new();
        self.inner.get_stream(key)?.read_to_end(&mut bytes).ok()?;
        self.cache.lock().put(key.to_string(), bytes.clone());
        Some(Box::new(Cursor::new(bytes)))
    }

    fn delete_value(&self, key: &str) -> bool {
        self.cache.lock().pop(key);
        self.inner.delete_value(key)
    }

    fn delete_all(&self) {
        self.cache.lock().clear();
        self.inner.delete_all();
    }

    fn count(&self) -> usize {
        self.inner.count()
    }

    fn key_set(&self) -> Vec<String> {
        self.inner.key_set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KeyValueEncryptedFileStore;
    use tempfile::tempdir;

    #[test]
    fn test_read_through_and_write_population() {
        let dir = tempdir().unwrap();
        let file_store = KeyValueEncryptedFileStore::new(dir.path(), "cached", "k").unwrap();
        file_store.save_value("pre", "existing");

        let store = KeyValueCachedStore::new(file_store, 2);
        assert!(!store.is_cached("pre"));
        assert_eq!(store.get_value("pre"), Some("existing".to_string()));
        assert!(store.is_cached("pre"));

        store.save_value("w", "written");
        assert!(store.is_cached("w"));
        assert_eq!(store.get_value("w"), Some("written".to_string()));
    }

    #[test]
    fn test_bounded_capacity() {
        let dir = tempdir().unwrap();
        let file_store = KeyValueEncryptedFileStore::new(dir.path(), "cached", "k").unwrap();
        let store = KeyValueCachedStore::new(file_store, 2);

        store.save_value("a", "1");
        store.save_value("b", "2");
        store.save_value("c", "3");
        assert_eq!(store.cached_len(), 2);
        assert!(!store.is_cached("a"));
        // Evicted entries are still served from disk.
        assert_eq!(store.get_value("a"), Some("1".to_string()));
        assert_eq!(store.count(), 3);
    }

    #[test]
    fn test_precise_invalidation() {
        let dir = tempdir().unwrap();
        let file_store = KeyValueEncryptedFileStore::new(dir.path(), "cached", "k").unwrap();
        let store = KeyValueCachedStore::new(file_store, 10);

        store.save_value("a", "1");
        store.save_value("b", "2");
        assert!(store.delete_value("a"));
        assert!(!store.is_cached("a"));
        assert!(store.is_cached("b"));
        assert_eq!(store.get_value("a"), None);

        store.delete_all();
        assert_eq!(store.cached_len(), 0);
        assert_eq!(store.get_value("b"), None);
    }

    #[test]
    fn test_stream_cached() {
        let dir = tempdir().unwrap();
        let file_store = KeyValueEncryptedFileStore::new(dir.path(), "cached", "k").unwrap();
        let store = KeyValueCachedStore::new(file_store, 10);

        let mut input = Cursor::new(b"stream-bytes".to_vec());
        assert!(store.save_stream("s", &mut input));
        let mut out = String::new();
        store.get_stream("s").unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "stream-bytes");
    }
}

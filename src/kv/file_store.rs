use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use log::{debug, error, warn};
use parking_lot::RwLock;

use crate::kv::{vault, KeyValueStore};
use crate::{Error, Result};

const KEY_SUFFIX: &str = "key";
const VALUE_SUFFIX: &str = "value";
const VERSION_FILE: &str = "version";
const STORE_VERSION: u32 = 2;
/// Longest accepted store name.
pub const MAX_STORE_NAME_LENGTH: usize = 96;

/// Key-value store keeping one pair of encrypted files per entry.
///
/// Keys are hashed with SHA-256 into file names. `<hash>.value` holds the
/// encrypted value and `<hash>.key` the encrypted key, so keys can be
/// enumerated without decrypting values. Files are written with a
/// "write-then-rename" strategy so a crash never leaves a torn file behind.
pub struct KeyValueEncryptedFileStore {
    store_dir: PathBuf,
    store_name: String,
    key: RwLock<[u8; 32]>,
}

impl KeyValueEncryptedFileStore {
    /// Opens (creating if needed) the store `store_name` under `parent_dir`.
    pub fn new<P: AsRef<Path>>(parent_dir: P, store_name: &str, encryption_key: &str) -> Result<Self> {
        if !Self::is_valid_store_name(store_name) {
            return Err(Error::InvalidOperation(format!("invalid key-value store name: {}", store_name)));
        }
        let store_dir = parent_dir.as_ref().join(store_name);
        if !store_dir.exists() {
            fs::create_dir_all(&store_dir)?;
        }
        let version_path = store_dir.join(VERSION_FILE);
        if !version_path.exists() {
            write_atomic(&version_path, STORE_VERSION.to_string().as_bytes())?;
        }
        debug!("Opened key-value store {:?}", store_dir);
        Ok(Self {
            store_dir,
            store_name: store_name.to_string(),
            key: RwLock::new(vault::derive_key(encryption_key)),
        })
    }

    /// Store names are limited to ASCII letters, digits and underscores.
    pub fn is_valid_store_name(name: &str) -> bool {
        !name.is_empty()
            && name.len() <= MAX_STORE_NAME_LENGTH
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    /// Version recorded in the store's marker file.
    pub fn store_version(&self) -> Option<u32> {
        fs::read_to_string(self.store_dir.join(VERSION_FILE))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// Total size in bytes of the files in the store directory.
    pub fn size_on_disk(&self) -> u64 {
        fs::read_dir(&self.store_dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| e.metadata().ok())
                    .map(|m| m.len())
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Re-encrypts every entry under `new_key`.
    ///
    /// Entries are rewritten into a sibling temporary directory which replaces
    /// the store only once every entry succeeded. On failure the store is left
    /// untouched and `false` is returned.
    pub fn change_encryption_key(&self, new_key: &str) -> bool {
        match self.rekey(new_key) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to change encryption key of store {}: {}", self.store_name, e);
                false
            }
        }
    }

    /// Deletes the store directory itself.
    pub fn remove_store(&self) -> bool {
        match fs::remove_dir_all(&self.store_dir) {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not remove key-value store {:?}: {}", self.store_dir, e);
                false
            }
        }
    }

    fn rekey(&self, new_key: &str) -> Result<()> {
        let mut key_guard = self.key.write();
        let old_key = *key_guard;
        let new_key = vault::derive_key(new_key);

        let parent = self
            .store_dir
            .parent()
            .ok_or_else(|| Error::Internal("store directory has no parent".to_string()))?;
        let staging = tempfile::Builder::new()
            .prefix(&format!("{}_rekey", self.store_name))
            .tempdir_in(parent)?;

        for hash in self.entry_hashes()? {
            for suffix in [KEY_SUFFIX, VALUE_SUFFIX] {
                let file_name = format!("{}.{}", hash, suffix);
                let plain = read_decrypted(&self.store_dir.join(&file_name), &old_key)?;
                let encrypted = vault::encrypt(&plain, &new_key)?;
                fs::write(staging.path().join(&file_name), encrypted)?;
            }
        }
        fs::write(staging.path().join(VERSION_FILE), STORE_VERSION.to_string())?;

        let backup = parent.join(format!("{}_backup", self.store_name));
        if backup.exists() {
            fs::remove_dir_all(&backup)?;
        }
        fs::rename(&self.store_dir, &backup)?;
        if let Err(e) = fs::rename(staging.path(), &self.store_dir) {
            fs::rename(&backup, &self.store_dir)?;
            return Err(e.into());
        }
        if let Err(e) = fs::remove_dir_all(&backup) {
            warn!("Could not remove backup {:?}: {}", backup, e);
        }

        *key_guard = new_key;
        Ok(())
    }

    fn entry_hashes(&self) -> Result<Vec<String>> {
        let mut hashes = Vec::new();
        for entry in fs::read_dir(&self.store_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) == Some(KEY_SUFFIX) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    hashes.push(stem.to_string());
                }
            }
        }
        Ok(hashes)
    }

    fn entry_path(&self, key: &str, suffix: &str) -> PathBuf {
        self.store_dir.join(format!("{}.{}", vault::hash_key(key), suffix))
    }

    fn save_bytes(&self, key: &str, value: &[u8]) -> Result<()> {
        let enc_key = *self.key.read();
        let encrypted_value = vault::encrypt(value, &enc_key)?;
        let encrypted_key = vault::encrypt(key.as_bytes(), &enc_key)?;
        write_atomic(&self.entry_path(key, VALUE_SUFFIX), &encrypted_value)?;
        write_atomic(&self.entry_path(key, KEY_SUFFIX), &encrypted_key)?;
        Ok(())
    }

    fn load_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.entry_path(key, VALUE_SUFFIX);
        if !path.exists() {
            return Ok(None);
        }
        let enc_key = *self.key.read();
        read_decrypted(&path, &enc_key).map(Some)
    }
}

impl KeyValueStore for KeyValueEncryptedFileStore {
    fn save_value(&self, key: &str, value: &str) -> bool {
        match self.save_bytes(key, value.as_bytes()) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to save value for key {} in store {}: {}", key, self.store_name, e);
                false
            }
        }
    }

    fn save_stream(&self, key: &str, stream: &mut dyn Read) -> bool {
        let mut bytes = Vec::new();
        if let Err(e) = stream.read_to_end(&mut bytes) {
            error!("Failed to read stream for key {}: {}", key, e);
            return false;
        }
        match self.save_bytes(key, &bytes) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to save stream for key {} in store {}: {}", key, self.store_name, e);
                false
            }
        }
    }

    fn get_value(&self, key: &str) -> Option<String> {
        match self.load_bytes(key) {
            Ok(Some(bytes)) => match String::from_utf8(bytes) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!("Value for key {} is not UTF-8: {}", key, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Could not read value for key {} in store {}: {}", key, self.store_name, e);
                None
            }
        }
    }

    fn get_stream(&self, key: &str) -> Option<Box<dyn Read + Send>> {
        match self.load_bytes(key) {
            Ok(Some(bytes)) => Some(Box::new(Cursor::new(bytes))),
            Ok(None) => None,
            Err(e) => {
                warn!("Could not read stream for key {} in store {}: {}", key, self.store_name, e);
                None
            }
        }
    }

    fn delete_value(&self, key: &str) -> bool {
        let value_path = self.entry_path(key, VALUE_SUFFIX);
        let key_path = self.entry_path(key, KEY_SUFFIX);
        if !value_path.exists() {
            return false;
        }
        let removed = fs::remove_file(&value_path).and_then(|_| match fs::remove_file(&key_path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        });
        match removed {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not delete key {} in store {}: {}", key, self.store_name, e);
                false
            }
        }
    }

    fn delete_all(&self) {
        let entries = match fs::read_dir(&self.store_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Could not list store {:?}: {}", self.store_dir, e);
                return;
            }
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let ext = path.extension().and_then(|s| s.to_str());
            if ext == Some(KEY_SUFFIX) || ext == Some(VALUE_SUFFIX) {
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Could not delete {:?}: {}", path, e);
                }
            }
        }
    }

    fn count(&self) -> usize {
        self.entry_hashes().map(|h| h.len()).unwrap_or(0)
    }

    fn key_set(&self) -> Vec<String> {
        let hashes = match self.entry_hashes() {
            Ok(h) => h,
            Err(e) => {
                warn!("Could not list store {:?}: {}", self.store_dir, e);
                return Vec::new();
            }
        };
        let enc_key = *self.key.read();
        hashes
            .into_iter()
            .filter_map(|hash| {
                let path = self.store_dir.join(format!("{}.{}", hash, KEY_SUFFIX));
                match read_decrypted(&path, &enc_key).map(String::from_utf8) {
                    Ok(Ok(key)) => Some(key),
                    Ok(Err(e)) => {
                        warn!("Key file {:?} is not UTF-8: {}", path, e);
                        None
                    }
                    Err(e) => {
                        warn!("Could not decrypt key file {:?}: {}", path, e);
                        None
                    }
                }
            })
            .collect()
    }
}

/// Writes `bytes` to a temporary sibling of `path` and renames it into place.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    fs::write(&temp_path, bytes)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

fn read_decrypted(path: &Path, key: &[u8; 32]) -> Result<Vec<u8>> {
    let content = fs::read(path)?;
    vault::decrypt(&content, key)
}

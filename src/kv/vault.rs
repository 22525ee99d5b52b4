use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use sha2::{Digest, Sha256};
use crate::{Result, Error};

const NONCE_LEN: usize = 12;

/// Derives the 32-byte AES key used for a store from its key string.
pub fn derive_key(secret: &str) -> [u8; 32] {
    Sha256::digest(secret.as_bytes()).into()
}

/// Irreversibly hashes a key-value key into a filesystem-safe name.
pub fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Encrypts `plaintext` using AES-256-GCM and a 32-byte key.
///
/// Returns the 12-byte nonce followed by the ciphertext.
pub fn encrypt(plaintext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| Error::Encryption(e.to_string()))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher.encrypt(&nonce, plaintext).map_err(|e| Error::Encryption(e.to_string()))?;

    let mut combined = nonce.to_vec();
    combined.extend_from_slice(&ciphertext);
    Ok(combined)
}

/// Decrypts the output of [`encrypt`].
pub fn decrypt(combined: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
    if combined.len() < NONCE_LEN {
        return Err(Error::Encryption("ciphertext too short".to_string()));
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| Error::Encryption(e.to_string()))?;
    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| Error::Encryption("decryption failed (wrong key or tampered data)".to_string()))
}

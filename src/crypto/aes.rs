use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};
use crate::error::{AppError, Result};

/// The size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// The size of the AES-GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// The size of the AES-GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;
/// The algorithm label recorded on every envelope.
pub const ALGORITHM: &str = "AES-256-GCM";

/// A secure key wrapper that ensures the key is zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecureKey([u8; KEY_SIZE]);

impl SecureKey {
    /// Creates a new `SecureKey` from a byte array.
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self(key)
    }

    /// Builds a key from a slice, which must be exactly [`KEY_SIZE`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| AppError::Encryption("Invalid key size".to_string()))?;
        Ok(Self(key))
    }

    /// Returns a reference to the key as a byte slice.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SecureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecureKey(..)")
    }
}

/// Fills `buf` from the OS RNG.
pub fn fill_random(buf: &mut [u8]) -> Result<()> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| AppError::KeyGeneration(format!("OS RNG failure: {}", e)))
}

/// Generates a new random AES-256 key.
pub fn generate_key() -> Result<SecureKey> {
    let mut key = [0u8; KEY_SIZE];
    fill_random(&mut key)?;
    let secure = SecureKey::new(key);
    key.zeroize();
    Ok(secure)
}

/// Generates a new random AES-GCM nonce.
pub fn generate_nonce() -> Result<[u8; NONCE_SIZE]> {
    let mut nonce = [0u8; NONCE_SIZE];
    fill_random(&mut nonce)?;
    Ok(nonce)
}

/// Encrypts a plaintext using AES-256-GCM under a fresh random nonce.
///
/// # Returns
///
/// A tuple containing the ciphertext (with the tag appended) and the nonce.
pub fn encrypt(key: &SecureKey, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_SIZE])> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let nonce_bytes = generate_nonce()?;
    let nonce = Nonce::from(nonce_bytes);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| AppError::Encryption("Encryption failed".to_string()))?;

    Ok((ciphertext, nonce_bytes))
}

/// Decrypts a ciphertext using AES-256-GCM.
///
/// A wrong key, a wrong nonce or any tampering surfaces as [`AppError::Integrity`].
pub fn decrypt(key: &SecureKey, ciphertext: &[u8], nonce: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let nonce: [u8; NONCE_SIZE] = nonce
        .try_into()
        .map_err(|_| AppError::Validation("IV must be 12 bytes".to_string()))?;
    if ciphertext.len() < TAG_SIZE {
        return Err(AppError::Integrity);
    }

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    cipher
        .decrypt(&Nonce::from(nonce), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| AppError::Integrity)
}

/// Wraps `child` under `parent`.
pub fn wrap_key(parent: &SecureKey, child: &SecureKey) -> Result<(Vec<u8>, [u8; NONCE_SIZE])> {
    encrypt(parent, child.as_bytes())
}

/// Unwraps a key previously produced by [`wrap_key`].
pub fn unwrap_key(parent: &SecureKey, wrapped: &[u8], nonce: &[u8]) -> Result<SecureKey> {
    let raw = decrypt(parent, wrapped, nonce)?;
    SecureKey::from_slice(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn wrap_then_unwrap_returns_original_key() {
        let parent = generate_key().unwrap();
        let child = generate_key().unwrap();

        let (wrapped, nonce) = wrap_key(&parent, &child).unwrap();
        assert_ne!(wrapped.as_slice(), child.as_bytes());

        let unwrapped = unwrap_key(&parent, &wrapped, &nonce).unwrap();
        assert_eq!(unwrapped.as_bytes(), child.as_bytes());
    }

    #[test]
    fn decrypt_with_other_key_is_integrity_error() {
        let key = generate_key().unwrap();
        let other = generate_key().unwrap();
        let (ciphertext, nonce) = encrypt(&key, b"attack at dawn").unwrap();

        assert!(matches!(decrypt(&other, &ciphertext, &nonce), Err(AppError::Integrity)));
    }

    #[test]
    fn tampered_ciphertext_is_integrity_error() {
        let key = generate_key().unwrap();
        let (mut ciphertext, nonce) = encrypt(&key, b"ledger entry").unwrap();
        ciphertext[0] ^= 0x01;

        assert!(matches!(decrypt(&key, &ciphertext, &nonce), Err(AppError::Integrity)));
    }

    #[test]
    fn truncated_ciphertext_is_integrity_error() {
        let key = generate_key().unwrap();
        assert!(matches!(decrypt(&key, &[0u8; 4], &[0u8; NONCE_SIZE]), Err(AppError::Integrity)));
    }

    #[test]
    fn rejects_wrong_nonce_length() {
        let key = generate_key().unwrap();
        let (ciphertext, _) = encrypt(&key, b"x").unwrap();
        assert!(matches!(decrypt(&key, &ciphertext, &[0u8; 8]), Err(AppError::Validation(_))));
    }

    #[test]
    fn nonces_do_not_repeat() {
        let key = generate_key().unwrap();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let (_, nonce) = encrypt(&key, b"p").unwrap();
            assert!(seen.insert(nonce), "nonce repeated");
        }
    }

    #[test]
    fn debug_does_not_print_key_bytes() {
        let key = SecureKey::new([7u8; KEY_SIZE]);
        assert_eq!(format!("{:?}", key), "SecureKey(..)");
    }
}

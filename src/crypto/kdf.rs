use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::config::MIN_PBKDF2_ITERATIONS;
use crate::crypto::aes::{self, SecureKey, KEY_SIZE};
use crate::error::{AppError, Result};

/// The size of the PBKDF2 salt in bytes.
pub const SALT_SIZE: usize = 16;

/// Generates a random PBKDF2 salt.
pub fn generate_salt() -> Result<[u8; SALT_SIZE]> {
    let mut salt = [0u8; SALT_SIZE];
    aes::fill_random(&mut salt)?;
    Ok(salt)
}

/// Derives a 256-bit key from a passphrase with PBKDF2-HMAC-SHA256.
pub fn derive_key(passphrase: &str, salt: &[u8], iterations: u32) -> Result<SecureKey> {
    if iterations < MIN_PBKDF2_ITERATIONS {
        return Err(AppError::KeyGeneration(format!(
            "PBKDF2 requires at least {} iterations",
            MIN_PBKDF2_ITERATIONS
        )));
    }
    if salt.len() < SALT_SIZE {
        return Err(AppError::KeyGeneration("PBKDF2 salt too short".to_string()));
    }

    let mut out = Zeroizing::new([0u8; KEY_SIZE]);
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, out.as_mut_slice());
    Ok(SecureKey::new(*out))
}

use base64::{Engine as _, engine::general_purpose};
use subtle::ConstantTimeEq;

use crate::crypto::aes;
use crate::error::Result;

/// The size of session and refresh tokens in bytes.
const TOKEN_SIZE: usize = 32;

/// Generates a new random opaque token.
///
/// # Returns
///
/// A URL-safe base64-encoded token.
pub fn generate_token() -> Result<String> {
    let mut token = [0u8; TOKEN_SIZE];
    aes::fill_random(&mut token)?;

    Ok(general_purpose::URL_SAFE_NO_PAD.encode(token))
}

/// Compares two tokens without leaking where they differ.
pub fn tokens_match(presented: &str, stored: &str) -> bool {
    presented.as_bytes().ct_eq(stored.as_bytes()).into()
}

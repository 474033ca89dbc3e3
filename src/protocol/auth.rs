//! Authentication plugins: `mysql_native_password`, `caching_sha2_password`
//! (fast and full auth paths), `sha256_password`, and `mysql_clear_password`.
//!
//! The full-auth path for the two SHA-256 based plugins needs either a
//! TLS channel (cleartext over TLS is fine) or the server's RSA public key to
//! encrypt the password before it goes over the wire in the clear.

use rand::rngs::OsRng;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::error::{Error, Result};

/// `mysql_native_password`: SHA1(password) XOR SHA1(challenge + SHA1(SHA1(password))).
pub fn scramble_native_password(password: &str, challenge: &[u8]) -> [u8; 20] {
    if password.is_empty() {
        return [0u8; 20];
    }

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);

    let mut hasher = Sha1::new();
    hasher.update(challenge);
    hasher.update(stage2);
    let token = hasher.finalize();

    let mut result = [0u8; 20];
    for i in 0..20 {
        result[i] = stage1[i] ^ token[i];
    }
    result
}

/// `caching_sha2_password` / `sha256_password` initial scramble:
/// XOR(SHA256(password), SHA256(SHA256(SHA256(password)), challenge)).
pub fn scramble_sha2_password(password: &str, challenge: &[u8]) -> [u8; 32] {
    if password.is_empty() {
        return [0u8; 32];
    }

    let stage1 = Sha256::digest(password.as_bytes());
    let stage2 = Sha256::digest(stage1);

    let mut hasher = Sha256::new();
    hasher.update(stage2);
    hasher.update(challenge);
    let scramble = hasher.finalize();

    let mut result = [0u8; 32];
    for i in 0..32 {
        result[i] = stage1[i] ^ scramble[i];
    }
    result
}

/// Result of the first round trip of `caching_sha2_password`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachingSha2FastAuthResult {
    /// Cached, no further round trip needed.
    Success,
    /// Caller must perform the full-auth exchange (RSA or cleartext-over-TLS).
    FullAuthRequired,
}

pub fn read_caching_sha2_fast_auth_result(payload: &[u8]) -> Result<CachingSha2FastAuthResult> {
    match payload.first() {
        Some(0x03) => Ok(CachingSha2FastAuthResult::Success),
        Some(0x04) => Ok(CachingSha2FastAuthResult::FullAuthRequired),
        _ => Err(Error::Interface(
            "unexpected caching_sha2_password fast-auth result".into(),
        )),
    }
}

/// XOR the password (with a trailing NUL, per the protocol) against the
/// challenge, repeating the challenge as needed. Used to build the payload
/// encrypted with the server's RSA public key.
fn xor_password_with_challenge(password: &str, challenge: &[u8]) -> Vec<u8> {
    let mut data: Vec<u8> = password.bytes().collect();
    data.push(0);
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= challenge[i % challenge.len()];
    }
    data
}

/// Encrypt the password for the full-auth path of `caching_sha2_password` /
/// `sha256_password`, using the server's RSA public key (PEM, PKCS#8 or
/// PKCS#1 SubjectPublicKeyInfo) and RSA-OAEP with SHA-1.
pub fn encrypt_password_rsa(password: &str, challenge: &[u8], public_key_pem: &str) -> Result<Vec<u8>> {
    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| Error::Interface(format!("invalid RSA public key from server: {e}")))?;

    let xored = xor_password_with_challenge(password, challenge);
    let padding = Oaep::new::<sha1::Sha1>();
    public_key
        .encrypt(&mut OsRng, padding, &xored)
        .map_err(|e| Error::Interface(format!("RSA encryption failed: {e}")))
}

/// `mysql_clear_password`: the password, NUL-terminated, sent as-is. Only
/// safe over a TLS-upgraded connection; callers must check `Opts::tls`
/// before selecting this plugin.
pub fn clear_password_payload(password: &str) -> Vec<u8> {
    let mut data: Vec<u8> = password.bytes().collect();
    data.push(0);
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_password_scrambles_to_empty_response() {
        assert_eq!(scramble_native_password("", b"01234567890123456789"), [0u8; 20]);
        assert_eq!(scramble_sha2_password("", b"01234567890123456789"), [0u8; 32]);
    }

    #[test]
    fn native_password_scramble_is_deterministic() {
        let challenge = b"01234567890123456789";
        let a = scramble_native_password("hunter2", challenge);
        let b = scramble_native_password("hunter2", challenge);
        assert_eq!(a, b);
        assert_ne!(a, [0u8; 20]);
    }

    #[test]
    fn clear_password_is_nul_terminated() {
        let payload = clear_password_payload("hunter2");
        assert_eq!(payload, b"hunter2\0");
    }
}

//! AES-256-GCM primitives with HKDF-SHA256 key derivation.
//!
//! Everything above this module works with [`SecretBytes`] keys and
//! explicit associated data; nonces are always drawn from the OS CSPRNG.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use strongbox_core::SecretBytes;
use zeroize::Zeroize;

use crate::error::{CryptoError, Result};

pub const NONCE_SIZE: usize = 12;
pub const KEY_SIZE: usize = 32;

/// Derive a 256-bit key from `ikm` via HKDF-SHA256.
pub fn derive_key(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<SecretBytes> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; KEY_SIZE];
    if let Err(e) = hk.expand(info, &mut okm) {
        okm.zeroize();
        return Err(CryptoError::EncryptionFailed(format!("key derivation: {e}")));
    }
    Ok(SecretBytes::new(okm))
}

/// Fill a fresh buffer with `n` bytes from the OS CSPRNG.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Generate a new random 256-bit key.
pub fn generate_key() -> SecretBytes {
    SecretBytes::new(random_bytes(KEY_SIZE))
}

fn cipher_for(key: &SecretBytes) -> Result<Aes256Gcm> {
    if key.len() != KEY_SIZE {
        return Err(CryptoError::InvalidInput(format!(
            "key must be {KEY_SIZE} bytes, got {}",
            key.len()
        )));
    }
    Aes256Gcm::new_from_slice(key.expose()).map_err(|e| CryptoError::InvalidInput(e.to_string()))
}

/// Encrypt `plaintext` under `key` with a random nonce.
///
/// Returns `(nonce, ciphertext_with_tag)`.
pub fn seal(key: &SecretBytes, plaintext: &[u8], aad: &[u8]) -> Result<([u8; NONCE_SIZE], Vec<u8>)> {
    let cipher = cipher_for(key)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    Ok((nonce_bytes, ciphertext))
}

/// Decrypt data produced by [`seal`]. Fails on any tag or AAD mismatch.
pub fn open(key: &SecretBytes, nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<SecretBytes> {
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed(format!(
            "nonce must be {NONCE_SIZE} bytes, got {}",
            nonce.len()
        )));
    }
    let cipher = cipher_for(key).map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;

    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map(SecretBytes::new)
        .map_err(|_| CryptoError::DecryptionFailed("authentication failed".to_string()))
}

/// Encrypt and prepend the nonce: `nonce || ciphertext_with_tag`.
pub fn seal_combined(key: &SecretBytes, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let (nonce, ciphertext) = seal(key, plaintext, aad)?;
    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of [`seal_combined`].
pub fn open_combined(key: &SecretBytes, data: &[u8], aad: &[u8]) -> Result<SecretBytes> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed(
            "ciphertext too short".to_string(),
        ));
    }
    let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
    open(key, nonce, ciphertext, aad)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_seal_open() {
        let key = generate_key();
        let (nonce, ct) = seal(&key, b"hello, secret world!", b"aad").unwrap();
        let pt = open(&key, &nonce, &ct, b"aad").unwrap();
        assert_eq!(pt.expose(), b"hello, secret world!");
    }

    #[test]
    fn test_wrong_key_fails() {
        let (nonce, ct) = seal(&generate_key(), b"sensitive data", b"").unwrap();
        assert!(open(&generate_key(), &nonce, &ct, b"").is_err());
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = generate_key();
        let (nonce, ct) = seal(&key, b"bound", b"tenant-a").unwrap();
        assert!(open(&key, &nonce, &ct, b"tenant-b").is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = generate_key();
        let mut data = seal_combined(&key, b"important secret", b"").unwrap();
        data[NONCE_SIZE + 1] ^= 0xff;
        assert!(open_combined(&key, &data, b"").is_err());
    }

    #[test]
    fn test_nonces_differ_between_calls() {
        let key = generate_key();
        let (a, _) = seal(&key, b"same", b"").unwrap();
        let (b, _) = seal(&key, b"same", b"").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_derive_key_is_deterministic_and_domain_separated() {
        let ikm = [7u8; 32];
        let a = derive_key(&ikm, b"acme", b"kek").unwrap();
        let b = derive_key(&ikm, b"acme", b"kek").unwrap();
        let c = derive_key(&ikm, b"globex", b"kek").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_short_input_rejected() {
        let key = generate_key();
        assert!(open_combined(&key, &[0u8; 4], b"").is_err());
        assert!(open(&key, &[0u8; 8], &[0u8; 32], b"").is_err());
    }

    #[test]
    fn test_empty_plaintext_works() {
        let key = generate_key();
        let data = seal_combined(&key, b"", b"").unwrap();
        assert!(open_combined(&key, &data, b"").unwrap().is_empty());
    }
}

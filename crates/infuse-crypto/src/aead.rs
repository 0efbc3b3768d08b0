//! ChaCha20-Poly1305 with caller supplied nonces
//!
//! ```text
//! [N bytes: ciphertext][16 bytes: Poly1305 tag]
//! nonce = 12 bytes built from packet header fields
//! AAD   = packet header bytes that are sent in the clear
//! ```
//!
//! Nonces are never random here: the framing layer guarantees uniqueness
//! through the (device, time, sequence, entropy) tuple.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};

use crate::keys::KeyMaterial;
use crate::{NONCE_SIZE, TAG_SIZE};

/// Encrypt `plaintext`, returning `ciphertext || tag`.
pub fn encrypt(
    key: &KeyMaterial,
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    plaintext: &[u8],
) -> anyhow::Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| anyhow::anyhow!("packet encryption failed: {e}"))
}

/// Decrypt `ciphertext || tag`.
pub fn decrypt(
    key: &KeyMaterial,
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    encrypted: &[u8],
) -> anyhow::Result<Vec<u8>> {
    if encrypted.len() < TAG_SIZE {
        anyhow::bail!(
            "encrypted payload too short: {} bytes (minimum {})",
            encrypted.len(),
            TAG_SIZE
        );
    }
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: encrypted,
                aad,
            },
        )
        .map_err(|_| anyhow::anyhow!("packet decryption failed: wrong key, nonce or header"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_key;
    use proptest::prelude::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = generate_key();
        let nonce = [1u8; NONCE_SIZE];
        let encrypted = encrypt(&key, &nonce, b"header", b"payload").unwrap();
        assert_eq!(encrypted.len(), 7 + TAG_SIZE);
        let decrypted = decrypt(&key, &nonce, b"header", &encrypted).unwrap();
        assert_eq!(decrypted, b"payload");
    }

    #[test]
    fn test_empty_payload() {
        let key = generate_key();
        let nonce = [0u8; NONCE_SIZE];
        let encrypted = encrypt(&key, &nonce, b"", b"").unwrap();
        assert_eq!(encrypted.len(), TAG_SIZE);
        assert!(decrypt(&key, &nonce, b"", &encrypted).unwrap().is_empty());
    }

    #[test]
    fn test_too_short() {
        let key = generate_key();
        assert!(decrypt(&key, &[0u8; NONCE_SIZE], b"", &[0u8; 15]).is_err());
    }

    #[test]
    fn test_wrong_nonce_fails() {
        let key = generate_key();
        let encrypted = encrypt(&key, &[1u8; NONCE_SIZE], b"hdr", b"data").unwrap();
        assert!(decrypt(&key, &[2u8; NONCE_SIZE], b"hdr", &encrypted).is_err());
    }

    proptest! {
        #[test]
        fn tampered_bit_fails(
            msg in proptest::collection::vec(any::<u8>(), 1..=256),
            aad in proptest::collection::vec(any::<u8>(), 1..=16),
            flip in any::<usize>(),
            target in 0u8..3,
        ) {
            let key = generate_key();
            let nonce = [9u8; NONCE_SIZE];
            let mut encrypted = encrypt(&key, &nonce, &aad, &msg).unwrap();
            prop_assert_eq!(&decrypt(&key, &nonce, &aad, &encrypted).unwrap(), &msg);

            let mut aad = aad;
            let mut key_bytes = *key.as_bytes();
            match target {
                0 => { let i = flip % (encrypted.len() * 8); encrypted[i / 8] ^= 1 << (i % 8); }
                1 => { let i = flip % (aad.len() * 8); aad[i / 8] ^= 1 << (i % 8); }
                _ => { let i = flip % (key_bytes.len() * 8); key_bytes[i / 8] ^= 1 << (i % 8); }
            }
            let key = KeyMaterial::from_bytes(key_bytes);
            prop_assert!(decrypt(&key, &nonce, &aad, &encrypted).is_err());
        }
    }
}

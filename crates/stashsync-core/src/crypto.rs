//! Self-encryption cipher using ChaCha20-Poly1305 AEAD
//!
//! Payloads are encrypted "to self": the symmetric key is derived from the
//! owner's own X25519 key pair via a self Diffie-Hellman and HKDF-SHA256, so
//! any device holding the same identity seed derives the same key and can
//! decrypt, and nobody else can.
//!
//! ## Wire Format
//!
//! Binary: `[nonce (12 bytes)] + [ciphertext + auth tag (16 bytes)]`,
//! carried as base64 text on event content.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use crate::error::{StashError, StashResult};

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Domain separation string for the self-encryption key derivation
const HKDF_INFO: &[u8] = b"stashsync-self-encryption-v1";

/// Cipher bound to one owner identity.
///
/// # Example
///
/// ```
/// use stashsync_core::crypto::SelfCrypto;
///
/// let crypto = SelfCrypto::from_seed(&[7u8; 32]);
/// let ciphertext = crypto.encrypt_text("hello").unwrap();
/// assert_eq!(crypto.decrypt_text(&ciphertext).unwrap(), "hello");
/// ```
pub struct SelfCrypto {
    cipher: ChaCha20Poly1305,
}

impl SelfCrypto {
    /// Derive the self-encryption cipher from a 32-byte identity seed.
    ///
    /// The seed feeds an X25519 static secret; the symmetric key is
    /// `HKDF-SHA256(x25519(sk, pk(sk)))` with a fixed info string.
    /// Deterministic: the same seed on another device yields the same key.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let secret = X25519StaticSecret::from(*seed);
        let own_public = X25519PublicKey::from(&secret);
        let shared = secret.diffie_hellman(&own_public);
        let key = derive_key(shared.as_bytes(), HKDF_INFO);
        Self {
            cipher: ChaCha20Poly1305::new(&key.into()),
        }
    }

    /// Encrypt bytes; output is `[nonce] + [ciphertext + tag]`
    pub fn encrypt(&self, plaintext: &[u8]) -> StashResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| StashError::EncryptionUnavailable(format!("cipher failed: {}", e)))?;

        let mut result = nonce_bytes.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt bytes produced by [`encrypt`](Self::encrypt)
    pub fn decrypt(&self, data: &[u8]) -> StashResult<Vec<u8>> {
        if data.len() < NONCE_SIZE {
            return Err(StashError::DecryptionFailed(
                "data too short to contain nonce".to_string(),
            ));
        }
        let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);
        self.cipher
            .decrypt(nonce, &data[NONCE_SIZE..])
            .map_err(|e| StashError::DecryptionFailed(format!("cipher rejected data: {}", e)))
    }

    /// Encrypt a UTF-8 string to base64 text
    pub fn encrypt_text(&self, plaintext: &str) -> StashResult<String> {
        Ok(BASE64.encode(self.encrypt(plaintext.as_bytes())?))
    }

    /// Decrypt base64 text back to a UTF-8 string
    pub fn decrypt_text(&self, ciphertext: &str) -> StashResult<String> {
        let data = BASE64
            .decode(ciphertext)
            .map_err(|e| StashError::DecryptionFailed(format!("bad base64: {}", e)))?;
        let plaintext = self.decrypt(&data)?;
        String::from_utf8(plaintext)
            .map_err(|e| StashError::DecryptionFailed(format!("not utf-8: {}", e)))
    }
}

/// HKDF-SHA256 key derivation with domain separation
fn derive_key(secret: &[u8], info: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, secret);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

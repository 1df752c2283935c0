//! Encryption gateway between structured payloads and event content
//!
//! Converts category payloads to and from marker-tagged ciphertext or
//! plaintext JSON, according to the category's encryption policy. Encryption
//! is always "to self" through the signer's capability.
//!
//! The gateway fails closed: when policy requires encryption and the signer
//! cannot provide it, the operation surfaces
//! [`StashError::EncryptionUnavailable`] and nothing is stored anywhere. A
//! silent fallback to plaintext would be an unnoticed privacy regression.

use std::sync::Arc;

use crate::category::{CategoryPayload, EncryptionPolicy};
use crate::error::{StashError, StashResult};
use crate::signer::Signer;

/// Fixed marker prefix distinguishing ciphertext content from plaintext JSON.
///
/// Absence of the marker means plaintext.
pub const ENCRYPTED_MARKER: &str = "stash1:";

/// Whether a content string carries the ciphertext marker
pub fn is_encrypted(content: &str) -> bool {
    content.starts_with(ENCRYPTED_MARKER)
}

/// Category-aware encryption gateway bound to one signer and policy
pub struct EncryptionGateway {
    signer: Arc<dyn Signer>,
    policy: EncryptionPolicy,
}

impl EncryptionGateway {
    pub fn new(signer: Arc<dyn Signer>, policy: EncryptionPolicy) -> Self {
        Self { signer, policy }
    }

    /// The policy this gateway enforces
    pub fn policy(&self) -> &EncryptionPolicy {
        &self.policy
    }

    /// Whether the signer currently offers the self-encryption capability
    pub fn can_encrypt(&self) -> bool {
        self.signer.can_encrypt()
    }

    /// Encrypt a plaintext string to marker-prefixed ciphertext
    pub async fn encrypt_to_self(&self, plaintext: &str) -> StashResult<String> {
        if !self.signer.can_encrypt() {
            return Err(StashError::EncryptionUnavailable(
                "signer has no encryption capability".to_string(),
            ));
        }
        let ciphertext = self.signer.encrypt(plaintext).await?;
        Ok(format!("{}{}", ENCRYPTED_MARKER, ciphertext))
    }

    /// Decrypt marker-prefixed content back to plaintext.
    ///
    /// Content without the marker passes through unchanged.
    pub async fn decrypt_from_self(&self, content: &str) -> StashResult<String> {
        match content.strip_prefix(ENCRYPTED_MARKER) {
            Some(ciphertext) => self.signer.decrypt(ciphertext).await,
            None => Ok(content.to_string()),
        }
    }

    /// Convert a payload to event content per its category's policy.
    ///
    /// Encrypted categories produce marker-prefixed ciphertext; plaintext
    /// categories produce bare JSON. Required encryption that cannot be
    /// performed fails closed.
    pub async fn encrypt_for_category(&self, payload: &CategoryPayload) -> StashResult<String> {
        let json = payload.to_json()?;
        if self.policy.should_encrypt(payload.category()) {
            self.encrypt_to_self(&json).await
        } else {
            Ok(json)
        }
    }

    /// Convert event content (ciphertext or plaintext) back to a validated
    /// payload.
    ///
    /// Bad ciphertext surfaces as [`StashError::DecryptionFailed`]; a
    /// wrong-shape payload after decryption surfaces as
    /// [`StashError::MalformedRecord`]. Callers on the read path drop and
    /// log failing records rather than re-throwing, except for
    /// [`StashError::Cancelled`].
    pub async fn decrypt_for_category(&self, content: &str) -> StashResult<CategoryPayload> {
        let json = self.decrypt_from_self(content).await?;
        CategoryPayload::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::{Category, EncryptionPolicy};
    use crate::signer::LocalSigner;

    struct NoCryptoSigner(LocalSigner);

    #[async_trait::async_trait]
    impl Signer for NoCryptoSigner {
        fn public_key(&self) -> String {
            self.0.public_key()
        }
        async fn sign_event(
            &self,
            draft: crate::event::EventDraft,
        ) -> StashResult<crate::event::Event> {
            self.0.sign_event(draft).await
        }
        // can_encrypt/encrypt/decrypt keep the capability-absent defaults
    }

    fn payload() -> CategoryPayload {
        CategoryPayload::Pets {
            name: "Fido".to_string(),
            species: None,
            breed: None,
        }
    }

    fn gateway(policy: EncryptionPolicy) -> EncryptionGateway {
        EncryptionGateway::new(Arc::new(LocalSigner::from_seed(&[2u8; 32])), policy)
    }

    #[tokio::test]
    async fn test_category_round_trip_encrypted() {
        let gw = gateway(EncryptionPolicy::encrypt_all());
        let content = gw.encrypt_for_category(&payload()).await.unwrap();
        assert!(is_encrypted(&content));
        let back = gw.decrypt_for_category(&content).await.unwrap();
        assert_eq!(back, payload());
    }

    #[tokio::test]
    async fn test_category_round_trip_plaintext() {
        let gw = gateway(EncryptionPolicy::plaintext_only());
        let content = gw.encrypt_for_category(&payload()).await.unwrap();
        assert!(!is_encrypted(&content));
        assert_eq!(gw.decrypt_for_category(&content).await.unwrap(), payload());
    }

    #[tokio::test]
    async fn test_plaintext_passthrough() {
        let gw = gateway(EncryptionPolicy::encrypt_all());
        let plain = r#"{"category":"notes","name":"n1"}"#;
        assert_eq!(gw.decrypt_from_self(plain).await.unwrap(), plain);
    }

    #[tokio::test]
    async fn test_missing_capability_fails_closed() {
        let signer = NoCryptoSigner(LocalSigner::from_seed(&[2u8; 32]));
        let gw = EncryptionGateway::new(
            Arc::new(signer),
            EncryptionPolicy::encrypting([Category::Pets]),
        );
        let err = gw.encrypt_for_category(&payload()).await.unwrap_err();
        assert!(matches!(err, StashError::EncryptionUnavailable(_)));

        // An unencrypted category still goes through as plaintext.
        let note = CategoryPayload::Notes {
            name: "n".to_string(),
            body: None,
        };
        assert!(gw.encrypt_for_category(&note).await.is_ok());
    }

    #[tokio::test]
    async fn test_bad_ciphertext_is_decryption_failure() {
        let gw = gateway(EncryptionPolicy::encrypt_all());
        let err = gw
            .decrypt_for_category(&format!("{}garbage", ENCRYPTED_MARKER))
            .await
            .unwrap_err();
        assert!(matches!(err, StashError::DecryptionFailed(_)));
    }

    #[tokio::test]
    async fn test_wrong_shape_after_decrypt_is_malformed() {
        let gw = gateway(EncryptionPolicy::encrypt_all());
        let content = gw.encrypt_to_self(r#"{"category":"pets"}"#).await.unwrap();
        let err = gw.decrypt_for_category(&content).await.unwrap_err();
        assert!(matches!(err, StashError::MalformedRecord(_)));
    }

    #[tokio::test]
    async fn test_other_device_same_identity_decrypts() {
        let policy = EncryptionPolicy::encrypt_all;
        let device_a = EncryptionGateway::new(
            Arc::new(LocalSigner::from_seed(&[11u8; 32])),
            policy(),
        );
        let device_b = EncryptionGateway::new(
            Arc::new(LocalSigner::from_seed(&[11u8; 32])),
            policy(),
        );
        let content = device_a.encrypt_for_category(&payload()).await.unwrap();
        assert_eq!(
            device_b.decrypt_for_category(&content).await.unwrap(),
            payload()
        );
    }
}

//! Credential Store (C8): per-(userId, exchange) encrypted API-key storage
//! (spec.md §4.8). Symmetric AES-GCM with a process-level key derived from
//! `ENCRYPTION_KEY` at startup. Decryption is lazy and cached for the
//! client's lifetime; on decryption failure the credentials are treated as
//! absent, never as a crash.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key};
use base64::Engine as _;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::Exchange;
use crate::error::{EngineError, EngineResult};
use crate::exchange::ApiCredentials;
use crate::store::{CredentialRow, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Mainnet,
    Testnet,
}

impl Environment {
    fn as_str(&self) -> &'static str {
        match self {
            Environment::Mainnet => "MAINNET",
            Environment::Testnet => "TESTNET",
        }
    }
}

pub struct CredentialStore {
    store: Store,
    cipher_key: [u8; 32],
    cache: RwLock<HashMap<(Uuid, Exchange), Arc<ApiCredentials>>>,
}

impl CredentialStore {
    pub fn new(store: Store, encryption_key: &str) -> EngineResult<Self> {
        if encryption_key.is_empty() {
            return Err(EngineError::EncryptionKeyMissing);
        }
        let mut hasher = Sha256::new();
        hasher.update(encryption_key.as_bytes());
        let cipher_key: [u8; 32] = hasher.finalize().into();
        Ok(Self {
            store,
            cipher_key,
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub async fn save_credentials(
        &self,
        user_id: Uuid,
        exchange: Exchange,
        api_key: &str,
        api_secret: &str,
        passphrase: Option<&str>,
        environment: Environment,
    ) -> EngineResult<()> {
        let row = CredentialRow {
            user_id,
            exchange,
            encrypted_key: self.encrypt(api_key)?,
            encrypted_secret: self.encrypt(api_secret)?,
            encrypted_passphrase: passphrase.map(|p| self.encrypt(p)).transpose()?,
            is_active: true,
            environment: environment.as_str().to_string(),
        };
        self.store
            .upsert_credential(&row)
            .await
            .map_err(EngineError::Internal)?;
        self.cache.write().remove(&(user_id, exchange));
        Ok(())
    }

    /// Returns `None` both when no credentials are on file and when
    /// decryption fails — both surface to callers as `NO_API_KEY`, never a
    /// crash (spec.md §4.8).
    pub async fn get_credentials(
        &self,
        user_id: Uuid,
        exchange: Exchange,
    ) -> EngineResult<Option<Arc<ApiCredentials>>> {
        if let Some(cached) = self.cache.read().get(&(user_id, exchange)) {
            return Ok(Some(cached.clone()));
        }

        let Some(row) = self
            .store
            .get_credential(user_id, exchange)
            .await
            .map_err(EngineError::Internal)?
        else {
            return Ok(None);
        };

        if !row.is_active {
            return Ok(None);
        }

        let decrypted = (|| -> Option<ApiCredentials> {
            Some(ApiCredentials {
                api_key: self.decrypt(&row.encrypted_key).ok()?,
                api_secret: self.decrypt(&row.encrypted_secret).ok()?,
                passphrase: row
                    .encrypted_passphrase
                    .as_deref()
                    .map(|p| self.decrypt(p))
                    .transpose()
                    .ok()?,
            })
        })();

        match decrypted {
            Some(creds) => {
                let creds = Arc::new(creds);
                self.cache.write().insert((user_id, exchange), creds.clone());
                Ok(Some(creds))
            }
            None => {
                tracing::warn!(
                    user_id = %user_id, exchange = %exchange,
                    "credential decryption failed, treating as no_api_key"
                );
                Ok(None)
            }
        }
    }

    fn encrypt(&self, plaintext: &str) -> EngineResult<String> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.cipher_key));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| EngineError::Internal(anyhow::anyhow!("encryption failed: {e}")))?;
        let mut blob = nonce.to_vec();
        blob.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(blob))
    }

    fn decrypt(&self, encoded: &str) -> EngineResult<String> {
        let blob = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| EngineError::Internal(anyhow::anyhow!("invalid ciphertext encoding: {e}")))?;
        if blob.len() < 12 {
            return Err(EngineError::Internal(anyhow::anyhow!("ciphertext too short")));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(12);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.cipher_key));
        let plaintext = cipher
            .decrypt(nonce_bytes.into(), ciphertext)
            .map_err(|e| EngineError::Internal(anyhow::anyhow!("decryption failed: {e}")))?;
        String::from_utf8(plaintext)
            .map_err(|e| EngineError::Internal(anyhow::anyhow!("decrypted payload not utf8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_credentials_through_encryption() {
        let store = Store::open_in_memory().unwrap();
        let creds = CredentialStore::new(store, "test-encryption-key").unwrap();
        let user_id = Uuid::new_v4();

        creds
            .save_credentials(
                user_id,
                Exchange::Binance,
                "api-key-123",
                "api-secret-456",
                None,
                Environment::Testnet,
            )
            .await
            .unwrap();

        let loaded = creds
            .get_credentials(user_id, Exchange::Binance)
            .await
            .unwrap()
            .expect("credentials present");
        assert_eq!(loaded.api_key, "api-key-123");
        assert_eq!(loaded.api_secret, "api-secret-456");
        assert!(loaded.passphrase.is_none());
    }

    #[tokio::test]
    async fn missing_credentials_return_none_not_error() {
        let store = Store::open_in_memory().unwrap();
        let creds = CredentialStore::new(store, "test-encryption-key").unwrap();
        let result = creds.get_credentials(Uuid::new_v4(), Exchange::Okx).await.unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn empty_encryption_key_is_fatal() {
        let store = Store::open_in_memory().unwrap();
        let result = CredentialStore::new(store, "");
        assert!(matches!(result, Err(EngineError::EncryptionKeyMissing)));
    }

    #[tokio::test]
    async fn corrupted_ciphertext_is_treated_as_absent_not_a_crash() {
        let store = Store::open_in_memory().unwrap();
        let user_id = Uuid::new_v4();
        store
            .upsert_credential(&CredentialRow {
                user_id,
                exchange: Exchange::Gateio,
                encrypted_key: "not-valid-base64-or-ciphertext!!".to_string(),
                encrypted_secret: "also-garbage".to_string(),
                encrypted_passphrase: None,
                is_active: true,
                environment: "MAINNET".to_string(),
            })
            .await
            .unwrap();

        let creds = CredentialStore::new(store, "test-encryption-key").unwrap();
        let result = creds.get_credentials(user_id, Exchange::Gateio).await.unwrap();
        assert!(result.is_none());
    }
}

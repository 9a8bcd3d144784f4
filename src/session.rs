//! Stateless session envelope
//!
//! Anonymous per-client sessions are carried entirely inside an encrypted
//! token: the server keeps no session table. Tokens are AES-256-GCM over a
//! JSON-serialized record, with the key derived per token via
//! PBKDF2-SHA256 from the configured master key. Wire layout (base64):
//! `salt(32) ∥ nonce(12) ∥ auth_tag(16) ∥ ciphertext`, with the salt bound
//! as associated data.

use crate::config::SessionSettings;
use crate::error::{ProxyError, Result};
use aes_gcm::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// PBKDF2 iteration count for key derivation
const PBKDF2_ITERATIONS: u32 = 100_000;

/// Salt size in bytes
const SALT_SIZE: usize = 32;

/// Nonce size for AES-GCM (96 bits)
const NONCE_SIZE: usize = 12;

/// GCM authentication tag size
const TAG_SIZE: usize = 16;

/// AES-256 key size
const KEY_SIZE: usize = 32;

/// The decrypted per-client session record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// User-agent + IP captured at creation; informational only
    pub client_fingerprint: String,
    pub preferences: HashMap<String, String>,
    pub request_count: u64,
    pub last_request_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    fn new(fingerprint: &str, timeout: ChronoDuration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            created_at: now,
            last_accessed_at: now,
            expires_at: now + timeout,
            client_fingerprint: fingerprint.to_string(),
            preferences: HashMap::new(),
            request_count: 0,
            last_request_at: None,
        }
    }
}

/// Encrypts and decrypts session records
pub struct SessionEnvelope {
    master_key: String,
    settings: SessionSettings,
}

impl SessionEnvelope {
    pub fn new(settings: SessionSettings) -> Result<Self> {
        let master_key = if settings.master_key.is_empty() {
            // Dev-mode fallback: ephemeral key, sessions die with the process
            let mut bytes = [0u8; KEY_SIZE];
            OsRng.fill_bytes(&mut bytes);
            BASE64.encode(bytes)
        } else {
            settings.master_key.clone()
        };
        Ok(Self {
            master_key,
            settings,
        })
    }

    fn derive_key(&self, salt: &[u8]) -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        pbkdf2_hmac::<Sha256>(
            self.master_key.as_bytes(),
            salt,
            PBKDF2_ITERATIONS,
            &mut key,
        );
        key
    }

    /// Encrypt a record into a wire token
    pub fn encrypt(&self, record: &SessionRecord) -> Result<String> {
        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let key = self.derive_key(&salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| ProxyError::Crypto(format!("cipher init failed: {e}")))?;

        let plaintext = serde_json::to_vec(record)?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        let sealed = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: &plaintext,
                    aad: &salt,
                },
            )
            .map_err(|e| ProxyError::Crypto(format!("encryption failed: {e}")))?;

        // The AEAD appends the tag; the wire layout carries it up front
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_SIZE);
        let mut token = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + sealed.len());
        token.extend_from_slice(&salt);
        token.extend_from_slice(&nonce_bytes);
        token.extend_from_slice(tag);
        token.extend_from_slice(ciphertext);

        Ok(BASE64.encode(token))
    }

    /// Decrypt a wire token. Any parse, MAC, or format failure maps to
    /// `InvalidSession`; callers treat that as "no session".
    pub fn decrypt(&self, token: &str) -> Result<SessionRecord> {
        let bytes = BASE64
            .decode(token.trim())
            .map_err(|e| ProxyError::InvalidSession(format!("base64: {e}")))?;

        if bytes.len() < SALT_SIZE + NONCE_SIZE + TAG_SIZE {
            return Err(ProxyError::InvalidSession("token too short".to_string()));
        }

        let (salt, rest) = bytes.split_at(SALT_SIZE);
        let (nonce_bytes, rest) = rest.split_at(NONCE_SIZE);
        let (tag, ciphertext) = rest.split_at(TAG_SIZE);

        let key = self.derive_key(salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| ProxyError::Crypto(format!("cipher init failed: {e}")))?;

        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &sealed,
                    aad: salt,
                },
            )
            .map_err(|_| ProxyError::InvalidSession("authentication failed".to_string()))?;

        serde_json::from_slice(&plaintext)
            .map_err(|e| ProxyError::InvalidSession(format!("record parse: {e}")))
    }

    /// Decode the inbound token and refresh it, or mint a new session.
    ///
    /// A valid, unexpired record inside its absolute lifetime gets its
    /// sliding expiry and counters bumped. Anything else (absent, tampered,
    /// expired, too old) starts over with a fresh id. Returns the record and
    /// whether it was newly minted.
    pub fn refresh_or_create(
        &self,
        token: Option<&str>,
        fingerprint: &str,
    ) -> (SessionRecord, bool) {
        let timeout = ChronoDuration::from_std(self.settings.timeout())
            .unwrap_or_else(|_| ChronoDuration::seconds(1800));
        let max_age = ChronoDuration::from_std(self.settings.max_age())
            .unwrap_or_else(|_| ChronoDuration::days(7));
        let now = Utc::now();

        if let Some(token) = token {
            match self.decrypt(token) {
                Ok(mut record)
                    if record.expires_at > now && now - record.created_at <= max_age =>
                {
                    record.last_accessed_at = now;
                    record.expires_at = now + timeout;
                    record.request_count += 1;
                    record.last_request_at = Some(now);
                    return (record, false);
                }
                Ok(record) => {
                    debug!(session_id = %record.id, "session expired, minting replacement");
                }
                Err(e) => {
                    debug!(error = %e, "session token rejected, minting replacement");
                }
            }
        }

        let mut record = SessionRecord::new(fingerprint, timeout);
        record.request_count = 1;
        record.last_request_at = Some(now);
        (record, true)
    }
}

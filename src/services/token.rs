use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{Error, Result};

const NONCE_LEN: usize = 12;

/// Seals student ids into the opaque tokens printed on meal cards.
///
/// Format: `base64(nonce ‖ AES-256-GCM(key, nonce, decimal(student_id)))`.
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self { cipher: Aes256Gcm::new(key.into()) }
    }

    /// Builds a cipher from the configured key.
    ///
    /// # Arguments
    /// * `configured` - 64 hex characters are used as the raw key; any other
    ///   non-empty value is treated as a passphrase and stretched with HKDF-SHA256.
    pub fn from_config_key(configured: &str) -> Result<Self> {
        let configured = configured.trim();
        if configured.is_empty() {
            return Err(Error::Config("token key must not be empty".into()));
        }
        if configured.len() == 64 {
            if let Ok(raw) = hex::decode(configured) {
                let mut key = [0u8; 32];
                key.copy_from_slice(&raw);
                return Ok(Self::new(&key));
            }
        }
        let hk = Hkdf::<Sha256>::new(None, configured.as_bytes());
        let mut key = [0u8; 32];
        hk.expand(b"canteen-student-token", &mut key)
            .map_err(|_| Error::Config("failed to derive token key".into()))?;
        Ok(Self::new(&key))
    }

    pub fn issue(&self, student_id: i64) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), student_id.to_string().as_bytes())
            .map_err(|e| Error::Fatal(format!("token encryption failed: {e}")))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);
        Ok(STANDARD.encode(blob))
    }

    /// Any malformed, tampered or foreign token yields [`Error::BadToken`].
    pub fn decode(&self, token: &str) -> Result<i64> {
        let blob = STANDARD.decode(token.trim()).map_err(|_| Error::BadToken)?;
        if blob.len() <= NONCE_LEN {
            return Err(Error::BadToken);
        }
        let (nonce, sealed) = blob.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| Error::BadToken)?;
        std::str::from_utf8(&plain)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(Error::BadToken)
    }
}

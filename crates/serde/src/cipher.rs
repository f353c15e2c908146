//! Spill encryption.

use std::fmt;
use std::sync::RwLock;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use spillway_common::{Result, SpillwayError};

const NONCE_LEN: usize = 12;

/// Symmetric cipher applied to page payloads after compression.
pub trait SpillCipher: Send + Sync + fmt::Debug {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Forget the key. Every later call fails.
    fn destroy(&self);
}

/// AES-256-GCM with a random key generated per instance.
///
/// Ciphertext layout: `nonce (12 bytes) | ciphertext | tag`. Each call draws
/// a fresh random nonce.
pub struct AesSpillCipher {
    key: RwLock<Option<Aes256Gcm>>,
}

impl AesSpillCipher {
    pub fn new() -> Result<Self> {
        let key: [u8; 32] = rand::random();
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| {
            SpillwayError::Execution(format!("failed to initialize spill cipher: {e}"))
        })?;
        Ok(Self {
            key: RwLock::new(Some(cipher)),
        })
    }

    fn with_key<T>(&self, f: impl FnOnce(&Aes256Gcm) -> Result<T>) -> Result<T> {
        let guard = self
            .key
            .read()
            .map_err(|_| SpillwayError::Execution("spill cipher lock poisoned".to_string()))?;
        match guard.as_ref() {
            Some(key) => f(key),
            None => Err(SpillwayError::Execution(
                "spill cipher has been destroyed".to_string(),
            )),
        }
    }
}

impl SpillCipher for AesSpillCipher {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.with_key(|key| {
            let nonce_bytes: [u8; NONCE_LEN] = rand::random();
            let sealed = key
                .encrypt(Nonce::from_slice(&nonce_bytes), data)
                .map_err(|_| SpillwayError::Execution("spill encryption failed".to_string()))?;
            let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
            out.extend_from_slice(&nonce_bytes);
            out.extend_from_slice(&sealed);
            Ok(out)
        })
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(SpillwayError::Corruption(format!(
                "encrypted payload of {} bytes is shorter than its nonce",
                data.len()
            )));
        }
        let (nonce, sealed) = data.split_at(NONCE_LEN);
        self.with_key(|key| {
            key.decrypt(Nonce::from_slice(nonce), sealed).map_err(|_| {
                SpillwayError::Corruption("encrypted page failed authentication".to_string())
            })
        })
    }

    fn destroy(&self) {
        if let Ok(mut guard) = self.key.write() {
            *guard = None;
        }
    }
}

impl fmt::Debug for AesSpillCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let live = self.key.read().map(|k| k.is_some()).unwrap_or(false);
        f.debug_struct("AesSpillCipher").field("live", &live).finish()
    }
}

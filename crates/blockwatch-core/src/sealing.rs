//! AES-256-GCM sealing of credentials at rest, keyed per subject via HKDF-SHA256.

use crate::error::{BlockwatchError, Result};
use crate::types::Credentials;
use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const KEY_INFO: &[u8] = b"blockwatch-credentials";

/// 256-bit master key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    /// Wraps raw key bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Key from a 32-byte slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| BlockwatchError::Sealing {
            msg: format!("master key must be 32 bytes, got {}", bytes.len()),
        })?;
        Ok(Self(bytes))
    }

    /// A random key.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MasterKey([REDACTED])")
    }
}

/// Credentials encrypted for one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedCredentials {
    /// Random 96-bit nonce.
    pub nonce: [u8; 12],
    /// Ciphertext with the 16-byte tag appended.
    pub ciphertext: Vec<u8>,
}

/// Seals and opens credentials under keys derived from a master key.
#[derive(Debug, Clone)]
pub struct CredentialSealer {
    master: MasterKey,
}

impl CredentialSealer {
    /// Creates a sealer.
    pub fn new(master: MasterKey) -> Self {
        Self { master }
    }

    fn cipher(&self, subject_key: &str) -> Result<Aes256Gcm> {
        let hk = Hkdf::<Sha256>::new(None, &self.master.0);
        let mut okm = Zeroizing::new([0u8; 32]);
        let mut info = Vec::with_capacity(KEY_INFO.len() + subject_key.len());
        info.extend_from_slice(KEY_INFO);
        info.extend_from_slice(subject_key.as_bytes());
        hk.expand(&info, &mut okm[..])
            .map_err(|e| BlockwatchError::Sealing { msg: e.to_string() })?;
        Aes256Gcm::new_from_slice(&okm[..])
            .map_err(|e| BlockwatchError::Sealing { msg: e.to_string() })
    }

    /// Encrypts `credentials` for `subject_key`.
    pub fn seal(&self, subject_key: &str, credentials: &Credentials) -> Result<SealedCredentials> {
        use rand::RngCore;
        let plaintext = Zeroizing::new(serde_json::to_vec(credentials)?);
        let mut nonce = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher(subject_key)?
            .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|e| BlockwatchError::Sealing { msg: e.to_string() })?;
        Ok(SealedCredentials { nonce, ciphertext })
    }

    /// Decrypts credentials sealed for `subject_key`. Fails if they were sealed
    /// for another subject, under another key, or tampered with.
    pub fn open(&self, subject_key: &str, sealed: &SealedCredentials) -> Result<Credentials> {
        let plaintext = self
            .cipher(subject_key)?
            .decrypt(
                aes_gcm::Nonce::from_slice(&sealed.nonce),
                sealed.ciphertext.as_ref(),
            )
            .map_err(|_| BlockwatchError::Sealing {
                msg: String::from("authentication failed"),
            })?;
        let plaintext = Zeroizing::new(plaintext);
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

//! Encryption at rest for API keys.
//!
//! Keys are sealed into a self-describing envelope:
//! - `v1:<base64(salt ‖ nonce ‖ ciphertext)>`: AES-256-GCM with a PBKDF2 key
//! - `fallback:<base64(plaintext)>`: written only when sealing fails, not secret
//!
//! The KDF password is a device fingerprint: a hash of local environment
//! descriptors. This keeps keys out of casual view on disk. It does not stop
//! anyone who can run code as the user, and a change in any descriptor makes
//! existing envelopes unreadable.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::warn;
use zeroize::Zeroizing;

pub const ENVELOPE_V1: &str = "v1:";
pub const FALLBACK_PREFIX: &str = "fallback:";

const KDF_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const MASKED_ENCRYPTED: &str = "••••••••••••••••";

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("unrecognized credential envelope version")]
    UnknownVersion,

    #[error("credential envelope is malformed")]
    Malformed,

    #[error("credential could not be decrypted on this device")]
    Decryption,

    #[error("credential encryption failed: {0}")]
    Encryption(String),
}

/// Source of the environment descriptors hashed into the device fingerprint.
pub trait FingerprintSource: Send + Sync {
    fn descriptors(&self) -> Vec<String>;
}

/// Descriptors gathered from the running host.
pub struct HostFingerprint {
    /// Display metrics such as `"2560x1440@2"`, when the host knows them.
    pub display: Option<String>,
}

impl HostFingerprint {
    pub fn detect() -> Self {
        Self {
            display: std::env::var("DESKCHAT_DISPLAY").ok(),
        }
    }
}

impl FingerprintSource for HostFingerprint {
    fn descriptors(&self) -> Vec<String> {
        let locale = ["LC_ALL", "LC_MESSAGES", "LANG"]
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
            .unwrap_or_else(|| "C".to_string());
        let offset = chrono::Local::now().offset().local_minus_utc() / 60;
        vec![
            format!("deskchat ({}; {})", std::env::consts::OS, std::env::consts::FAMILY),
            locale,
            format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            self.display.clone().unwrap_or_default(),
            offset.to_string(),
        ]
    }
}

/// Fixed descriptors, for hosts that collect them elsewhere and for tests.
pub struct StaticFingerprint(pub Vec<String>);

impl FingerprintSource for StaticFingerprint {
    fn descriptors(&self) -> Vec<String> {
        self.0.clone()
    }
}

/// PBKDF2-HMAC-SHA256 key for AES-256-GCM. Deterministic for a password and salt.
pub fn derive_key(password: &str, salt: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, KDF_ITERATIONS, key.as_mut());
    key
}

/// True when `value` starts with a known envelope prefix.
pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENVELOPE_V1) || value.starts_with(FALLBACK_PREFIX)
}

/// Display form of a key. Never use the result for comparison or storage.
pub fn mask(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    if is_encrypted(value) {
        return MASKED_ENCRYPTED.to_string();
    }
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "•".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}{}", head, "•".repeat(chars.len() - 8), tail)
}

#[derive(Clone)]
pub struct CredentialVault {
    source: Arc<dyn FingerprintSource>,
}

impl CredentialVault {
    pub fn new(source: Arc<dyn FingerprintSource>) -> Self {
        Self { source }
    }

    pub fn for_host() -> Self {
        Self::new(Arc::new(HostFingerprint::detect()))
    }

    /// Hex SHA-256 over the joined environment descriptors.
    pub fn fingerprint(&self) -> String {
        let joined = self.source.descriptors().join("|");
        hex::encode(Sha256::digest(joined.as_bytes()))
    }

    /// Seal `plaintext`. Falls back to an unprotected envelope rather than fail.
    pub fn encrypt(&self, plaintext: &str) -> String {
        match self.seal(plaintext) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "storing credential with insecure fallback encoding");
                format!("{}{}", FALLBACK_PREFIX, STANDARD.encode(plaintext.as_bytes()))
            }
        }
    }

    fn seal(&self, plaintext: &str) -> Result<String, VaultError> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut nonce);

        let key = derive_key(&self.fingerprint(), &salt);
        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|e| VaultError::Encryption(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        let mut payload = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&salt);
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);
        Ok(format!("{}{}", ENVELOPE_V1, STANDARD.encode(payload)))
    }

    pub fn decrypt(&self, envelope: &str) -> Result<String, VaultError> {
        if let Some(encoded) = envelope.strip_prefix(FALLBACK_PREFIX) {
            let bytes = STANDARD.decode(encoded).map_err(|_| VaultError::Malformed)?;
            return String::from_utf8(bytes).map_err(|_| VaultError::Malformed);
        }
        let encoded = envelope
            .strip_prefix(ENVELOPE_V1)
            .ok_or(VaultError::UnknownVersion)?;
        let payload = STANDARD.decode(encoded).map_err(|_| VaultError::Malformed)?;
        // AES-GCM appends a 16-byte tag, so even an empty secret is longer than this.
        if payload.len() <= SALT_LEN + NONCE_LEN {
            return Err(VaultError::Malformed);
        }
        let (salt, rest) = payload.split_at(SALT_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

        let key = derive_key(&self.fingerprint(), salt);
        let cipher =
            Aes256Gcm::new_from_slice(key.as_ref()).map_err(|_| VaultError::Decryption)?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| VaultError::Decryption)?,
        );
        String::from_utf8(plaintext.to_vec()).map_err(|_| VaultError::Malformed)
    }

    /// Decrypt envelopes, pass legacy plaintext through unchanged.
    pub fn reveal(&self, value: &str) -> Result<String, VaultError> {
        if is_encrypted(value) {
            self.decrypt(value)
        } else {
            Ok(value.to_string())
        }
    }
}

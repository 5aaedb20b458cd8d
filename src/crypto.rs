//! Encryption of credential secrets at rest.
//!
//! Secrets are encrypted with AES-256-GCM under a key derived from a passphrase
//! with PBKDF2-HMAC-SHA512 and a fresh random salt per value. Encrypted values
//! are stored as `enc:` followed by `BASE64(salt || iv || tag || ciphertext)`.
//! The prefix is the only discriminator: values without it are plaintext.

use aes_gcm::{
    aead::{consts::U16, generic_array::GenericArray, AeadInPlace, KeyInit},
    aes::Aes256,
    AesGcm,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha512;
use thiserror::Error;

use crate::config::PassphraseConfig;
use crate::storage::ConfigDocument;

/// AES-256-GCM with a 128-bit IV.
type Cipher = AesGcm<Aes256, U16>;

/// Prefix marking an encrypted value.
pub const ENCRYPTED_PREFIX: &str = "enc:";

const SALT_LENGTH: usize = 64;
const IV_LENGTH: usize = 16;
const TAG_LENGTH: usize = 16;
const KEY_LENGTH: usize = 32;
const PBKDF2_ROUNDS: u32 = 2145;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("value is not an encrypted envelope")]
    NotEncrypted,

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("encrypted payload too short ({0} bytes)")]
    TooShort(usize),

    #[error("authentication failed: wrong passphrase or corrupted data")]
    Authentication,

    #[error("encryption failed")]
    Encryption,

    #[error("decrypted value is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Check if a value carries the encrypted-envelope prefix.
pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENCRYPTED_PREFIX)
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_LENGTH] {
    let mut key = [0u8; KEY_LENGTH];
    pbkdf2_hmac::<Sha512>(passphrase.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

/// Encrypt a plaintext value under `passphrase`.
///
/// Values that are already encrypted are returned unchanged.
pub fn encrypt_value(plaintext: &str, passphrase: &str) -> Result<String, CryptoError> {
    if is_encrypted(plaintext) {
        return Ok(plaintext.to_string());
    }

    let mut salt = [0u8; SALT_LENGTH];
    let mut iv = [0u8; IV_LENGTH];
    let mut rng = rand::thread_rng();
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut iv);

    let key = derive_key(passphrase, &salt);
    let cipher = Cipher::new(GenericArray::from_slice(&key));

    let mut buffer = plaintext.as_bytes().to_vec();
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(&iv), b"", &mut buffer)
        .map_err(|_| CryptoError::Encryption)?;

    let mut combined = Vec::with_capacity(SALT_LENGTH + IV_LENGTH + TAG_LENGTH + buffer.len());
    combined.extend_from_slice(&salt);
    combined.extend_from_slice(&iv);
    combined.extend_from_slice(&tag);
    combined.extend_from_slice(&buffer);

    Ok(format!("{}{}", ENCRYPTED_PREFIX, BASE64.encode(&combined)))
}

/// Decrypt an envelope produced by [`encrypt_value`].
pub fn decrypt_envelope(envelope: &str, passphrase: &str) -> Result<String, CryptoError> {
    let payload = envelope
        .strip_prefix(ENCRYPTED_PREFIX)
        .ok_or(CryptoError::NotEncrypted)?;
    let combined = BASE64.decode(payload.trim())?;

    if combined.len() < SALT_LENGTH + IV_LENGTH + TAG_LENGTH {
        return Err(CryptoError::TooShort(combined.len()));
    }

    let (salt, rest) = combined.split_at(SALT_LENGTH);
    let (iv, rest) = rest.split_at(IV_LENGTH);
    let (tag, ciphertext) = rest.split_at(TAG_LENGTH);

    let key = derive_key(passphrase, salt);
    let cipher = Cipher::new(GenericArray::from_slice(&key));

    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(iv),
            b"",
            &mut buffer,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| CryptoError::Authentication)?;

    Ok(String::from_utf8(buffer)?)
}

/// Decrypt a stored value.
///
/// Plaintext passes through unchanged. Returns `None` when the envelope cannot
/// be decrypted; callers keep the stored value as-is in that case.
pub fn decrypt_value(value: &str, passphrase: &str) -> Option<String> {
    if !is_encrypted(value) {
        return Some(value.to_string());
    }
    match decrypt_envelope(value, passphrase) {
        Ok(plaintext) => Some(plaintext),
        Err(e) => {
            tracing::debug!("Failed to decrypt value: {}", e);
            None
        }
    }
}

/// Encrypts and decrypts credential secrets with the process passphrase.
///
/// Decryption falls back to previous passphrases in order, so credentials
/// written before a rotation stay readable and are re-encrypted under the
/// current passphrase on their next save.
#[derive(Debug, Clone)]
pub struct SecretCodec {
    passphrases: PassphraseConfig,
}

impl SecretCodec {
    pub fn new(passphrases: PassphraseConfig) -> Self {
        Self { passphrases }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        encrypt_value(plaintext, &self.passphrases.current)
    }

    pub fn decrypt(&self, value: &str) -> Option<String> {
        self.decrypt_tracked(value).map(|(plaintext, _)| plaintext)
    }

    /// Decrypt and report whether a previous passphrase was needed.
    fn decrypt_tracked(&self, value: &str) -> Option<(String, bool)> {
        if !is_encrypted(value) {
            return Some((value.to_string(), false));
        }
        std::iter::once(&self.passphrases.current)
            .chain(self.passphrases.previous.iter())
            .enumerate()
            .find_map(|(i, passphrase)| {
                decrypt_envelope(value, passphrase)
                    .ok()
                    .map(|plaintext| (plaintext, i > 0))
            })
    }

    /// Encrypt every plaintext credential key in `config`.
    pub fn encrypt_config(&self, config: &mut ConfigDocument) -> Result<(), CryptoError> {
        for credential in config.api_keys.iter_mut() {
            if !is_encrypted(&credential.key) {
                credential.key = self.encrypt(&credential.key)?;
            }
        }
        Ok(())
    }

    /// Decrypt every encrypted credential key in `config`.
    ///
    /// Keys that fail to decrypt are left encrypted.
    pub fn decrypt_config(&self, config: &mut ConfigDocument) -> DecryptReport {
        let mut report = DecryptReport::default();
        for credential in config.api_keys.iter_mut() {
            if !is_encrypted(&credential.key) {
                report.plaintext += 1;
                continue;
            }
            match self.decrypt_tracked(&credential.key) {
                Some((plaintext, rotated)) => {
                    credential.key = plaintext;
                    report.decrypted += 1;
                    if rotated {
                        report.rotated += 1;
                    }
                }
                None => {
                    tracing::warn!(
                        "Could not decrypt key for credential {}; keeping stored value",
                        credential.id
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }
}

/// Outcome of decrypting a configuration document.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecryptReport {
    /// Keys that were stored without encryption.
    pub plaintext: usize,
    pub decrypted: usize,
    /// Decrypted keys that needed a previous passphrase.
    pub rotated: usize,
    pub failed: usize,
}

impl DecryptReport {
    /// Whether the stored document should be rewritten under the current passphrase.
    pub fn needs_reseal(&self) -> bool {
        self.plaintext > 0 || self.rotated > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PassphraseSource;
    use crate::storage::Credential;

    fn codec(current: &str, previous: &[&str]) -> SecretCodec {
        SecretCodec::new(PassphraseConfig {
            current: current.to_string(),
            previous: previous.iter().map(|p| p.to_string()).collect(),
            source: PassphraseSource::Explicit,
        })
    }

    #[test]
    fn test_is_encrypted() {
        assert!(is_encrypted("enc:abc123"));
        assert!(!is_encrypted("fk-plaintext"));
        assert!(!is_encrypted(" enc:leading-space"));
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let plaintext = "fk-abc123def456ghi789";

        let encrypted = encrypt_value(plaintext, "passphrase").unwrap();
        assert!(is_encrypted(&encrypted));
        assert_ne!(encrypted, plaintext);

        let decrypted = decrypt_value(&encrypted, "passphrase").unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_envelope_layout() {
        let encrypted = encrypt_value("fk-1234", "passphrase").unwrap();
        let raw = BASE64.decode(&encrypted[ENCRYPTED_PREFIX.len()..]).unwrap();
        assert_eq!(raw.len(), SALT_LENGTH + IV_LENGTH + TAG_LENGTH + "fk-1234".len());
    }

    #[test]
    fn test_no_double_encrypt() {
        let encrypted = encrypt_value("secret", "passphrase").unwrap();
        let again = encrypt_value(&encrypted, "passphrase").unwrap();
        assert_eq!(encrypted, again);
    }

    #[test]
    fn test_plaintext_passthrough() {
        assert_eq!(
            decrypt_value("not-encrypted", "passphrase").as_deref(),
            Some("not-encrypted")
        );
    }

    #[test]
    fn test_different_encryptions_differ() {
        let first = encrypt_value("same-data", "passphrase").unwrap();
        let second = encrypt_value("same-data", "passphrase").unwrap();
        assert_ne!(first, second);
        assert_eq!(decrypt_value(&first, "passphrase").unwrap(), "same-data");
        assert_eq!(decrypt_value(&second, "passphrase").unwrap(), "same-data");
    }

    #[test]
    fn test_wrong_passphrase_returns_none() {
        let encrypted = encrypt_value("secret", "right").unwrap();
        assert!(decrypt_value(&encrypted, "wrong").is_none());
        assert!(matches!(
            decrypt_envelope(&encrypted, "wrong"),
            Err(CryptoError::Authentication)
        ));
    }

    #[test]
    fn test_malformed_envelopes_return_none() {
        assert!(decrypt_value("enc:***not-base64***", "p").is_none());
        assert!(decrypt_value("enc:AAAA", "p").is_none());
        assert!(matches!(
            decrypt_envelope("enc:AAAA", "p"),
            Err(CryptoError::TooShort(3))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails_authentication() {
        let encrypted = encrypt_value("fk-secret-value", "p").unwrap();
        let mut raw = BASE64.decode(&encrypted[ENCRYPTED_PREFIX.len()..]).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = format!("{}{}", ENCRYPTED_PREFIX, BASE64.encode(raw));
        assert!(decrypt_value(&tampered, "p").is_none());
    }

    #[test]
    fn test_empty_and_unicode_values() {
        for plaintext in ["", "Hello, 世界! 🎉"] {
            let encrypted = encrypt_value(plaintext, "p").unwrap();
            assert_eq!(decrypt_value(&encrypted, "p").unwrap(), plaintext);
        }
    }

    #[test]
    fn test_codec_falls_back_to_previous_passphrase() {
        let encrypted = encrypt_value("fk-rotated", "old").unwrap();
        let rotated = codec("new", &["older", "old"]);
        assert_eq!(rotated.decrypt(&encrypted).as_deref(), Some("fk-rotated"));
        assert!(codec("new", &[]).decrypt(&encrypted).is_none());
    }

    #[test]
    fn test_config_pass_is_idempotent() {
        let codec = codec("p", &[]);
        let mut config = ConfigDocument::default();
        config.api_keys.push(Credential::new("k1", "fk-abc123"));
        config.api_keys.push(Credential::new("k2", "fk-def456"));

        codec.encrypt_config(&mut config).unwrap();
        let first_pass: Vec<String> = config.api_keys.iter().map(|c| c.key.clone()).collect();
        assert!(first_pass.iter().all(|k| is_encrypted(k)));

        codec.encrypt_config(&mut config).unwrap();
        let second_pass: Vec<String> = config.api_keys.iter().map(|c| c.key.clone()).collect();
        assert_eq!(first_pass, second_pass);

        let report = codec.decrypt_config(&mut config);
        assert_eq!(report.decrypted, 2);
        assert!(!report.needs_reseal());
        assert_eq!(config.api_keys[0].key, "fk-abc123");
        assert_eq!(config.api_keys[1].key, "fk-def456");

        let report = codec.decrypt_config(&mut config);
        assert_eq!(report.plaintext, 2);
        assert_eq!(report.decrypted, 0);
        assert_eq!(config.api_keys[0].key, "fk-abc123");
    }

    #[test]
    fn test_undecryptable_key_is_kept() {
        let foreign = encrypt_value("fk-foreign", "someone-else").unwrap();
        let mut config = ConfigDocument::default();
        config.api_keys.push(Credential::new("k1", &foreign));

        let report = codec("p", &[]).decrypt_config(&mut config);
        assert_eq!(report.failed, 1);
        assert!(!report.needs_reseal());
        assert_eq!(config.api_keys[0].key, foreign);
    }

    #[test]
    fn test_report_flags_rotated_keys() {
        let mut config = ConfigDocument::default();
        config
            .api_keys
            .push(Credential::new("k1", &encrypt_value("fk-old", "old").unwrap()));
        config
            .api_keys
            .push(Credential::new("k2", &encrypt_value("fk-new", "new").unwrap()));

        let report = codec("new", &["old"]).decrypt_config(&mut config);
        assert_eq!(report.decrypted, 2);
        assert_eq!(report.rotated, 1);
        assert!(report.needs_reseal());
        assert_eq!(config.api_keys[0].key, "fk-old");
    }
}

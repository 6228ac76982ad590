//! Symmetric key provisioning backed by the OS secret store.
//!
//! Startup must never fail here: every storage problem degrades to an
//! in-memory key that lives only as long as the process.

use std::{collections::HashMap, fmt, sync::Mutex};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use keyring::Entry;
use log::{info, warn};
use rand::RngCore;
use thiserror::Error;

const KEYRING_SERVICE: &str = "snapnote";
pub const RECORD_KEY_ID: &str = "record-encryption-key";
pub const KEY_LENGTH: usize = 32;

#[derive(Error, Debug)]
pub enum SecretStoreError {
    #[error("no secret stored under {0}")]
    NotFound(String),

    #[error("secret store unavailable: {0}")]
    Unavailable(String),

    #[error("stored secret is malformed")]
    Malformed,
}

/// Where secrets live. The OS keychain in production, a map in tests.
pub trait SecretStorage: Send + Sync {
    fn read(&self, id: &str) -> Result<Vec<u8>, SecretStoreError>;
    fn write(&self, id: &str, secret: &[u8]) -> Result<(), SecretStoreError>;
}

pub struct KeyringStorage {
    service: String,
}

impl KeyringStorage {
    pub fn new() -> Self {
        Self {
            service: KEYRING_SERVICE.to_string(),
        }
    }

    #[cfg(test)]
    fn for_service(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }

    fn entry(&self, id: &str) -> Result<Entry, SecretStoreError> {
        Entry::new(&self.service, id).map_err(|err| SecretStoreError::Unavailable(err.to_string()))
    }
}

impl Default for KeyringStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStorage for KeyringStorage {
    fn read(&self, id: &str) -> Result<Vec<u8>, SecretStoreError> {
        match self.entry(id)?.get_password() {
            Ok(encoded) => STANDARD
                .decode(encoded.trim())
                .map_err(|_| SecretStoreError::Malformed),
            Err(keyring::Error::NoEntry) => Err(SecretStoreError::NotFound(id.to_string())),
            Err(err) => Err(SecretStoreError::Unavailable(err.to_string())),
        }
    }

    fn write(&self, id: &str, secret: &[u8]) -> Result<(), SecretStoreError> {
        self.entry(id)?
            .set_password(&STANDARD.encode(secret))
            .map_err(|err| SecretStoreError::Unavailable(err.to_string()))
    }
}

#[derive(Default)]
pub struct MemorySecretStorage {
    secrets: Mutex<HashMap<String, Vec<u8>>>,
}

impl SecretStorage for MemorySecretStorage {
    fn read(&self, id: &str) -> Result<Vec<u8>, SecretStoreError> {
        let secrets = match self.secrets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        secrets
            .get(id)
            .cloned()
            .ok_or_else(|| SecretStoreError::NotFound(id.to_string()))
    }

    fn write(&self, id: &str, secret: &[u8]) -> Result<(), SecretStoreError> {
        let mut secrets = match self.secrets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        secrets.insert(id.to_string(), secret.to_vec());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// Read back from secure storage.
    Stored,
    /// Generated now and persisted.
    Generated,
    /// Generated now, held in memory only.
    Ephemeral,
}

#[derive(Clone)]
pub struct EncryptionKey {
    bytes: [u8; KEY_LENGTH],
    source: KeySource,
}

impl EncryptionKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.bytes
    }

    pub fn source(&self) -> KeySource {
        self.source
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}

pub struct EncryptionKeyProvider {
    storage: Box<dyn SecretStorage>,
    key_id: String,
}

impl EncryptionKeyProvider {
    pub fn new(storage: Box<dyn SecretStorage>) -> Self {
        Self {
            storage,
            key_id: RECORD_KEY_ID.to_string(),
        }
    }

    pub fn load_or_create(&self) -> EncryptionKey {
        match self.storage.read(&self.key_id) {
            Ok(bytes) => match <[u8; KEY_LENGTH]>::try_from(bytes.as_slice()) {
                Ok(bytes) => EncryptionKey {
                    bytes,
                    source: KeySource::Stored,
                },
                Err(_) => {
                    warn!(
                        "stored key {} has {} bytes, expected {KEY_LENGTH}; using an in-memory key",
                        self.key_id,
                        bytes.len()
                    );
                    ephemeral_key()
                }
            },
            Err(SecretStoreError::NotFound(_)) => {
                let bytes = generate_key();
                match self.storage.write(&self.key_id, &bytes) {
                    Ok(()) => {
                        info!("generated and stored new key {}", self.key_id);
                        EncryptionKey {
                            bytes,
                            source: KeySource::Generated,
                        }
                    }
                    Err(err) => {
                        warn!("could not persist key {}: {err}; keeping it in memory", self.key_id);
                        EncryptionKey {
                            bytes,
                            source: KeySource::Ephemeral,
                        }
                    }
                }
            }
            Err(err) => {
                warn!("could not read key {}: {err}; using an in-memory key", self.key_id);
                ephemeral_key()
            }
        }
    }
}

fn generate_key() -> [u8; KEY_LENGTH] {
    let mut bytes = [0u8; KEY_LENGTH];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

fn ephemeral_key() -> EncryptionKey {
    EncryptionKey {
        bytes: generate_key(),
        source: KeySource::Ephemeral,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct SharedMemory(Arc<MemorySecretStorage>);

    impl SecretStorage for SharedMemory {
        fn read(&self, id: &str) -> Result<Vec<u8>, SecretStoreError> {
            self.0.read(id)
        }
        fn write(&self, id: &str, secret: &[u8]) -> Result<(), SecretStoreError> {
            self.0.write(id, secret)
        }
    }

    struct ReadOnly;

    impl SecretStorage for ReadOnly {
        fn read(&self, id: &str) -> Result<Vec<u8>, SecretStoreError> {
            Err(SecretStoreError::NotFound(id.to_string()))
        }
        fn write(&self, _: &str, _: &[u8]) -> Result<(), SecretStoreError> {
            Err(SecretStoreError::Unavailable("locked".into()))
        }
    }

    struct Broken;

    impl SecretStorage for Broken {
        fn read(&self, _: &str) -> Result<Vec<u8>, SecretStoreError> {
            Err(SecretStoreError::Unavailable("daemon down".into()))
        }
        fn write(&self, _: &str, _: &[u8]) -> Result<(), SecretStoreError> {
            panic!("must not overwrite after a failed read");
        }
    }

    #[test]
    fn first_run_generates_then_later_runs_reuse() {
        let backing = Arc::new(MemorySecretStorage::default());

        let first = EncryptionKeyProvider::new(Box::new(SharedMemory(backing.clone())))
            .load_or_create();
        assert_eq!(first.source(), KeySource::Generated);

        let second = EncryptionKeyProvider::new(Box::new(SharedMemory(backing))).load_or_create();
        assert_eq!(second.source(), KeySource::Stored);
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn failed_persist_keeps_key_in_memory() {
        let key = EncryptionKeyProvider::new(Box::new(ReadOnly)).load_or_create();
        assert_eq!(key.source(), KeySource::Ephemeral);
    }

    #[test]
    fn storage_errors_fall_back_without_writing() {
        let key = EncryptionKeyProvider::new(Box::new(Broken)).load_or_create();
        assert_eq!(key.source(), KeySource::Ephemeral);
    }

    #[test]
    fn wrong_length_key_is_not_trusted() {
        let storage = MemorySecretStorage::default();
        storage.write(RECORD_KEY_ID, &[1, 2, 3]).unwrap();
        let key = EncryptionKeyProvider::new(Box::new(storage)).load_or_create();
        assert_eq!(key.source(), KeySource::Ephemeral);
    }

    const TEST_SERVICE: &str = "snapnote-test";

    fn cleanup_keyring() {
        if let Ok(entry) = Entry::new(TEST_SERVICE, RECORD_KEY_ID) {
            let _ = entry.delete_credential();
        }
    }

    #[test]
    fn keyring_key_survives_a_new_provider() {
        cleanup_keyring();

        let first = EncryptionKeyProvider::new(Box::new(KeyringStorage::for_service(TEST_SERVICE)))
            .load_or_create();
        if first.source() == KeySource::Ephemeral {
            // No reachable platform secret store in this environment.
            cleanup_keyring();
            return;
        }
        assert_eq!(first.source(), KeySource::Generated);

        let second = EncryptionKeyProvider::new(Box::new(KeyringStorage::for_service(TEST_SERVICE)))
            .load_or_create();
        assert_eq!(second.source(), KeySource::Stored);
        assert_eq!(first.as_bytes(), second.as_bytes());

        cleanup_keyring();
    }

    #[test]
    fn generated_keys_differ() {
        assert_ne!(generate_key(), generate_key());
    }

    #[test]
    fn debug_output_hides_key_material() {
        let key = ephemeral_key();
        assert!(format!("{key:?}").contains("<redacted>"));
    }
}

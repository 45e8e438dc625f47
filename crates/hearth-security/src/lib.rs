use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

const ENVELOPE_VERSION: u32 = 1;
const KEY_FILE_MAGIC: [u8; 4] = *b"HKY1";
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;
const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("ciphertext is invalid or has been tampered with")]
    InvalidCiphertext,
    #[error("password rejected: {0}")]
    WeakPassword(&'static str),
    #[error("failed to derive key material: {0}")]
    KeyDerivation(String),
    #[error("failed to read key file {path}: {source}")]
    KeyRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write key file {path}: {source}")]
    KeyWrite {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("key file {path} is malformed")]
    KeyFormat { path: PathBuf },
    #[error("key file {path} is readable by other users (mode {mode:o})")]
    KeyPermissions { path: PathBuf, mode: u32 },
}

/// When to retire the current encryption key: after `max_operations`
/// encrypt calls or once it has been installed for `max_age`, whichever
/// comes first.
#[derive(Debug, Clone)]
pub struct RotationPolicy {
    pub max_operations: u64,
    pub max_age: Duration,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_operations: 1000,
            max_age: Duration::from_secs(86_400),
        }
    }
}

/// Ciphertext produced by [`SecurityManager::encrypt`]. Records the key
/// version so decryption keeps working across rotations within one
/// process lifetime.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    key_version: u32,
    nonce_b64: String,
    ciphertext_b64: String,
}

struct KeyRing {
    keys: BTreeMap<u32, [u8; KEY_LEN]>,
    current: u32,
    installed_at: Instant,
    operations: u64,
}

impl KeyRing {
    fn new(key: [u8; KEY_LEN]) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(1, key);
        Self {
            keys,
            current: 1,
            installed_at: Instant::now(),
            operations: 0,
        }
    }

    fn install(&mut self, key: [u8; KEY_LEN]) -> u32 {
        self.current += 1;
        self.keys.insert(self.current, key);
        self.installed_at = Instant::now();
        self.operations = 0;
        self.current
    }
}

/// Authenticated encryption with automatic key rotation.
///
/// Every key version installed during the process lifetime stays in an
/// in-memory ring so earlier ciphertexts remain decryptable. The key
/// file persists only the current version; after a restart, ciphertexts
/// from superseded versions fail with [`SecurityError::InvalidCiphertext`]
/// rather than decrypting wrongly.
pub struct SecurityManager {
    policy: RotationPolicy,
    ring: Mutex<KeyRing>,
}

impl SecurityManager {
    /// Starts with a random key.
    pub fn new(policy: RotationPolicy) -> Self {
        Self {
            policy,
            ring: Mutex::new(KeyRing::new(random_key())),
        }
    }

    /// Starts with a key derived from `passphrase` and a fresh salt.
    pub fn with_passphrase(
        policy: RotationPolicy,
        passphrase: &str,
    ) -> Result<Self, SecurityError> {
        let key = derive_key(passphrase)?;
        Ok(Self {
            policy,
            ring: Mutex::new(KeyRing::new(key)),
        })
    }

    pub fn current_key_version(&self) -> u32 {
        self.lock_ring().current
    }

    /// Encrypts `plaintext` under the freshest key. The rotation check and
    /// the encryption happen inside one critical section, so concurrent
    /// callers never double-rotate or encrypt under a half-installed key.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, SecurityError> {
        let mut ring = self.lock_ring();
        if ring.operations >= self.policy.max_operations
            || ring.installed_at.elapsed() >= self.policy.max_age
        {
            let version = ring.install(random_key());
            info!(version, "rotated encryption key");
        }
        ring.operations += 1;

        let key_version = ring.current;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&ring.keys[&key_version]));
        let mut nonce = [0_u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| SecurityError::InvalidCiphertext)?;
        drop(ring);

        let envelope = Envelope {
            version: ENVELOPE_VERSION,
            key_version,
            nonce_b64: base64::prelude::BASE64_STANDARD.encode(nonce),
            ciphertext_b64: base64::prelude::BASE64_STANDARD.encode(ciphertext),
        };
        serde_json::to_string(&envelope).map_err(|_| SecurityError::InvalidCiphertext)
    }

    /// Decrypts a token produced by [`encrypt`](Self::encrypt). Any
    /// malformed structure, unknown key version, or failed authentication
    /// comes back as `InvalidCiphertext`; partial plaintext is never
    /// returned.
    pub fn decrypt(&self, token: &str) -> Result<Vec<u8>, SecurityError> {
        let envelope: Envelope =
            serde_json::from_str(token).map_err(|_| SecurityError::InvalidCiphertext)?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(SecurityError::InvalidCiphertext);
        }
        let nonce = base64::prelude::BASE64_STANDARD
            .decode(&envelope.nonce_b64)
            .map_err(|_| SecurityError::InvalidCiphertext)?;
        let ciphertext = base64::prelude::BASE64_STANDARD
            .decode(&envelope.ciphertext_b64)
            .map_err(|_| SecurityError::InvalidCiphertext)?;
        if nonce.len() != NONCE_LEN {
            return Err(SecurityError::InvalidCiphertext);
        }

        let key = {
            let ring = self.lock_ring();
            match ring.keys.get(&envelope.key_version) {
                Some(key) => *key,
                None => return Err(SecurityError::InvalidCiphertext),
            }
        };

        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        cipher
            .decrypt(XNonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| SecurityError::InvalidCiphertext)
    }

    /// Installs a new key immediately: derived from `passphrase` when
    /// given, random otherwise. Returns the new key version.
    pub fn rotate_key(&self, passphrase: Option<&str>) -> Result<u32, SecurityError> {
        let key = match passphrase {
            Some(passphrase) => derive_key(passphrase)?,
            None => random_key(),
        };
        let mut ring = self.lock_ring();
        let version = ring.install(key);
        info!(version, "rotated encryption key");
        Ok(version)
    }

    /// Writes the current key to `path`, owner-readable only.
    pub fn save_key(&self, path: &Path) -> Result<(), SecurityError> {
        let (version, key) = {
            let ring = self.lock_ring();
            (ring.current, ring.keys[&ring.current])
        };

        let mut raw = Vec::with_capacity(KEY_FILE_MAGIC.len() + 4 + KEY_LEN);
        raw.extend_from_slice(&KEY_FILE_MAGIC);
        raw.extend_from_slice(&version.to_be_bytes());
        raw.extend_from_slice(&key);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| SecurityError::KeyWrite {
                path: path.to_path_buf(),
                source,
            })?;
        }
        write_owner_only(path, &raw).map_err(|source| SecurityError::KeyWrite {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Replaces the key ring with the key stored at `path`. Fails closed
    /// when the file is accessible beyond its owner.
    pub fn load_key(&self, path: &Path) -> Result<u32, SecurityError> {
        check_owner_only(path)?;
        let raw = fs::read(path).map_err(|source| SecurityError::KeyRead {
            path: path.to_path_buf(),
            source,
        })?;
        if raw.len() != KEY_FILE_MAGIC.len() + 4 + KEY_LEN || raw[..4] != KEY_FILE_MAGIC {
            return Err(SecurityError::KeyFormat {
                path: path.to_path_buf(),
            });
        }
        let mut version_bytes = [0_u8; 4];
        version_bytes.copy_from_slice(&raw[4..8]);
        let version = u32::from_be_bytes(version_bytes);
        let mut key = [0_u8; KEY_LEN];
        key.copy_from_slice(&raw[8..]);

        let mut ring = self.lock_ring();
        let mut keys = BTreeMap::new();
        keys.insert(version, key);
        *ring = KeyRing {
            keys,
            current: version,
            installed_at: Instant::now(),
            operations: 0,
        };
        Ok(version)
    }

    fn lock_ring(&self) -> std::sync::MutexGuard<'_, KeyRing> {
        self.ring
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Hashes `password` into a PHC string after checking the strength
/// policy: at least 8 characters with a letter, a digit, and a symbol.
pub fn hash_password(password: &str) -> Result<String, SecurityError> {
    check_password_policy(password)?;
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| SecurityError::KeyDerivation(err.to_string()))?;
    Ok(hash.to_string())
}

/// Verifies `candidate` against a PHC hash string. The underlying digest
/// comparison is constant-time; any parse failure reads as a mismatch.
pub fn verify_password(stored_hash: &str, candidate: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(candidate.as_bytes(), &parsed)
        .is_ok()
}

fn check_password_policy(password: &str) -> Result<(), SecurityError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(SecurityError::WeakPassword(
            "must be at least 8 characters",
        ));
    }
    if !password.chars().any(|c| c.is_alphabetic()) {
        return Err(SecurityError::WeakPassword("must contain a letter"));
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(SecurityError::WeakPassword("must contain a digit"));
    }
    if !password
        .chars()
        .any(|c| !c.is_alphanumeric() && !c.is_whitespace())
    {
        return Err(SecurityError::WeakPassword("must contain a symbol"));
    }
    Ok(())
}

fn random_key() -> [u8; KEY_LEN] {
    let mut key = [0_u8; KEY_LEN];
    rand::rng().fill_bytes(&mut key);
    key
}

fn derive_key(passphrase: &str) -> Result<[u8; KEY_LEN], SecurityError> {
    let mut salt = [0_u8; 16];
    rand::rng().fill_bytes(&mut salt);
    let mut key = [0_u8; KEY_LEN];
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), &salt, &mut key)
        .map_err(|err| SecurityError::KeyDerivation(err.to_string()))?;
    Ok(key)
}

#[cfg(unix)]
fn write_owner_only(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_owner_only(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    fs::write(path, contents)
}

#[cfg(unix)]
fn check_owner_only(path: &Path) -> Result<(), SecurityError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(path).map_err(|source| SecurityError::KeyRead {
        path: path.to_path_buf(),
        source,
    })?;
    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(SecurityError::KeyPermissions {
            path: path.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_owner_only(_path: &Path) -> Result<(), SecurityError> {
    Ok(())
}

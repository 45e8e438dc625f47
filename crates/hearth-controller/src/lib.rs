use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use hearth_killswitch::{GlobalKillSwitch, ModuleSwitchboard};
use hearth_router::{Router, RouterError};
use hearth_security::{SecurityError, SecurityManager};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const CREDENTIAL_PREFIX: &str = "credential:";

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("system is globally halted")]
    GloballyHalted,
    #[error("module '{0}' is disabled")]
    ModuleDisabled(String),
    #[error(transparent)]
    Route(#[from] RouterError),
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error("user '{0}' already exists")]
    UserExists(String),
    #[error("no credential named '{name}' stored for user '{user_id}'")]
    UnknownCredential { user_id: String, name: String },
}

/// Coarse classification of a technical failure, used only at the edge
/// where an exhausted retry turns into words for the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Connection,
    Timeout,
    InvalidValue,
    Unknown,
}

impl ErrorClass {
    /// Classifies by the text of the whole error chain.
    pub fn classify(err: &anyhow::Error) -> Self {
        let chain = format!("{err:#}").to_lowercase();
        if chain.contains("connection") || chain.contains("network") {
            Self::Connection
        } else if chain.contains("timeout") || chain.contains("timed out") {
            Self::Timeout
        } else if chain.contains("invalid") || chain.contains("unexpected value") {
            Self::InvalidValue
        } else {
            Self::Unknown
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Connection => {
                "We are experiencing network issues. Please check your internet connection."
            }
            Self::Timeout => "The request timed out. Please try again later.",
            Self::InvalidValue => "An unexpected value was encountered. Please check your input.",
            Self::Unknown => "An unexpected error occurred. Please try again.",
        }
    }
}

/// The error a retried operation collapses into once every attempt has
/// failed. Displays as the user-facing message; the last technical
/// error stays attached as the source.
#[derive(Debug, Error)]
#[error("{}", class.user_message())]
pub struct ExhaustedRetries {
    pub class: ErrorClass,
    #[source]
    pub source: anyhow::Error,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub retries: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
        }
    }
}

/// Runs `operation` until it succeeds or the policy is exhausted,
/// sleeping between attempts with the delay multiplied by the backoff
/// factor each time. This is the one place technical errors become
/// user-facing text.
pub fn retry_with_backoff<T>(
    policy: &RetryPolicy,
    mut operation: impl FnMut() -> anyhow::Result<T>,
) -> Result<T, ExhaustedRetries> {
    let attempts = policy.retries.max(1);
    let mut delay = policy.initial_delay;
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                error!(attempt, %err, "operation failed");
                if attempt >= attempts {
                    return Err(ExhaustedRetries {
                        class: ErrorClass::classify(&err),
                        source: err,
                    });
                }
                debug!(delay_ms = delay.as_millis() as u64, "retrying after delay");
                thread::sleep(delay);
                delay = delay.mul_f64(policy.backoff_factor);
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct UserRecord {
    password_hash: String,
}

/// Front door of the core: gates every input on the kill switches,
/// keeps a context bag per user, stores user credentials, and hands the
/// actual work to the router.
pub struct Controller {
    router: Arc<Router>,
    kill: Arc<GlobalKillSwitch>,
    switches: Arc<ModuleSwitchboard>,
    security: Arc<SecurityManager>,
    contexts: Mutex<HashMap<String, HashMap<String, Value>>>,
    users: Mutex<BTreeMap<String, UserRecord>>,
    users_path: PathBuf,
}

impl Controller {
    pub fn new(
        router: Arc<Router>,
        kill: Arc<GlobalKillSwitch>,
        switches: Arc<ModuleSwitchboard>,
        security: Arc<SecurityManager>,
        users_path: PathBuf,
    ) -> Self {
        let users = load_users(&users_path);
        Self {
            router,
            kill,
            switches,
            security,
            contexts: Mutex::new(HashMap::new()),
            users: Mutex::new(users),
            users_path,
        }
    }

    /// Routes one input for one user. Refuses outright while the system
    /// is halted or the input's module is disabled; otherwise the
    /// user's context bag is created on first contact and the payload
    /// goes to the handler registered under `input_type`.
    pub fn process_input(
        &self,
        user_id: &str,
        input_type: &str,
        payload: Value,
    ) -> Result<Value, ControllerError> {
        if self.kill.is_active() {
            warn!(%user_id, %input_type, "input refused, system is halted");
            return Err(ControllerError::GloballyHalted);
        }
        if self.switches.is_active(input_type) {
            info!(%user_id, %input_type, "input refused, module is disabled");
            return Err(ControllerError::ModuleDisabled(input_type.to_string()));
        }

        self.touch_context(user_id);
        let result = self.router.dispatch(input_type, payload)?;
        debug!(%user_id, %input_type, "input processed");
        Ok(result)
    }

    /// Writes one key of a user's context bag, creating the bag if this
    /// is the user's first contact.
    pub fn update_context(&self, user_id: &str, key: impl Into<String>, value: Value) {
        let mut contexts = self.lock_contexts();
        contexts
            .entry(user_id.to_string())
            .or_default()
            .insert(key.into(), value);
    }

    pub fn get_context(&self, user_id: &str, key: &str) -> Option<Value> {
        self.lock_contexts()
            .get(user_id)
            .and_then(|bag| bag.get(key))
            .cloned()
    }

    /// Encrypts `value` and parks the ciphertext in the user's context
    /// bag. Valid for the life of the process key ring.
    pub fn store_credential(
        &self,
        user_id: &str,
        name: &str,
        value: &str,
    ) -> Result<(), ControllerError> {
        let token = self.security.encrypt(value.as_bytes())?;
        self.update_context(
            user_id,
            format!("{CREDENTIAL_PREFIX}{name}"),
            Value::String(token),
        );
        info!(%user_id, credential = %name, "credential stored");
        Ok(())
    }

    /// Decrypts a credential stored with [`store_credential`](Self::store_credential).
    pub fn reveal_credential(&self, user_id: &str, name: &str) -> Result<String, ControllerError> {
        let token = self
            .get_context(user_id, &format!("{CREDENTIAL_PREFIX}{name}"))
            .and_then(|value| value.as_str().map(str::to_string))
            .ok_or_else(|| ControllerError::UnknownCredential {
                user_id: user_id.to_string(),
                name: name.to_string(),
            })?;
        let plaintext = self.security.decrypt(&token)?;
        String::from_utf8(plaintext).map_err(|_| SecurityError::InvalidCiphertext.into())
    }

    /// Registers a user with a policy-checked, hashed password. Only
    /// the hash is ever persisted.
    pub fn register_user(&self, user_id: &str, password: &str) -> Result<(), ControllerError> {
        let mut users = self.lock_users();
        if users.contains_key(user_id) {
            return Err(ControllerError::UserExists(user_id.to_string()));
        }
        let password_hash = hearth_security::hash_password(password)?;
        users.insert(user_id.to_string(), UserRecord { password_hash });
        self.save_users(&users);
        info!(%user_id, "user registered");
        Ok(())
    }

    /// Unknown users and wrong passwords both read as `false`.
    pub fn authenticate_user(&self, user_id: &str, password: &str) -> bool {
        let users = self.lock_users();
        match users.get(user_id) {
            Some(record) => hearth_security::verify_password(&record.password_hash, password),
            None => false,
        }
    }

    /// Removes a user record. Idempotent; returns whether one existed.
    pub fn remove_user(&self, user_id: &str) -> bool {
        let mut users = self.lock_users();
        let removed = users.remove(user_id).is_some();
        if removed {
            self.save_users(&users);
            info!(%user_id, "user removed");
        }
        removed
    }

    pub fn user_ids(&self) -> Vec<String> {
        self.lock_users().keys().cloned().collect()
    }

    fn touch_context(&self, user_id: &str) {
        self.lock_contexts().entry(user_id.to_string()).or_default();
    }

    fn lock_contexts(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<String, Value>>> {
        self.contexts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_users(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, UserRecord>> {
        self.users
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn save_users(&self, users: &BTreeMap<String, UserRecord>) {
        if let Err(err) = write_users(&self.users_path, users) {
            error!(path = %self.users_path.display(), %err, "failed to persist user records");
        }
    }
}

fn load_users(path: &Path) -> BTreeMap<String, UserRecord> {
    match fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(users) => users,
            Err(err) => {
                error!(path = %path.display(), %err, "corrupt user file, starting empty");
                BTreeMap::new()
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
        Err(err) => {
            error!(path = %path.display(), %err, "failed to read user file, starting empty");
            BTreeMap::new()
        }
    }
}

fn write_users(path: &Path, users: &BTreeMap<String, UserRecord>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let raw = serde_json::to_string_pretty(users)?;
    fs::write(path, raw)
}

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info, warn};

const TOKEN_ACTIVE: &str = "ACTIVE";
const TOKEN_RESET: &str = "RESET";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillSwitchStatus {
    pub active: bool,
    /// Whether a reset credential is configured at all. Without one,
    /// every reset attempt fails closed.
    pub reset_protected: bool,
}

/// System-wide emergency stop.
///
/// The token file is the durable source of truth, read once at startup
/// into an atomic flag that hot paths check on every call. Once active,
/// the only way back is [`reset`](Self::reset) with the right password.
pub struct GlobalKillSwitch {
    path: PathBuf,
    active: AtomicBool,
    reset_hash: Option<String>,
}

impl GlobalKillSwitch {
    /// Loads the persisted state from `path`, creating the token file in
    /// the reset state when missing. `reset_hash` is the externally
    /// supplied PHC hash the reset password must verify against; it is
    /// never generated here.
    pub fn open(path: PathBuf, reset_hash: Option<String>) -> Self {
        let active = read_token(&path);
        if reset_hash.is_none() {
            error!(
                "no kill switch reset hash configured; reset will be refused until one is set"
            );
        }
        Self {
            path,
            active: AtomicBool::new(active),
            reset_hash,
        }
    }

    /// O(1) check used on every dispatch and scheduler tick.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Halts the system. Idempotent; `origin` records who pulled the
    /// switch for the audit trail.
    pub fn activate(&self, origin: &str) {
        self.active.store(true, Ordering::SeqCst);
        self.persist(TOKEN_ACTIVE);
        error!(%origin, "GLOBAL KILL SWITCH ACTIVATED, system halting");
    }

    /// Clears the halt if `password` verifies against the configured
    /// hash. Wrong passwords change nothing, no matter how often they
    /// are tried; a missing hash fails closed.
    pub fn reset(&self, password: &str) -> bool {
        let Some(hash) = self.reset_hash.as_deref() else {
            error!("kill switch reset refused: no reset hash configured");
            return false;
        };
        if !hearth_security::verify_password(hash, password) {
            warn!("incorrect password for kill switch reset");
            return false;
        }
        self.active.store(false, Ordering::SeqCst);
        self.persist(TOKEN_RESET);
        info!("global kill switch reset, system may resume");
        true
    }

    pub fn status(&self) -> KillSwitchStatus {
        KillSwitchStatus {
            active: self.is_active(),
            reset_protected: self.reset_hash.is_some(),
        }
    }

    fn persist(&self, token: &str) {
        if let Err(err) = write_token(&self.path, token) {
            error!(path = %self.path.display(), %err, "failed to persist kill switch token");
        }
    }
}

fn read_token(path: &Path) -> bool {
    match fs::read_to_string(path) {
        Ok(raw) => match raw.trim() {
            TOKEN_ACTIVE => {
                warn!(path = %path.display(), "kill switch token marks the system halted");
                true
            }
            TOKEN_RESET => false,
            other => {
                warn!(token = %other, "unrecognized kill switch token, treating as reset");
                false
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            if let Err(err) = write_token(path, TOKEN_RESET) {
                error!(path = %path.display(), %err, "failed to create kill switch token");
            }
            false
        }
        Err(err) => {
            error!(path = %path.display(), %err, "failed to read kill switch token");
            false
        }
    }
}

fn write_token(path: &Path, token: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{token}\n"))
}

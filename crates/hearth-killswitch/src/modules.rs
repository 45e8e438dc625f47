use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{error, info, warn};

/// Per-module stop flags, `true` meaning "this module must refuse to
/// operate". Names nobody ever flipped read as `false`, so new modules
/// run by default.
///
/// The whole map is rewritten to disk on every flip; a failed write is
/// logged and covered by the next successful one.
pub struct ModuleSwitchboard {
    path: PathBuf,
    switches: Mutex<BTreeMap<String, bool>>,
}

impl ModuleSwitchboard {
    /// Loads persisted flags from `path`. A missing file starts empty
    /// and is created; a corrupt file is replaced with defaults.
    pub fn open(path: PathBuf) -> Self {
        let switches = load_state(&path);
        Self {
            path,
            switches: Mutex::new(switches),
        }
    }

    /// Stops `module`. Flipping an already-stopped module is a no-op
    /// beyond the log line. Unknown names are accepted and recorded.
    pub fn activate(&self, module: &str) {
        let mut switches = self.lock();
        if switches.get(module).copied().unwrap_or(false) {
            info!(%module, "module switch already active");
            return;
        }
        switches.insert(module.to_string(), true);
        self.save(&switches);
        warn!(%module, "module stopped by switch");
    }

    /// Lets `module` run again. Idempotent like [`activate`](Self::activate).
    pub fn deactivate(&self, module: &str) {
        let mut switches = self.lock();
        if !switches.get(module).copied().unwrap_or(false) {
            info!(%module, "module switch already inactive");
            return;
        }
        switches.insert(module.to_string(), false);
        self.save(&switches);
        info!(%module, "module resumed by switch");
    }

    /// Whether `module` must refuse to operate. Unknown names are `false`.
    pub fn is_active(&self, module: &str) -> bool {
        self.lock().get(module).copied().unwrap_or(false)
    }

    /// Snapshot of every recorded module flag.
    pub fn states(&self) -> BTreeMap<String, bool> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, bool>> {
        self.switches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn save(&self, switches: &BTreeMap<String, bool>) {
        if let Err(err) = write_state(&self.path, switches) {
            error!(path = %self.path.display(), %err, "failed to persist module switches");
        }
    }
}

fn load_state(path: &Path) -> BTreeMap<String, bool> {
    match fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(switches) => switches,
            Err(err) => {
                error!(path = %path.display(), %err, "corrupt module switch file, starting from defaults");
                let defaults = BTreeMap::new();
                if let Err(err) = write_state(path, &defaults) {
                    error!(path = %path.display(), %err, "failed to rewrite module switch file");
                }
                defaults
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let defaults = BTreeMap::new();
            if let Err(err) = write_state(path, &defaults) {
                error!(path = %path.display(), %err, "failed to create module switch file");
            }
            defaults
        }
        Err(err) => {
            warn!(path = %path.display(), %err, "failed to read module switch file, starting from defaults");
            BTreeMap::new()
        }
    }
}

fn write_state(path: &Path, switches: &BTreeMap<String, bool>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let raw = serde_json::to_string_pretty(switches)?;
    fs::write(path, raw)
}

//! Persisted enable/disable choices.
//!
//! When enabled on the manager, every successful enable or disable is
//! recorded in `<root>/plugin_states.toml` and consulted the next time the
//! plugin loads. Uninstalling a plugin forgets its entry.
//!
//! ```toml
//! [plugins]
//! "acme.tools" = true
//! "acme.legacy" = false
//! ```

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{PluginError, PluginResult};
use crate::plugin::PluginId;

/// File name of the state file under the runtime root.
pub const STATE_FILE_NAME: &str = "plugin_states.toml";

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    plugins: BTreeMap<String, bool>,
}

/// Saved enabled/disabled state per plugin id.
#[derive(Debug)]
pub struct EnablementStore {
    path: PathBuf,
    states: Mutex<BTreeMap<String, bool>>,
}

impl EnablementStore {
    /// Open the store under `root`, starting empty if the file doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::StateFileError`] if the file exists but can't be
    /// read or parsed.
    pub fn open(root: &Path) -> PluginResult<Self> {
        let path = root.join(STATE_FILE_NAME);
        let states = match std::fs::read_to_string(&path) {
            Ok(content) => {
                toml::from_str::<StateFile>(&content)
                    .map_err(|e| state_err(&path, format!("failed to parse: {e}")))?
                    .plugins
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(state_err(&path, format!("failed to read: {e}"))),
        };
        debug!(path = %path.display(), entries = states.len(), "Loaded plugin states");
        Ok(Self {
            path,
            states: Mutex::new(states),
        })
    }

    /// Where the store is persisted.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Saved state of `id`, if any.
    #[must_use]
    pub fn get(&self, id: &PluginId) -> Option<bool> {
        self.lock().get(id.as_str()).copied()
    }

    /// Record `enabled` for `id` and write the file.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::StateFileError`] if the file can't be written.
    pub fn set(&self, id: &PluginId, enabled: bool) -> PluginResult<()> {
        let mut states = self.lock();
        if states.get(id.as_str()) == Some(&enabled) {
            return Ok(());
        }
        states.insert(id.to_string(), enabled);
        self.save(&states)?;
        debug!(plugin_id = %id, enabled, "Saved plugin state");
        Ok(())
    }

    /// Forget `id`. Returns whether it had an entry.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::StateFileError`] if the file can't be written.
    pub fn remove(&self, id: &PluginId) -> PluginResult<bool> {
        let mut states = self.lock();
        if states.remove(id.as_str()).is_none() {
            return Ok(false);
        }
        self.save(&states)?;
        Ok(true)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, bool>> {
        self.states.lock().unwrap_or_else(|poisoned| {
            warn!("Plugin state mutex poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    /// Atomic write: temp file in the same directory, then rename.
    fn save(&self, states: &BTreeMap<String, bool>) -> PluginResult<()> {
        let file = StateFile {
            plugins: states.clone(),
        };
        let body = toml::to_string_pretty(&file)
            .map_err(|e| state_err(&self.path, format!("failed to serialize: {e}")))?;
        let parent = self.path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent)
            .map_err(|e| state_err(&self.path, format!("failed to create directory: {e}")))?;

        let mut tmp = NamedTempFile::new_in(parent)
            .map_err(|e| state_err(&self.path, format!("failed to create temp file: {e}")))?;
        tmp.write_all(body.as_bytes())
            .map_err(|e| state_err(&self.path, format!("failed to write: {e}")))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| state_err(&self.path, format!("failed to sync: {e}")))?;
        tmp.persist(&self.path)
            .map_err(|e| state_err(&self.path, format!("failed to replace: {e}")))?;
        Ok(())
    }
}

fn state_err(path: &Path, message: String) -> PluginError {
    PluginError::StateFileError {
        path: path.to_path_buf(),
        message,
    }
}

//! On-disk package storage.
//!
//! Layout under the runtime root:
//!
//! ```text
//! <root>/plugins/<plugin-id>/package.plx   installed package
//! <root>/plugins/<plugin-id>/data/         the plugin's private directory
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::info;

use crate::plugin::PluginId;

/// File name of an installed package.
pub const PACKAGE_FILE_NAME: &str = "package.plx";

/// File extension of package files.
pub const PACKAGE_EXTENSION: &str = "plx";

/// Return the directory holding every installed plugin.
#[must_use]
pub fn plugins_dir(root: &Path) -> PathBuf {
    root.join("plugins")
}

/// Return the directory of one plugin.
#[must_use]
pub fn plugin_dir(root: &Path, plugin_id: &PluginId) -> PathBuf {
    plugins_dir(root).join(plugin_id.as_str())
}

/// Return the per-plugin data directory path.
///
/// Does **not** create the directory; call [`ensure_plugin_data_dir`] for that.
#[must_use]
pub fn plugin_data_dir(root: &Path, plugin_id: &PluginId) -> PathBuf {
    plugin_dir(root, plugin_id).join("data")
}

/// Return where an installed package lives.
#[must_use]
pub fn installed_package_path(root: &Path, plugin_id: &PluginId) -> PathBuf {
    plugin_dir(root, plugin_id).join(PACKAGE_FILE_NAME)
}

/// Ensure the per-plugin data directory exists, creating it if necessary.
///
/// # Errors
///
/// Returns an I/O error if the directory cannot be created.
pub fn ensure_plugin_data_dir(root: &Path, plugin_id: &PluginId) -> std::io::Result<PathBuf> {
    let dir = plugin_data_dir(root, plugin_id);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Write `bytes` into the plugin's directory as [`PACKAGE_FILE_NAME`].
///
/// `bytes` are the validated package contents, not re-read from the source.
/// They are written to a temporary file next to the destination and renamed
/// into place, so a concurrent reader never sees a partial package.
///
/// # Errors
///
/// Returns an I/O error if writing or renaming fails.
pub fn install_package(root: &Path, plugin_id: &PluginId, bytes: &[u8]) -> std::io::Result<PathBuf> {
    let dir = plugin_dir(root, plugin_id);
    std::fs::create_dir_all(&dir)?;
    let dest = dir.join(PACKAGE_FILE_NAME);

    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(&dest).map_err(|e| e.error)?;

    info!(plugin_id = %plugin_id, path = %dest.display(), "Installed plugin package");
    Ok(dest)
}

/// Delete the plugin's directory, package and data included.
///
/// Returns `false` if there was nothing to delete.
///
/// # Errors
///
/// Returns an I/O error if removal fails.
pub fn remove_plugin_dir(root: &Path, plugin_id: &PluginId) -> std::io::Result<bool> {
    let dir = plugin_dir(root, plugin_id);
    if !dir.exists() {
        return Ok(false);
    }
    std::fs::remove_dir_all(&dir)?;
    info!(plugin_id = %plugin_id, "Removed plugin directory");
    Ok(true)
}

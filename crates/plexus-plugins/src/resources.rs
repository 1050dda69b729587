//! Filesystem access scoped to a plugin's private data directory.
//!
//! Every path a plugin passes in is resolved against its data directory and
//! checked for containment before anything else happens. Containment is
//! checked on the physical path: `..` components are folded lexically, then
//! the deepest existing ancestor is canonicalized so a symlink inside the
//! directory can't point the plugin elsewhere.

use std::ffi::OsString;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::warn;

use crate::error::{PluginError, PluginResult};
use crate::loader::RESOURCES_DIR;
use crate::package::PackageArchive;
use crate::permission::{Permission, PermissionSet};
use crate::plugin::PluginId;

/// A plugin's handle on its private directory and bundled resources.
#[derive(Clone)]
pub struct ResourceAccessor {
    plugin_id: PluginId,
    root: PathBuf,
    permissions: PermissionSet,
    archive: Arc<PackageArchive>,
}

impl fmt::Debug for ResourceAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceAccessor")
            .field("plugin_id", &self.plugin_id)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl ResourceAccessor {
    pub(crate) fn new(
        plugin_id: PluginId,
        data_dir: &Path,
        permissions: PermissionSet,
        archive: Arc<PackageArchive>,
    ) -> Self {
        let root = data_dir
            .canonicalize()
            .unwrap_or_else(|_| data_dir.to_path_buf());
        Self {
            plugin_id,
            root,
            permissions,
            archive,
        }
    }

    /// The plugin's private data directory.
    #[must_use]
    pub fn plugin_dir(&self) -> &Path {
        &self.root
    }

    /// Resolve `requested` to a physical path inside the data directory.
    ///
    /// Relative paths are taken relative to the data directory. Absolute
    /// paths are accepted only if they already point inside it.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::PathTraversalDenied`] if the path escapes.
    pub fn resolve(&self, requested: impl AsRef<Path>) -> PluginResult<PathBuf> {
        let requested = requested.as_ref();
        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.root.join(requested)
        };
        let physical = physical_path(&normalize_lexically(&joined), 0);

        match physical {
            Some(physical) if physical.starts_with(&self.root) => Ok(physical),
            physical => {
                warn!(
                    security_event = true,
                    plugin_id = %self.plugin_id,
                    path = %requested.display(),
                    resolved = ?physical,
                    "Path escapes plugin data directory"
                );
                Err(PluginError::PathTraversalDenied {
                    plugin_id: self.plugin_id.clone(),
                    path: requested.display().to_string(),
                })
            },
        }
    }

    /// Read a file.
    ///
    /// # Errors
    ///
    /// Containment errors, or the underlying I/O error.
    pub fn read(&self, path: impl AsRef<Path>) -> PluginResult<Vec<u8>> {
        let path = self.resolve(path)?;
        Ok(std::fs::read(path)?)
    }

    /// Read a UTF-8 file.
    ///
    /// # Errors
    ///
    /// Containment errors, or the underlying I/O error.
    pub fn read_to_string(&self, path: impl AsRef<Path>) -> PluginResult<String> {
        let path = self.resolve(path)?;
        Ok(std::fs::read_to_string(path)?)
    }

    /// Write a file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Containment errors, [`PluginError::AccessDenied`] without
    /// `filesystem.write`, or the underlying I/O error.
    pub fn write(&self, path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> PluginResult<()> {
        let path = self.resolve(path)?;
        self.require_write(&path)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Create a directory and its parents.
    ///
    /// # Errors
    ///
    /// Containment errors, [`PluginError::AccessDenied`] without
    /// `filesystem.write`, or the underlying I/O error.
    pub fn create_dir_all(&self, path: impl AsRef<Path>) -> PluginResult<()> {
        let path = self.resolve(path)?;
        self.require_write(&path)?;
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    /// Remove a file or a directory tree. The data directory itself can't be
    /// removed.
    ///
    /// # Errors
    ///
    /// Containment errors, [`PluginError::AccessDenied`] without
    /// `filesystem.write`, or the underlying I/O error.
    pub fn remove(&self, path: impl AsRef<Path>) -> PluginResult<()> {
        let path = self.resolve(path)?;
        self.require_write(&path)?;
        if path == self.root {
            return Err(PluginError::access_denied(
                path.display().to_string(),
                "the data directory itself cannot be removed",
            ));
        }
        if std::fs::symlink_metadata(&path)?.is_dir() {
            std::fs::remove_dir_all(path)?;
        } else {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Whether a path exists. Escaping paths are an error, not `false`.
    ///
    /// # Errors
    ///
    /// Containment errors.
    pub fn exists(&self, path: impl AsRef<Path>) -> PluginResult<bool> {
        let path = self.resolve(path)?;
        Ok(path.exists())
    }

    /// Entry names of a directory, sorted.
    ///
    /// # Errors
    ///
    /// Containment errors, or the underlying I/O error.
    pub fn list(&self, path: impl AsRef<Path>) -> PluginResult<Vec<String>> {
        let path = self.resolve(path)?;
        let mut names = Vec::new();
        for entry in std::fs::read_dir(path)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Read `resources/<name>` bundled in the plugin's package.
    ///
    /// # Errors
    ///
    /// [`PluginError::SymbolNotFound`] if the package has no such resource.
    pub fn bundled_resource(&self, name: &str) -> PluginResult<&[u8]> {
        let entry = format!("{RESOURCES_DIR}/{}", name.trim_start_matches('/'));
        self.archive
            .get(&entry)
            .ok_or_else(|| PluginError::SymbolNotFound {
                symbol: entry.clone(),
                attempts: vec![format!("package has no {entry}")],
            })
    }

    fn require_write(&self, path: &Path) -> PluginResult<()> {
        if self.permissions.contains(&Permission::FilesystemWrite) {
            Ok(())
        } else {
            Err(PluginError::access_denied(
                path.display().to_string(),
                format!("{} permission required", Permission::FilesystemWrite),
            ))
        }
    }
}

/// Fold `.` and `..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {},
            Component::ParentDir => {
                out.pop();
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Symlink hops followed through dangling links before giving up.
const MAX_LINK_HOPS: u8 = 16;

/// Canonicalize the deepest existing ancestor of `path` and re-append the
/// components that don't exist yet.
///
/// A dangling symlink is followed by hand, since `canonicalize` fails on it
/// while writes through it still land on its target. `None` means the path
/// can't be resolved and must be treated as escaping.
fn physical_path(path: &Path, hops: u8) -> Option<PathBuf> {
    let mut current = path.to_path_buf();
    let mut missing: Vec<OsString> = Vec::new();
    loop {
        if let Ok(meta) = std::fs::symlink_metadata(&current) {
            let mut resolved = match std::fs::canonicalize(&current) {
                Ok(resolved) => resolved,
                Err(_) if meta.file_type().is_symlink() && hops < MAX_LINK_HOPS => {
                    let target = std::fs::read_link(&current).ok()?;
                    let base = std::fs::canonicalize(current.parent()?).ok()?;
                    physical_path(&normalize_lexically(&base.join(target)), hops.saturating_add(1))?
                },
                Err(_) => return None,
            };
            for component in missing.into_iter().rev() {
                resolved.push(component);
            }
            return Some(resolved);
        }
        match (current.parent(), current.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                current = parent.to_path_buf();
            },
            _ => return Some(path.to_path_buf()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{ArchiveLimits, PackageEncoding};
    use crate::testing::PackageBuilder;

    fn accessor(dir: &Path, perms: &[Permission]) -> ResourceAccessor {
        let bytes = PackageBuilder::new("demo")
            .resource("readme.md", "# demo")
            .build_bytes()
            .unwrap();
        let archive =
            PackageArchive::decode(&bytes, PackageEncoding::CompiledArchive, &ArchiveLimits::default())
                .unwrap();
        ResourceAccessor::new(
            PluginId::from_static("demo"),
            dir,
            perms.iter().copied().collect(),
            Arc::new(archive),
        )
    }

    #[test]
    fn write_and_read_inside_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let res = accessor(dir.path(), &[Permission::FilesystemWrite]);

        res.write("notes/today.txt", "hi").unwrap();
        assert_eq!(res.read_to_string("notes/today.txt").unwrap(), "hi");
        assert!(res.exists("notes").unwrap());
        assert_eq!(res.list("notes").unwrap(), vec!["today.txt"]);
        assert_eq!(res.list(".").unwrap(), vec!["notes"]);

        res.remove("notes").unwrap();
        assert!(!res.exists("notes").unwrap());
    }

    #[test]
    fn parent_traversal_denied_even_with_write() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        let res = accessor(&data, &Permission::ALL);

        let err = res.write("../escape.txt", "x").unwrap_err();
        assert!(matches!(err, PluginError::PathTraversalDenied { .. }));
        assert!(!dir.path().join("escape.txt").exists());
        assert!(res.read("a/../../escape.txt").is_err());
    }

    #[test]
    fn absolute_paths_outside_denied() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let res = accessor(dir.path(), &[Permission::FilesystemWrite]);

        let outside = other.path().join("x.txt");
        assert!(matches!(
            res.write(&outside, "x"),
            Err(PluginError::PathTraversalDenied { .. })
        ));
        let inside = res.plugin_dir().join("y.txt");
        res.write(&inside, "y").unwrap();
        assert_eq!(res.read(&inside).unwrap(), b"y");
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_denied() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(other.path(), dir.path().join("link")).unwrap();
        let res = accessor(dir.path(), &[Permission::FilesystemWrite]);

        assert!(matches!(
            res.write("link/x.txt", "x"),
            Err(PluginError::PathTraversalDenied { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_escape_denied() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let target = other.path().join("planted.txt");
        std::os::unix::fs::symlink(&target, dir.path().join("link")).unwrap();
        let res = accessor(dir.path(), &Permission::ALL);

        assert!(matches!(
            res.write("link", "escaped"),
            Err(PluginError::PathTraversalDenied { .. })
        ));
        assert!(!target.exists());
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_inside_data_dir_is_followed() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("later.txt", dir.path().join("alias")).unwrap();
        let res = accessor(dir.path(), &[Permission::FilesystemWrite]);

        res.write("alias", "inside").unwrap();
        assert_eq!(res.read_to_string("later.txt").unwrap(), "inside");
    }

    #[cfg(unix)]
    #[test]
    fn symlink_loop_denied() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("b", dir.path().join("a")).unwrap();
        std::os::unix::fs::symlink("a", dir.path().join("b")).unwrap();
        let res = accessor(dir.path(), &[Permission::FilesystemWrite]);

        assert!(matches!(
            res.write("a", "x"),
            Err(PluginError::PathTraversalDenied { .. })
        ));
    }

    #[test]
    fn writes_need_filesystem_write() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("seed.txt"), "seed").unwrap();
        let res = accessor(dir.path(), &[Permission::FilesystemRead]);

        assert_eq!(res.read_to_string("seed.txt").unwrap(), "seed");
        assert!(matches!(res.write("x.txt", "x"), Err(PluginError::AccessDenied { .. })));
        assert!(matches!(res.create_dir_all("d"), Err(PluginError::AccessDenied { .. })));
        assert!(matches!(res.remove("seed.txt"), Err(PluginError::AccessDenied { .. })));
    }

    #[test]
    fn containment_checked_before_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let res = accessor(dir.path(), &[]);
        assert!(matches!(
            res.write("../x.txt", "x"),
            Err(PluginError::PathTraversalDenied { .. })
        ));
    }

    #[test]
    fn data_dir_itself_cannot_be_removed() {
        let dir = tempfile::tempdir().unwrap();
        let res = accessor(dir.path(), &[Permission::FilesystemWrite]);
        assert!(res.remove(".").is_err());
        assert!(dir.path().exists());
    }

    #[test]
    fn bundled_resources_come_from_package() {
        let dir = tempfile::tempdir().unwrap();
        let res = accessor(dir.path(), &[]);
        assert_eq!(res.bundled_resource("readme.md").unwrap(), b"# demo");
        assert!(res.bundled_resource("missing").is_err());
    }

    #[test]
    fn lexical_normalization() {
        assert_eq!(
            normalize_lexically(Path::new("/a/b/./c/../d")),
            PathBuf::from("/a/b/d")
        );
        assert_eq!(normalize_lexically(Path::new("/a/../../b")), PathBuf::from("/b"));
    }
}

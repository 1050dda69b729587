//! Package discovery and load ordering.
//!
//! Discovery reads manifests only; no code is loaded and nothing is
//! validated beyond what the parser needs. Packages are found at
//! `<root>/plugins/<id>/package.plx` and as loose `*.plx` files directly in
//! `<root>/plugins/`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{PluginError, PluginResult};
use crate::manifest::RawManifest;
use crate::package::{ArchiveLimits, PackageEncoding};
use crate::parser::parse_package_metadata;
use crate::plugin::PluginId;
use crate::storage::{PACKAGE_EXTENSION, PACKAGE_FILE_NAME, plugins_dir};

/// A package found in storage.
#[derive(Debug, Clone)]
pub struct DiscoveredPackage {
    /// Id from the package manifest.
    pub id: PluginId,
    /// Package file.
    pub path: PathBuf,
    /// Encoding the manifest was read with.
    pub encoding: PackageEncoding,
    /// Unvalidated manifest.
    pub manifest: RawManifest,
    /// Declared dependencies that are well-formed ids.
    pub dependencies: Vec<PluginId>,
}

/// Scan `root` for packages.
///
/// Returns the packages found, sorted by id, and the packages that could not
/// be read. A missing plugins directory is not an error.
///
/// # Errors
///
/// Returns an I/O error only if the plugins directory exists but can't be
/// listed.
pub fn discover_packages(
    root: &Path,
    limits: &ArchiveLimits,
) -> PluginResult<(Vec<DiscoveredPackage>, Vec<(PathBuf, PluginError)>)> {
    let dir = plugins_dir(root);
    if !dir.is_dir() {
        debug!(path = %dir.display(), "No plugins directory, nothing to discover");
        return Ok((Vec::new(), Vec::new()));
    }

    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let path = entry?.path();
        if path.is_dir() {
            let package = path.join(PACKAGE_FILE_NAME);
            if package.is_file() {
                candidates.push(package);
            }
        } else if path.extension().is_some_and(|ext| ext == PACKAGE_EXTENSION) {
            candidates.push(path);
        }
    }
    candidates.sort();

    let mut found: BTreeMap<PluginId, DiscoveredPackage> = BTreeMap::new();
    let mut errors = Vec::new();
    for path in candidates {
        match discover_one(&path, limits) {
            Ok(package) => {
                if let Some(existing) = found.get(&package.id) {
                    let message = format!(
                        "duplicate plugin id {} (already provided by {})",
                        package.id,
                        existing.path.display()
                    );
                    warn!(path = %path.display(), "{message}");
                    errors.push((path, PluginError::ManifestInvalid {
                        path: package.path,
                        message,
                    }));
                } else {
                    found.insert(package.id.clone(), package);
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable package");
                errors.push((path, e));
            },
        }
    }

    debug!(count = found.len(), failed = errors.len(), "Package discovery finished");
    Ok((found.into_values().collect(), errors))
}

fn discover_one(path: &Path, limits: &ArchiveLimits) -> PluginResult<DiscoveredPackage> {
    let (handle, manifest) = parse_package_metadata(path, limits)?;
    let id = PluginId::new(manifest.id.trim())?;
    let dependencies = manifest
        .dependencies
        .iter()
        .filter_map(|d| PluginId::new(d.trim()).ok())
        .collect();
    Ok(DiscoveredPackage {
        id,
        path: handle.path().to_path_buf(),
        encoding: handle.encoding(),
        manifest,
        dependencies,
    })
}

/// Order packages so that each comes after the discovered packages it
/// depends on.
///
/// Ties break by id. Dependencies on packages that weren't discovered are
/// ignored with a warning. Packages caught in a cycle are appended by id
/// after everything else, also with a warning.
#[must_use]
pub fn order_by_dependencies(packages: Vec<DiscoveredPackage>) -> Vec<DiscoveredPackage> {
    let mut by_id: BTreeMap<PluginId, DiscoveredPackage> = packages
        .into_iter()
        .map(|p| (p.id.clone(), p))
        .collect();

    let mut pending: BTreeMap<PluginId, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<PluginId, Vec<PluginId>> = BTreeMap::new();
    for (id, package) in &by_id {
        let mut count = 0usize;
        for dep in &package.dependencies {
            if by_id.contains_key(dep) {
                count = count.saturating_add(1);
                dependents.entry(dep.clone()).or_default().push(id.clone());
            } else {
                warn!(plugin_id = %id, dependency = %dep, "Dependency not discovered");
            }
        }
        pending.insert(id.clone(), count);
    }

    let mut ready: BTreeSet<PluginId> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| id.clone())
        .collect();
    let mut ordered = Vec::with_capacity(by_id.len());

    while let Some(id) = ready.pop_first() {
        pending.remove(&id);
        for dependent in dependents.remove(&id).unwrap_or_default() {
            if let Some(count) = pending.get_mut(&dependent) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    ready.insert(dependent);
                }
            }
        }
        if let Some(package) = by_id.remove(&id) {
            ordered.push(package);
        }
    }

    if !by_id.is_empty() {
        let cyclic: Vec<&str> = by_id.keys().map(PluginId::as_str).collect();
        warn!(plugins = ?cyclic, "Dependency cycle, loading in id order");
        ordered.extend(by_id.into_values());
    }
    ordered
}

//! Package validation.
//!
//! [`PackageValidator::validate`] is the only way to obtain a
//! [`ManifestDescriptor`]. Checks run in order and the first failure wins:
//!
//! 1. The package file exists, is a regular file and is readable.
//! 2. The configured [`IntegrityVerifier`] accepts the package bytes, keyed
//!    by the id the manifest claims.
//! 3. Required manifest fields are non-blank and the id is well-formed.
//! 4. Every requested permission is a known [`Permission`].
//! 5. Every declared extension point is known and every dependency id is
//!    well-formed.
//! 6. The running host version lies within the manifest's bounds.

use std::fmt;
use std::fs::File;
use std::sync::Arc;

use semver::Version;
use tracing::{debug, warn};

use crate::error::{PluginError, PluginResult};
use crate::extension::ExtensionPoint;
use crate::integrity::{IntegrityVerifier, NonEmptyFile};
use crate::manifest::{ManifestDescriptor, RawManifest, ValidatedFields};
use crate::package::PackageHandle;
use crate::permission::Permission;
use crate::plugin::PluginId;

/// Validates parsed packages before any code is loaded.
#[derive(Clone)]
pub struct PackageValidator {
    host_version: Option<Version>,
    verifier: Arc<dyn IntegrityVerifier>,
}

impl fmt::Debug for PackageValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackageValidator")
            .field("host_version", &self.host_version)
            .finish_non_exhaustive()
    }
}

impl Default for PackageValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl PackageValidator {
    /// Validator with the [`NonEmptyFile`] verifier and no host version check.
    #[must_use]
    pub fn new() -> Self {
        Self {
            host_version: None,
            verifier: Arc::new(NonEmptyFile),
        }
    }

    /// Check manifests against the running host version.
    #[must_use]
    pub fn with_host_version(mut self, version: Version) -> Self {
        self.host_version = Some(version);
        self
    }

    /// Replace the integrity verifier.
    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn IntegrityVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// The configured host version, if any.
    #[must_use]
    pub fn host_version(&self) -> Option<&Version> {
        self.host_version.as_ref()
    }

    /// Validate `raw` as read from `handle`, whose contents are `bytes`.
    ///
    /// # Errors
    ///
    /// - [`PluginError::IntegrityError`] / [`PluginError::HashMismatch`] for
    ///   file and checksum failures.
    /// - [`PluginError::ManifestInvalid`] for blank or malformed fields.
    /// - [`PluginError::UnknownPermission`] for an undefined permission.
    /// - [`PluginError::IncompatibleHost`] when the host version is out of range.
    pub fn validate(
        &self,
        handle: &PackageHandle,
        bytes: &[u8],
        raw: RawManifest,
    ) -> PluginResult<ManifestDescriptor> {
        check_package_file(handle)?;
        self.verifier
            .verify(handle, bytes, &PluginId::from_static(raw.id.trim()))?;

        let invalid = |message: String| PluginError::ManifestInvalid {
            path: handle.path().to_path_buf(),
            message,
        };

        let missing: Vec<&str> = [
            ("id", raw.id.as_str()),
            ("name", raw.name.as_str()),
            ("version", raw.version.as_str()),
            ("entry_point", raw.entry_point.as_str()),
            ("min_host_version", raw.min_host_version.as_str()),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(field, _)| field)
        .collect();
        if !missing.is_empty() {
            return Err(invalid(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }

        let id = PluginId::new(raw.id.trim()).map_err(|e| invalid(e.to_string()))?;

        let permissions = Permission::parse_all(&raw.permissions).inspect_err(|e| {
            warn!(plugin_id = %id, error = %e, "Rejected package requesting unknown permission");
        })?;

        let extensions = raw
            .extensions
            .iter()
            .map(|name| name.parse::<ExtensionPoint>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(invalid)?;

        let dependencies = raw
            .dependencies
            .iter()
            .map(|dep| PluginId::new(dep.trim()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| invalid(format!("bad dependency: {e}")))?;
        if dependencies.contains(&id) {
            return Err(invalid(format!("plugin {id} depends on itself")));
        }

        let min = parse_lenient(&raw.min_host_version)
            .map_err(|e| invalid(format!("bad min_host_version: {e}")))?;
        let max = raw
            .max_host_version
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(parse_lenient)
            .transpose()
            .map_err(|e| invalid(format!("bad max_host_version: {e}")))?;

        if let Some(host) = &self.host_version {
            let below = host < &min;
            let above = max.as_ref().is_some_and(|max| host > max);
            if below || above {
                let required = match &max {
                    Some(max) => format!(">={min}, <={max}"),
                    None => format!(">={min}"),
                };
                return Err(PluginError::IncompatibleHost {
                    plugin_id: id,
                    required,
                    host: host.to_string(),
                });
            }
        }

        debug!(
            plugin_id = %id,
            permissions = ?permissions,
            "Package validated"
        );

        Ok(ManifestDescriptor::from_validated(ValidatedFields {
            id,
            raw,
            permissions,
            dependencies,
            extensions,
        }))
    }
}

/// Exists, regular file, readable.
fn check_package_file(handle: &PackageHandle) -> PluginResult<()> {
    let integrity_err = |message: String| PluginError::IntegrityError {
        path: handle.path().to_path_buf(),
        message,
    };
    let metadata = std::fs::metadata(handle.path()).map_err(|e| integrity_err(e.to_string()))?;
    if !metadata.is_file() {
        return Err(integrity_err("not a regular file".into()));
    }
    File::open(handle.path()).map_err(|e| integrity_err(format!("not readable: {e}")))?;
    Ok(())
}

/// Parse a version, padding missing minor/patch components with zeros and
/// tolerating a leading `v` (`2.1` is `2.1.0`).
///
/// # Errors
///
/// Returns the underlying [`semver::Error`] for anything else malformed.
pub fn parse_lenient(version: &str) -> Result<Version, semver::Error> {
    let trimmed = version.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    let core_end = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(core_end);
    let padded = match core.matches('.').count() {
        0 => format!("{core}.0.0{suffix}"),
        1 => format!("{core}.0{suffix}"),
        _ => trimmed.to_string(),
    };
    Version::parse(&padded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::Blake3Verifier;
    use crate::package::PackageEncoding;

    const BYTES: &[u8] = b"package bytes";

    fn package() -> (tempfile::TempDir, PackageHandle) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.plx");
        std::fs::write(&path, BYTES).unwrap();
        (dir, PackageHandle::new(path, PackageEncoding::CompiledArchive))
    }

    fn raw() -> RawManifest {
        RawManifest {
            id: "demo".into(),
            name: "Demo".into(),
            version: "1.0.0".into(),
            entry_point: "demo.Main".into(),
            min_host_version: "1.0".into(),
            ..RawManifest::default()
        }
    }

    #[test]
    fn valid_manifest_produces_descriptor() {
        let (_dir, handle) = package();
        let descriptor = PackageValidator::new()
            .validate(
                &handle,
                BYTES,
                RawManifest {
                    permissions: vec!["filesystem.write".into(), "NETWORK_ACCESS".into()],
                    dependencies: vec!["base".into()],
                    extensions: vec!["ui".into()],
                    ..raw()
                },
            )
            .unwrap();
        assert_eq!(descriptor.id().as_str(), "demo");
        assert!(descriptor.has_permission(Permission::FilesystemWrite));
        assert!(descriptor.has_permission(Permission::NetworkAccess));
        assert_eq!(descriptor.dependencies(), &[PluginId::from_static("base")]);
        assert_eq!(descriptor.extensions(), &[ExtensionPoint::Ui]);
    }

    #[test]
    fn blank_required_fields_are_listed() {
        let (_dir, handle) = package();
        let err = PackageValidator::new()
            .validate(
                &handle,
                BYTES,
                RawManifest {
                    name: "  ".into(),
                    min_host_version: String::new(),
                    ..raw()
                },
            )
            .unwrap_err();
        match err {
            PluginError::ManifestInvalid { message, .. } => {
                assert!(message.contains("name"));
                assert!(message.contains("min_host_version"));
                assert!(!message.contains("entry_point"));
            },
            other => panic!("expected ManifestInvalid, got: {other:?}"),
        }
    }

    #[test]
    fn unknown_permission_is_a_hard_rejection() {
        let (_dir, handle) = package();
        let err = PackageValidator::new()
            .validate(
                &handle,
                BYTES,
                RawManifest {
                    permissions: vec!["filesystem.read".into(), "delete.everything".into()],
                    ..raw()
                },
            )
            .unwrap_err();
        assert!(matches!(err, PluginError::UnknownPermission(ref n) if n == "delete.everything"));
    }

    #[test]
    fn malformed_id_and_dependencies_rejected() {
        let (_dir, handle) = package();
        let validator = PackageValidator::new();
        assert!(matches!(
            validator.validate(&handle, BYTES, RawManifest { id: "../evil".into(), ..raw() }),
            Err(PluginError::ManifestInvalid { .. })
        ));
        assert!(matches!(
            validator.validate(
                &handle,
                BYTES,
                RawManifest { dependencies: vec!["demo".into()], ..raw() }
            ),
            Err(PluginError::ManifestInvalid { .. })
        ));
        assert!(matches!(
            validator.validate(
                &handle,
                BYTES,
                RawManifest { extensions: vec!["toolbar".into()], ..raw() }
            ),
            Err(PluginError::ManifestInvalid { .. })
        ));
    }

    #[test]
    fn directory_and_missing_file_fail_integrity() {
        let (dir, _) = package();
        let validator = PackageValidator::new();
        let as_dir = PackageHandle::new(dir.path().to_path_buf(), PackageEncoding::LegacyArchive);
        assert!(matches!(
            validator.validate(&as_dir, BYTES, raw()),
            Err(PluginError::IntegrityError { .. })
        ));
        let missing = PackageHandle::new(dir.path().join("x"), PackageEncoding::LegacyArchive);
        assert!(matches!(
            validator.validate(&missing, BYTES, raw()),
            Err(PluginError::IntegrityError { .. })
        ));
    }

    #[test]
    fn host_version_bounds() {
        let (_dir, handle) = package();
        let validator = PackageValidator::new().with_host_version(Version::new(2, 3, 0));

        assert!(validator.validate(&handle, BYTES, raw()).is_ok());
        assert!(validator
            .validate(
                &handle,
                BYTES,
                RawManifest { max_host_version: Some("2.3".into()), ..raw() }
            )
            .is_ok());
        assert!(matches!(
            validator.validate(
                &handle,
                BYTES,
                RawManifest { min_host_version: "3".into(), ..raw() }
            ),
            Err(PluginError::IncompatibleHost { .. })
        ));
        assert!(matches!(
            validator.validate(
                &handle,
                BYTES,
                RawManifest { max_host_version: Some("2.2.9".into()), ..raw() }
            ),
            Err(PluginError::IncompatibleHost { .. })
        ));
        assert!(matches!(
            validator.validate(
                &handle,
                BYTES,
                RawManifest { min_host_version: "one".into(), ..raw() }
            ),
            Err(PluginError::ManifestInvalid { .. })
        ));
    }

    #[test]
    fn custom_verifier_runs() {
        let (_dir, handle) = package();
        let validator = PackageValidator::new()
            .with_verifier(Arc::new(Blake3Verifier::new().require_pin(true)));
        assert!(matches!(
            validator.validate(&handle, BYTES, raw()),
            Err(PluginError::IntegrityError { .. })
        ));
    }

    #[test]
    fn digest_covers_parsed_bytes_not_the_file() {
        let (_dir, handle) = package();
        let pinned = blake3::hash(BYTES).to_hex().to_string();
        let validator = PackageValidator::new().with_verifier(Arc::new(
            Blake3Verifier::new().pin(PluginId::from_static("demo"), pinned),
        ));

        // The file on disk still matches the pin; the bytes handed over don't.
        assert!(matches!(
            validator.validate(&handle, b"swapped after parsing", raw()),
            Err(PluginError::HashMismatch { .. })
        ));
        assert!(validator.validate(&handle, BYTES, raw()).is_ok());
    }

    #[test]
    fn integrity_runs_before_manifest_checks() {
        let (_dir, handle) = package();
        let validator = PackageValidator::new()
            .with_verifier(Arc::new(Blake3Verifier::new().require_pin(true)));
        let err = validator
            .validate(
                &handle,
                BYTES,
                RawManifest {
                    permissions: vec!["delete.everything".into()],
                    ..raw()
                },
            )
            .unwrap_err();
        assert!(matches!(err, PluginError::IntegrityError { .. }));
    }

    #[test]
    fn lenient_versions() {
        assert_eq!(parse_lenient("2").unwrap(), Version::new(2, 0, 0));
        assert_eq!(parse_lenient("v2.1").unwrap(), Version::new(2, 1, 0));
        assert_eq!(parse_lenient(" 1.2.3 ").unwrap(), Version::new(1, 2, 3));
        assert_eq!(
            parse_lenient("1.4-beta.1").unwrap(),
            Version::parse("1.4.0-beta.1").unwrap()
        );
        assert!(parse_lenient("latest").is_err());
    }
}

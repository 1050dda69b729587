//! Manifest extraction from package files.
//!
//! Encodings are tried in [`PackageEncoding::PRIORITY`] order and the first one
//! that decodes and carries a parseable manifest wins. Inside an archive the
//! embedded platform metadata is preferred when it names at least an id and
//! an entry point; otherwise `plugin.toml`, then `plugin.json`, is used.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::error::{PluginError, PluginResult};
use crate::manifest::{ManifestSource, RawManifest, split_list};
use crate::package::{ArchiveLimits, DecodeError, PackageArchive, PackageEncoding, PackageHandle};

/// Embedded platform metadata entry.
pub const METADATA_ENTRY: &str = "META-INF/plugin.properties";

/// Structured TOML manifest entry.
pub const TOML_MANIFEST_ENTRY: &str = "plugin.toml";

/// Structured JSON manifest entry.
pub const JSON_MANIFEST_ENTRY: &str = "plugin.json";

/// A package whose manifest has been extracted but not yet validated.
#[derive(Debug, Clone)]
pub struct ParsedPackage {
    /// Package file and the encoding that decoded it.
    pub handle: PackageHandle,
    /// Decoded archive, shared with the plugin's loader once validated.
    pub archive: Arc<PackageArchive>,
    /// Manifest fields as written.
    pub manifest: RawManifest,
    /// The file contents the archive was decoded from. Integrity checks and
    /// installs use these rather than reading the file again.
    pub bytes: Vec<u8>,
}

/// Read `path` and extract its manifest.
///
/// # Errors
///
/// - [`PluginError::PackageUnreadable`] if the file cannot be opened or read.
/// - [`PluginError::IntegrityError`] if the file exceeds the size limit or an
///   archive contains hostile entries.
/// - [`PluginError::ManifestInvalid`] if no encoding yields a manifest.
pub fn parse_package(path: &Path, limits: &ArchiveLimits) -> PluginResult<ParsedPackage> {
    let metadata = std::fs::metadata(path).map_err(|e| PluginError::PackageUnreadable {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    if metadata.len() > limits.max_package_bytes {
        return Err(PluginError::IntegrityError {
            path: path.to_path_buf(),
            message: format!(
                "package too large: {} bytes (limit: {} bytes)",
                metadata.len(),
                limits.max_package_bytes
            ),
        });
    }

    let bytes = std::fs::read(path).map_err(|e| PluginError::PackageUnreadable {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut attempts = Vec::new();
    for encoding in PackageEncoding::PRIORITY {
        let archive = match PackageArchive::decode(&bytes, encoding, limits) {
            Ok(archive) => archive,
            Err(DecodeError::Mismatch(message)) => {
                attempts.push(format!("{encoding}: {message}"));
                continue;
            },
            Err(DecodeError::Unsafe(message)) => {
                return Err(PluginError::IntegrityError {
                    path: path.to_path_buf(),
                    message,
                });
            },
        };

        match extract_manifest(&archive) {
            Ok(manifest) => {
                debug!(
                    path = %path.display(),
                    %encoding,
                    source = %manifest.source,
                    "Extracted plugin manifest"
                );
                return Ok(ParsedPackage {
                    handle: PackageHandle::new(path.to_path_buf(), encoding),
                    archive: Arc::new(archive),
                    manifest,
                    bytes,
                });
            },
            Err(message) => attempts.push(format!("{encoding}: {message}")),
        }
    }

    Err(PluginError::ManifestInvalid {
        path: path.to_path_buf(),
        message: attempts.join("; "),
    })
}

/// Parse only the manifest of `path`, dropping the decoded archive.
///
/// # Errors
///
/// Same as [`parse_package`].
pub fn parse_package_metadata(
    path: &Path,
    limits: &ArchiveLimits,
) -> PluginResult<(PackageHandle, RawManifest)> {
    parse_package(path, limits).map(|parsed| (parsed.handle, parsed.manifest))
}

/// Pull a manifest out of a decoded archive.
fn extract_manifest(archive: &PackageArchive) -> Result<RawManifest, String> {
    let mut problems = Vec::new();

    if let Some(bytes) = archive.get(METADATA_ENTRY) {
        let properties = parse_properties(&String::from_utf8_lossy(bytes));
        match manifest_from_properties(&properties) {
            Some(manifest) => return Ok(manifest),
            None => problems.push(format!(
                "{METADATA_ENTRY} lacks plugin.id or plugin.entry_point"
            )),
        }
    }

    if let Some(bytes) = archive.get(TOML_MANIFEST_ENTRY) {
        let parsed = std::str::from_utf8(bytes)
            .map_err(|e| e.to_string())
            .and_then(|text| toml::from_str::<RawManifest>(text).map_err(|e| e.to_string()));
        match parsed {
            Ok(mut manifest) => {
                manifest.source = ManifestSource::StructuredToml;
                return Ok(manifest);
            },
            Err(e) => problems.push(format!("{TOML_MANIFEST_ENTRY}: {e}")),
        }
    }

    if let Some(bytes) = archive.get(JSON_MANIFEST_ENTRY) {
        match serde_json::from_slice::<RawManifest>(bytes) {
            Ok(mut manifest) => {
                manifest.source = ManifestSource::StructuredJson;
                return Ok(manifest);
            },
            Err(e) => problems.push(format!("{JSON_MANIFEST_ENTRY}: {e}")),
        }
    }

    if problems.is_empty() {
        Err("no manifest found".into())
    } else {
        Err(problems.join(", "))
    }
}

/// Parse `key = value` / `key: value` lines, skipping blanks and `#`/`!`
/// comments. Later keys win.
fn parse_properties(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
        .filter_map(|line| {
            let split = line.find(['=', ':'])?;
            let (key, rest) = line.split_at(split);
            let value = rest.get(1..).unwrap_or_default();
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn manifest_from_properties(properties: &HashMap<String, String>) -> Option<RawManifest> {
    let get = |key: &str| properties.get(key).cloned().unwrap_or_default();
    let id = get("plugin.id");
    let entry_point = get("plugin.entry_point");
    if id.is_empty() || entry_point.is_empty() {
        return None;
    }

    Some(RawManifest {
        id,
        name: get("plugin.name"),
        version: get("plugin.version"),
        description: get("plugin.description"),
        author: get("plugin.author"),
        entry_point,
        min_host_version: get("plugin.min_host_version"),
        max_host_version: properties.get("plugin.max_host_version").cloned(),
        permissions: split_list(&get("plugin.permissions")),
        dependencies: split_list(&get("plugin.dependencies")),
        extensions: split_list(&get("plugin.extensions")),
        source: ManifestSource::EmbeddedMetadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::PackageBuilder;

    const TOML: &str = r#"
        id = "demo"
        name = "Demo"
        version = "1.0.0"
        entry_point = "demo.Main"
        min_host_version = "1.0.0"
    "#;

    #[test]
    fn properties_parsing() {
        let props = parse_properties(
            "# comment\n! also comment\nplugin.id = demo\nplugin.name: Demo Plugin\n\nbroken\nplugin.id=again",
        );
        assert_eq!(props.get("plugin.id").map(String::as_str), Some("again"));
        assert_eq!(
            props.get("plugin.name").map(String::as_str),
            Some("Demo Plugin")
        );
        assert!(!props.contains_key("broken"));
    }

    #[test]
    fn compiled_archive_with_toml_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = PackageBuilder::new("demo").write_to(dir.path()).unwrap();

        let parsed = parse_package(&path, &ArchiveLimits::default()).unwrap();
        assert_eq!(parsed.handle.encoding(), PackageEncoding::CompiledArchive);
        assert_eq!(parsed.manifest.source, ManifestSource::StructuredToml);
        assert_eq!(parsed.manifest.id, "demo");
    }

    #[test]
    fn legacy_archive_is_the_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = PackageBuilder::new("demo")
            .legacy()
            .write_to(dir.path())
            .unwrap();

        let parsed = parse_package(&path, &ArchiveLimits::default()).unwrap();
        assert_eq!(parsed.handle.encoding(), PackageEncoding::LegacyArchive);
        assert_eq!(parsed.manifest.entry_point, "demo.Main");
    }

    #[test]
    fn embedded_metadata_wins_over_structured_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = PackageBuilder::new("demo")
            .embedded_metadata()
            .file(TOML_MANIFEST_ENTRY, TOML.replace("demo", "other"))
            .permission("network.access")
            .write_to(dir.path())
            .unwrap();

        let parsed = parse_package(&path, &ArchiveLimits::default()).unwrap();
        assert_eq!(parsed.manifest.source, ManifestSource::EmbeddedMetadata);
        assert_eq!(parsed.manifest.id, "demo");
        assert_eq!(parsed.manifest.permissions, vec!["network.access"]);
    }

    #[test]
    fn incomplete_metadata_falls_back_to_structured_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = PackageBuilder::empty()
            .file(METADATA_ENTRY, "plugin.name = Nameless\n")
            .file(JSON_MANIFEST_ENTRY, r#"{"id":"demo","entry_point":"demo.Main"}"#)
            .write_to(dir.path())
            .unwrap();

        let parsed = parse_package(&path, &ArchiveLimits::default()).unwrap();
        assert_eq!(parsed.manifest.source, ManifestSource::StructuredJson);
        assert_eq!(parsed.manifest.id, "demo");
    }

    #[test]
    fn missing_file_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let err = parse_package(&dir.path().join("nope.plx"), &ArchiveLimits::default())
            .unwrap_err();
        assert!(matches!(err, PluginError::PackageUnreadable { .. }));
    }

    #[test]
    fn archive_without_manifest_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = PackageBuilder::empty()
            .file("resources/readme.txt", "hello")
            .write_to(dir.path())
            .unwrap();

        let err = parse_package(&path, &ArchiveLimits::default()).unwrap_err();
        match err {
            PluginError::ManifestInvalid { message, .. } => {
                assert!(message.contains("compiled-archive: no manifest found"));
                assert!(message.contains("legacy-archive"));
            },
            other => panic!("expected ManifestInvalid, got: {other:?}"),
        }
    }

    #[test]
    fn non_archive_file_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.plx");
        std::fs::write(&path, b"this is not a package").unwrap();

        let err = parse_package(&path, &ArchiveLimits::default()).unwrap_err();
        assert!(matches!(err, PluginError::ManifestInvalid { .. }));
    }

    #[test]
    fn oversized_package_is_rejected_before_reading() {
        let dir = tempfile::tempdir().unwrap();
        let path = PackageBuilder::new("demo").write_to(dir.path()).unwrap();
        let limits = ArchiveLimits {
            max_package_bytes: 8,
            ..ArchiveLimits::default()
        };
        let err = parse_package(&path, &limits).unwrap_err();
        assert!(matches!(err, PluginError::IntegrityError { .. }));
    }
}

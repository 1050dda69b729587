//! Plugin manifest types.
//!
//! A package carries its manifest either as embedded platform metadata
//! (`META-INF/plugin.properties`) or as a structured file (`plugin.toml` or
//! `plugin.json`). The parser turns whichever it finds into a
//! [`RawManifest`]; only the validator can turn that into a
//! [`ManifestDescriptor`], so every descriptor in the system has passed
//! validation.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::extension::ExtensionPoint;
use crate::permission::{Permission, PermissionSet};
use crate::plugin::PluginId;

/// Where a raw manifest was read from inside the package.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestSource {
    /// `META-INF/plugin.properties`.
    #[default]
    EmbeddedMetadata,
    /// `plugin.toml`.
    StructuredToml,
    /// `plugin.json`.
    StructuredJson,
}

impl fmt::Display for ManifestSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::EmbeddedMetadata => "META-INF/plugin.properties",
            Self::StructuredToml => "plugin.toml",
            Self::StructuredJson => "plugin.json",
        })
    }
}

/// Manifest fields exactly as written in the package.
///
/// Nothing here has been checked yet; missing fields are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RawManifest {
    /// Plugin id.
    #[serde(default)]
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Plugin version.
    #[serde(default)]
    pub version: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Author.
    #[serde(default)]
    pub author: String,
    /// Fully-qualified symbol naming the plugin's implementation.
    #[serde(default)]
    pub entry_point: String,
    /// Oldest compatible host version.
    #[serde(default)]
    pub min_host_version: String,
    /// Newest compatible host version, if bounded.
    #[serde(default)]
    pub max_host_version: Option<String>,
    /// Requested permission names.
    #[serde(default, deserialize_with = "string_list")]
    pub permissions: Vec<String>,
    /// Ids of plugins this one depends on.
    #[serde(default, deserialize_with = "string_list")]
    pub dependencies: Vec<String>,
    /// Declared extension points.
    #[serde(default, deserialize_with = "string_list")]
    pub extensions: Vec<String>,
    /// Which manifest encoding produced these fields.
    #[serde(skip)]
    pub source: ManifestSource,
}

/// Split a comma-separated manifest value, dropping blanks.
pub(crate) fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Accept either an array of strings or one comma-separated string.
fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrCsv {
        List(Vec<String>),
        Csv(String),
    }

    Ok(match ListOrCsv::deserialize(deserializer)? {
        ListOrCsv::List(items) => items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        ListOrCsv::Csv(s) => split_list(&s),
    })
}

/// A validated manifest.
///
/// Invariant: `id`, `name`, `version`, `entry_point` and `min_host_version`
/// are non-blank, and every permission and extension point is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestDescriptor {
    id: PluginId,
    name: String,
    version: String,
    description: String,
    author: String,
    entry_point: String,
    min_host_version: String,
    max_host_version: Option<String>,
    permissions: PermissionSet,
    dependencies: Vec<PluginId>,
    extensions: Vec<ExtensionPoint>,
}

/// Fields handed from the validator to [`ManifestDescriptor::from_validated`].
pub(crate) struct ValidatedFields {
    pub(crate) id: PluginId,
    pub(crate) raw: RawManifest,
    pub(crate) permissions: PermissionSet,
    pub(crate) dependencies: Vec<PluginId>,
    pub(crate) extensions: Vec<ExtensionPoint>,
}

impl ManifestDescriptor {
    pub(crate) fn from_validated(fields: ValidatedFields) -> Self {
        let ValidatedFields {
            id,
            raw,
            permissions,
            dependencies,
            extensions,
        } = fields;
        Self {
            id,
            name: raw.name.trim().to_string(),
            version: raw.version.trim().to_string(),
            description: raw.description.trim().to_string(),
            author: raw.author.trim().to_string(),
            entry_point: raw.entry_point.trim().to_string(),
            min_host_version: raw.min_host_version.trim().to_string(),
            max_host_version: raw
                .max_host_version
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            permissions,
            dependencies,
            extensions,
        }
    }

    /// Unique plugin id.
    #[must_use]
    pub fn id(&self) -> &PluginId {
        &self.id
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Plugin version string.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Description (may be empty).
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Author (may be empty).
    #[must_use]
    pub fn author(&self) -> &str {
        &self.author
    }

    /// Symbol the loader resolves and instantiates.
    #[must_use]
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Oldest compatible host version.
    #[must_use]
    pub fn min_host_version(&self) -> &str {
        &self.min_host_version
    }

    /// Newest compatible host version, if bounded.
    #[must_use]
    pub fn max_host_version(&self) -> Option<&str> {
        self.max_host_version.as_deref()
    }

    /// Granted permissions.
    #[must_use]
    pub fn permissions(&self) -> &PermissionSet {
        &self.permissions
    }

    /// Whether the manifest requested `permission`.
    #[must_use]
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    /// Declared dependencies.
    #[must_use]
    pub fn dependencies(&self) -> &[PluginId] {
        &self.dependencies
    }

    /// Declared extension points.
    #[must_use]
    pub fn extensions(&self) -> &[ExtensionPoint] {
        &self.extensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_accepts_lists_and_csv() {
        let raw: RawManifest = toml::from_str(
            r#"
            id = "demo"
            name = "Demo"
            version = "1.0.0"
            entry_point = "demo.Main"
            min_host_version = "1.0"
            permissions = "filesystem.read, network.access"
            dependencies = ["core-utils", " "]
            "#,
        )
        .unwrap();
        assert_eq!(raw.permissions, vec!["filesystem.read", "network.access"]);
        assert_eq!(raw.dependencies, vec!["core-utils"]);
        assert!(raw.extensions.is_empty());
        assert!(raw.max_host_version.is_none());
    }

    #[test]
    fn json_missing_fields_default_to_empty() {
        let raw: RawManifest = serde_json::from_str(r#"{"id": "demo"}"#).unwrap();
        assert_eq!(raw.id, "demo");
        assert!(raw.name.is_empty());
        assert!(raw.entry_point.is_empty());
    }

    #[test]
    fn split_list_trims_and_drops_blanks() {
        assert_eq!(split_list(" a, b ,,c "), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn descriptor_normalizes_blank_max_version() {
        let raw = RawManifest {
            id: "demo".into(),
            name: " Demo ".into(),
            version: "1.0.0".into(),
            entry_point: "demo.Main".into(),
            min_host_version: "1.0".into(),
            max_host_version: Some("  ".into()),
            ..RawManifest::default()
        };
        let descriptor = ManifestDescriptor::from_validated(ValidatedFields {
            id: PluginId::from_static("demo"),
            raw,
            permissions: PermissionSet::new(),
            dependencies: Vec::new(),
            extensions: Vec::new(),
        });
        assert_eq!(descriptor.name(), "Demo");
        assert!(descriptor.max_host_version().is_none());
        assert!(!descriptor.has_permission(Permission::NetworkAccess));
    }
}

//! Test fixtures: package builder and a scriptable plugin.
//!
//! Available to this crate's tests and, through the `test-support` feature,
//! to downstream crates.

use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;

use crate::backend::module_entry;
use crate::context::ExtensionContext;
use crate::error::{PluginError, PluginResult};
use crate::native::NATIVE_MARKER_EXTENSION;
use crate::parser::{JSON_MANIFEST_ENTRY, METADATA_ENTRY, TOML_MANIFEST_ENTRY};
use crate::plugin::ExtensionPlugin;

// ---------------------------------------------------------------------------
// PackageBuilder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManifestStyle {
    Toml,
    Json,
    Properties,
    None,
}

#[derive(Serialize)]
struct StructuredManifest<'a> {
    id: &'a str,
    name: &'a str,
    version: &'a str,
    description: &'a str,
    author: &'a str,
    entry_point: &'a str,
    min_host_version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_host_version: Option<&'a str>,
    permissions: &'a [String],
    dependencies: &'a [String],
    extensions: &'a [String],
}

/// Builds package files for tests.
///
/// [`new`](Self::new) produces a complete, loadable compiled-archive package
/// with a TOML manifest and a native marker for its entry point
/// (`<id>.Main`).
#[derive(Debug, Clone)]
pub struct PackageBuilder {
    id: String,
    name: String,
    version: String,
    description: String,
    author: String,
    entry_point: String,
    min_host_version: String,
    max_host_version: Option<String>,
    permissions: Vec<String>,
    dependencies: Vec<String>,
    extensions: Vec<String>,
    style: ManifestStyle,
    legacy: bool,
    native_entry: bool,
    files: Vec<(String, Vec<u8>)>,
    file_name: Option<String>,
}

impl PackageBuilder {
    /// A complete package for `id`.
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            version: "1.0.0".into(),
            description: String::new(),
            author: String::new(),
            entry_point: format!("{id}.Main"),
            min_host_version: "1.0.0".into(),
            max_host_version: None,
            permissions: Vec::new(),
            dependencies: Vec::new(),
            extensions: Vec::new(),
            style: ManifestStyle::Toml,
            legacy: false,
            native_entry: true,
            files: Vec::new(),
            file_name: None,
        }
    }

    /// A package with no manifest and no files.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            style: ManifestStyle::None,
            native_entry: false,
            ..Self::new("")
        }
    }

    /// Write a plain tar instead of a gzip-compressed one.
    #[must_use]
    pub fn legacy(mut self) -> Self {
        self.legacy = true;
        self
    }

    /// Write the manifest as `META-INF/plugin.properties`.
    #[must_use]
    pub fn embedded_metadata(mut self) -> Self {
        self.style = ManifestStyle::Properties;
        self
    }

    /// Write the manifest as `plugin.json`.
    #[must_use]
    pub fn json_manifest(mut self) -> Self {
        self.style = ManifestStyle::Json;
        self
    }

    /// Request a permission (any string, known or not).
    #[must_use]
    pub fn permission(mut self, permission: &str) -> Self {
        self.permissions.push(permission.to_string());
        self
    }

    /// Declare a dependency.
    #[must_use]
    pub fn dependency(mut self, id: &str) -> Self {
        self.dependencies.push(id.to_string());
        self
    }

    /// Declare an extension point.
    #[must_use]
    pub fn extension(mut self, point: &str) -> Self {
        self.extensions.push(point.to_string());
        self
    }

    /// Override the entry point. The native marker follows it.
    #[must_use]
    pub fn entry_point(mut self, symbol: &str) -> Self {
        self.entry_point = symbol.to_string();
        self
    }

    /// Override the version.
    #[must_use]
    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    /// Override the display name. An empty name makes the manifest invalid.
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Override the minimum host version.
    #[must_use]
    pub fn min_host_version(mut self, version: &str) -> Self {
        self.min_host_version = version.to_string();
        self
    }

    /// Set the maximum host version.
    #[must_use]
    pub fn max_host_version(mut self, version: &str) -> Self {
        self.max_host_version = Some(version.to_string());
        self
    }

    /// Add an arbitrary archive entry.
    #[must_use]
    pub fn file(mut self, name: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.files.push((name.to_string(), contents.into()));
        self
    }

    /// Declare a native unit for `symbol`.
    #[must_use]
    pub fn native_unit(self, symbol: &str) -> Self {
        self.file(&module_entry(symbol, NATIVE_MARKER_EXTENSION), Vec::new())
    }

    /// Ship a WASM module for `symbol`.
    #[must_use]
    pub fn wasm_module(self, symbol: &str, module: impl Into<Vec<u8>>) -> Self {
        self.file(&module_entry(symbol, "wasm"), module)
    }

    /// Bundle a resource under `resources/`.
    #[must_use]
    pub fn resource(self, name: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.file(&format!("resources/{name}"), contents)
    }

    /// File name used by [`write_to`](Self::write_to). Defaults to
    /// `<id>.plx`.
    #[must_use]
    pub fn file_name(mut self, name: &str) -> Self {
        self.file_name = Some(name.to_string());
        self
    }

    /// Encode the package.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if archiving fails.
    pub fn build_bytes(&self) -> io::Result<Vec<u8>> {
        let mut entries: Vec<(String, Vec<u8>)> = Vec::new();
        if let Some(manifest) = self.manifest_entry()? {
            entries.push(manifest);
        }
        if self.native_entry && !self.entry_point.is_empty() {
            entries.push((
                module_entry(&self.entry_point, NATIVE_MARKER_EXTENSION),
                Vec::new(),
            ));
        }
        entries.extend(self.files.iter().cloned());

        let mut tar = tar::Builder::new(Vec::new());
        for (name, data) in &entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            tar.append_data(&mut header, name, data.as_slice())?;
        }
        let tar_bytes = tar.into_inner()?;

        if self.legacy {
            return Ok(tar_bytes);
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar_bytes)?;
        encoder.finish()
    }

    /// Write the package into `dir` and return its path.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if encoding or writing fails.
    pub fn write_to(&self, dir: &Path) -> io::Result<PathBuf> {
        let name = self.file_name.clone().unwrap_or_else(|| {
            if self.id.is_empty() {
                "package.plx".into()
            } else {
                format!("{}.plx", self.id)
            }
        });
        let path = dir.join(name);
        std::fs::write(&path, self.build_bytes()?)?;
        Ok(path)
    }

    fn manifest_entry(&self) -> io::Result<Option<(String, Vec<u8>)>> {
        let structured = StructuredManifest {
            id: &self.id,
            name: &self.name,
            version: &self.version,
            description: &self.description,
            author: &self.author,
            entry_point: &self.entry_point,
            min_host_version: &self.min_host_version,
            max_host_version: self.max_host_version.as_deref(),
            permissions: &self.permissions,
            dependencies: &self.dependencies,
            extensions: &self.extensions,
        };
        let entry = match self.style {
            ManifestStyle::None => return Ok(None),
            ManifestStyle::Toml => (
                TOML_MANIFEST_ENTRY.to_string(),
                toml::to_string(&structured)
                    .map_err(io::Error::other)?
                    .into_bytes(),
            ),
            ManifestStyle::Json => (
                JSON_MANIFEST_ENTRY.to_string(),
                serde_json::to_vec_pretty(&structured).map_err(io::Error::other)?,
            ),
            ManifestStyle::Properties => (METADATA_ENTRY.to_string(), self.properties().into_bytes()),
        };
        Ok(Some(entry))
    }

    fn properties(&self) -> String {
        let mut lines = vec![
            format!("plugin.id = {}", self.id),
            format!("plugin.name = {}", self.name),
            format!("plugin.version = {}", self.version),
            format!("plugin.description = {}", self.description),
            format!("plugin.author = {}", self.author),
            format!("plugin.entry_point = {}", self.entry_point),
            format!("plugin.min_host_version = {}", self.min_host_version),
            format!("plugin.permissions = {}", self.permissions.join(",")),
            format!("plugin.dependencies = {}", self.dependencies.join(",")),
            format!("plugin.extensions = {}", self.extensions.join(",")),
        ];
        if let Some(max) = &self.max_host_version {
            lines.push(format!("plugin.max_host_version = {max}"));
        }
        lines.join("\n")
    }
}

// ---------------------------------------------------------------------------
// ScriptedPlugin
// ---------------------------------------------------------------------------

/// What a scripted callback does.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Behavior {
    /// Return `Ok(())`.
    #[default]
    Succeed,
    /// Return an error with this message.
    Fail(String),
    /// Panic with this message.
    Panic(String),
}

impl Behavior {
    fn run(&self, callback: &str) -> PluginResult<()> {
        match self {
            Self::Succeed => Ok(()),
            Self::Fail(message) => Err(PluginError::Io(io::Error::other(format!(
                "{callback}: {message}"
            )))),
            Self::Panic(message) => panic!("{callback}: {message}"),
        }
    }
}

/// Shared record of callback names, in call order.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    /// Callbacks recorded so far.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn record(&self, callback: &str) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback.to_string());
    }
}

type InitHook = Arc<dyn Fn(&ExtensionContext) -> PluginResult<()> + Send + Sync>;

/// A plugin whose lifecycle callbacks succeed, fail or panic on demand.
///
/// Clones share the call log, so a factory can hand out clones while the
/// test keeps the original to inspect.
#[derive(Clone, Default)]
pub struct ScriptedPlugin {
    initialize: Behavior,
    activate: Behavior,
    deactivate: Behavior,
    dispose: Behavior,
    on_initialize: Option<InitHook>,
    log: CallLog,
}

impl fmt::Debug for ScriptedPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedPlugin")
            .field("initialize", &self.initialize)
            .field("activate", &self.activate)
            .field("deactivate", &self.deactivate)
            .field("dispose", &self.dispose)
            .finish_non_exhaustive()
    }
}

impl ScriptedPlugin {
    /// A plugin whose callbacks all succeed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script `initialize`.
    #[must_use]
    pub fn on_initialize(mut self, behavior: Behavior) -> Self {
        self.initialize = behavior;
        self
    }

    /// Script `activate`.
    #[must_use]
    pub fn on_activate(mut self, behavior: Behavior) -> Self {
        self.activate = behavior;
        self
    }

    /// Script `deactivate`.
    #[must_use]
    pub fn on_deactivate(mut self, behavior: Behavior) -> Self {
        self.deactivate = behavior;
        self
    }

    /// Script `dispose`.
    #[must_use]
    pub fn on_dispose(mut self, behavior: Behavior) -> Self {
        self.dispose = behavior;
        self
    }

    /// Run `hook` during `initialize`, after the scripted behavior succeeds.
    #[must_use]
    pub fn with_init_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ExtensionContext) -> PluginResult<()> + Send + Sync + 'static,
    {
        self.on_initialize = Some(Arc::new(hook));
        self
    }

    /// The shared call log.
    #[must_use]
    pub fn log(&self) -> &CallLog {
        &self.log
    }

    /// A factory handing out clones of this plugin.
    #[must_use]
    pub fn factory(&self) -> impl Fn() -> Box<dyn ExtensionPlugin> + Send + Sync + 'static {
        let template = self.clone();
        move || Box::new(template.clone())
    }
}

impl ExtensionPlugin for ScriptedPlugin {
    fn initialize(&mut self, ctx: &ExtensionContext) -> PluginResult<()> {
        self.log.record("initialize");
        self.initialize.run("initialize")?;
        match &self.on_initialize {
            Some(hook) => hook(ctx),
            None => Ok(()),
        }
    }

    fn activate(&mut self) -> PluginResult<()> {
        self.log.record("activate");
        self.activate.run("activate")
    }

    fn deactivate(&mut self) -> PluginResult<()> {
        self.log.record("deactivate");
        self.deactivate.run("deactivate")
    }

    fn dispose(&mut self) -> PluginResult<()> {
        self.log.record("dispose");
        self.dispose.run("dispose")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{ArchiveLimits, PackageArchive, PackageEncoding};

    #[test]
    fn default_package_contents() {
        let bytes = PackageBuilder::new("demo")
            .resource("a.txt", "a")
            .build_bytes()
            .unwrap();
        let archive =
            PackageArchive::decode(&bytes, PackageEncoding::CompiledArchive, &ArchiveLimits::default())
                .unwrap();
        let names: Vec<_> = archive.names().collect();
        assert_eq!(
            names,
            vec!["modules/demo.Main.native", "plugin.toml", "resources/a.txt"]
        );
    }

    #[test]
    fn legacy_packages_are_plain_tar() {
        let bytes = PackageBuilder::new("demo").legacy().build_bytes().unwrap();
        assert!(
            PackageArchive::decode(&bytes, PackageEncoding::LegacyArchive, &ArchiveLimits::default())
                .is_ok()
        );
    }

    #[test]
    fn properties_manifest_lists_are_comma_joined() {
        let props = PackageBuilder::new("demo")
            .permission("filesystem.read")
            .permission("network.access")
            .properties();
        assert!(props.contains("plugin.permissions = filesystem.read,network.access"));
        assert!(!props.contains("max_host_version"));
    }

    #[test]
    fn behaviors() {
        assert!(Behavior::Succeed.run("x").is_ok());
        assert!(Behavior::Fail("nope".into()).run("x").is_err());
        let result = std::panic::catch_unwind(|| Behavior::Panic("boom".into()).run("x"));
        assert!(result.is_err());
    }

    #[test]
    fn clones_share_the_log() {
        let plugin = ScriptedPlugin::new();
        let mut clone = plugin.clone();
        clone.activate().unwrap();
        assert_eq!(plugin.log().calls(), vec!["activate"]);
    }
}

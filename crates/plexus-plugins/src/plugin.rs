//! Plugin trait and core types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::ExtensionContext;
use crate::error::{PluginError, PluginResult};
use crate::extension::{
    DocumentationExtension, EditorExtension, EditorTabExtension, ProjectExtension, UiExtension,
};

/// Unique, stable, human-readable plugin identifier.
///
/// Plugin IDs are strings like `"demo"` or `"acme.git-tools"`. They name
/// on-disk directories, so they must be non-empty, contain only lowercase
/// alphanumeric characters, `.`, `-` and `_`, start and end with an
/// alphanumeric character, and never contain `..`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PluginId(String);

/// Deserialize with validation, so a crafted manifest can't smuggle a
/// traversal payload in through the id.
impl<'de> Deserialize<'de> for PluginId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl PluginId {
    /// Create a new `PluginId`, validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidId`] if the ID is empty or malformed.
    pub fn new(id: impl Into<String>) -> PluginResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Create a `PluginId` without validation (for tests and internal use).
    #[must_use]
    pub fn from_static(id: &str) -> Self {
        Self(id.to_string())
    }

    /// Get the inner string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether a string is a valid plugin ID without constructing one.
    #[must_use]
    pub fn is_valid_id(id: &str) -> bool {
        Self::validate(id).is_ok()
    }

    fn validate(id: &str) -> PluginResult<()> {
        if id.is_empty() {
            return Err(PluginError::InvalidId("plugin id must not be empty".into()));
        }
        if !id.chars().all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '.' | '_')
        }) {
            return Err(PluginError::InvalidId(format!(
                "plugin id must contain only lowercase alphanumerics, '.', '-' and '_', got: {id}"
            )));
        }
        let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
        if !id.starts_with(alnum) || !id.ends_with(alnum) {
            return Err(PluginError::InvalidId(format!(
                "plugin id must start and end with an alphanumeric character, got: {id}"
            )));
        }
        if id.contains("..") {
            return Err(PluginError::InvalidId(format!(
                "plugin id must not contain '..', got: {id}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PluginId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The lifecycle state of a plugin id.
///
/// `Discovered -> Loaded -> Active <-> Disabled -> Unloaded`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Package found in storage, manifest read, no code loaded.
    Discovered,
    /// Initialized and sitting in the plugin table, not yet activated.
    Loaded,
    /// Activated and contributing to the host.
    Active,
    /// Deactivated but still loaded.
    Disabled,
    /// Torn down. A new load creates a fresh instance.
    Unloaded,
}

impl LifecycleState {
    /// Whether a plugin instance currently occupies the id.
    #[must_use]
    pub fn is_loaded(self) -> bool {
        matches!(self, Self::Loaded | Self::Active | Self::Disabled)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Discovered => "discovered",
            Self::Loaded => "loaded",
            Self::Active => "active",
            Self::Disabled => "disabled",
            Self::Unloaded => "unloaded",
        };
        f.write_str(s)
    }
}

/// An extension instantiated from a plugin package.
///
/// The manager drives these callbacks in lifecycle order. Every callback is
/// invoked behind a panic boundary, so an implementation that panics is
/// treated the same as one that returns an error.
///
/// A plugin opts into extension points by overriding the matching `as_*`
/// method to return `Some(self)`.
pub trait ExtensionPlugin: Send {
    /// Called once after instantiation, before the plugin enters the table.
    ///
    /// The context can be cloned and kept for later callbacks.
    ///
    /// # Errors
    ///
    /// Any error aborts the load; the manager reports it as
    /// [`PluginError::InitializationFailed`].
    fn initialize(&mut self, ctx: &ExtensionContext) -> PluginResult<()>;

    /// Start contributing to the host.
    ///
    /// # Errors
    ///
    /// Any error leaves the plugin in its previous state.
    fn activate(&mut self) -> PluginResult<()> {
        Ok(())
    }

    /// Stop contributing to the host. Best-effort.
    ///
    /// # Errors
    ///
    /// Errors are logged; the plugin is considered deactivated regardless.
    fn deactivate(&mut self) -> PluginResult<()> {
        Ok(())
    }

    /// Release everything before the instance is dropped. Best-effort.
    ///
    /// # Errors
    ///
    /// Errors are logged; unload proceeds regardless.
    fn dispose(&mut self) -> PluginResult<()> {
        Ok(())
    }

    /// UI contributions (menu items, tabs, navigation entries).
    fn as_ui(&self) -> Option<&dyn UiExtension> {
        None
    }

    /// Editor tab contributions.
    fn as_editor_tab(&self) -> Option<&dyn EditorTabExtension> {
        None
    }

    /// Documentation contributions.
    fn as_documentation(&self) -> Option<&dyn DocumentationExtension> {
        None
    }

    /// Editor event hooks.
    fn as_editor(&mut self) -> Option<&mut dyn EditorExtension> {
        None
    }

    /// Project event hooks.
    fn as_project(&mut self) -> Option<&mut dyn ProjectExtension> {
        None
    }
}

impl fmt::Debug for dyn ExtensionPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionPlugin")
            .field("ui", &self.as_ui().is_some())
            .field("editor_tab", &self.as_editor_tab().is_some())
            .field("documentation", &self.as_documentation().is_some())
            .finish_non_exhaustive()
    }
}

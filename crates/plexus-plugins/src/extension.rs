//! Extension points a plugin may implement.
//!
//! The presentation layer never inspects plugin types directly. It asks the
//! manager for contributions, and the manager asks each active plugin for the
//! matching capability through [`ExtensionPlugin`](crate::ExtensionPlugin)'s
//! `as_*` methods.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::plugin::PluginId;

/// The extension points a manifest can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionPoint {
    /// Menu items, tabs and navigation entries.
    Ui,
    /// Editor tabs bound to file types.
    EditorTab,
    /// Documentation pages.
    Documentation,
    /// Editor event hooks.
    Editor,
    /// Project event hooks.
    Project,
}

impl ExtensionPoint {
    /// Manifest spelling.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ui => "ui",
            Self::EditorTab => "editor_tab",
            Self::Documentation => "documentation",
            Self::Editor => "editor",
            Self::Project => "project",
        }
    }
}

impl FromStr for ExtensionPoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "ui" => Ok(Self::Ui),
            "editor_tab" => Ok(Self::EditorTab),
            "documentation" | "docs" => Ok(Self::Documentation),
            "editor" => Ok(Self::Editor),
            "project" => Ok(Self::Project),
            _ => Err(format!("unknown extension point: {}", s.trim())),
        }
    }
}

impl fmt::Display for ExtensionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A menu entry contributed by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItem {
    /// Stable identifier, unique within the plugin.
    pub id: String,
    /// Label shown to the user.
    pub title: String,
    /// Action the host dispatches when the item is picked.
    pub action: String,
    /// Optional menu group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Sort key within the group.
    #[serde(default)]
    pub order: i32,
}

/// A top-level tab contributed by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabContribution {
    /// Stable identifier, unique within the plugin.
    pub id: String,
    /// Tab title.
    pub title: String,
    /// Sort key.
    #[serde(default)]
    pub order: i32,
}

/// A navigation entry contributed by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationItem {
    /// Stable identifier, unique within the plugin.
    pub id: String,
    /// Label.
    pub title: String,
    /// Icon name understood by the presentation layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Sort key.
    #[serde(default)]
    pub order: i32,
}

/// An editor tab bound to one or more file extensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditorTabContribution {
    /// Stable identifier, unique within the plugin.
    pub id: String,
    /// Tab title.
    pub title: String,
    /// File extensions (without the dot) this tab can open.
    #[serde(default)]
    pub file_extensions: Vec<String>,
}

impl EditorTabContribution {
    /// Whether this tab handles `path`, judged by its extension.
    #[must_use]
    pub fn handles(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                self.file_extensions
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext))
            })
    }
}

/// A documentation page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentationEntry {
    /// Stable identifier, unique within the plugin.
    pub id: String,
    /// Page title.
    pub title: String,
    /// Grouping used by the documentation browser.
    #[serde(default)]
    pub category: String,
    /// Markdown body.
    pub body: String,
}

/// A contribution tagged with the plugin that made it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Contribution<T> {
    /// Contributing plugin.
    pub plugin_id: PluginId,
    /// The contributed item.
    pub item: T,
}

/// UI surfaces a plugin contributes.
pub trait UiExtension {
    /// Menu items.
    fn menu_items(&self) -> Vec<MenuItem> {
        Vec::new()
    }

    /// Top-level tabs.
    fn tabs(&self) -> Vec<TabContribution> {
        Vec::new()
    }

    /// Navigation entries.
    fn navigation_items(&self) -> Vec<NavigationItem> {
        Vec::new()
    }
}

/// Editor tabs a plugin contributes.
pub trait EditorTabExtension {
    /// Every editor tab this plugin provides.
    fn editor_tabs(&self) -> Vec<EditorTabContribution>;
}

/// Documentation a plugin contributes.
pub trait DocumentationExtension {
    /// Every page this plugin provides.
    fn documentation(&self) -> Vec<DocumentationEntry>;
}

/// Editor events delivered to a plugin.
pub trait EditorExtension {
    /// A file was opened in an editor.
    fn on_file_opened(&mut self, _path: &Path) {}

    /// A file was saved.
    fn on_file_saved(&mut self, _path: &Path) {}

    /// A file was closed.
    fn on_file_closed(&mut self, _path: &Path) {}
}

/// Project events delivered to a plugin.
pub trait ProjectExtension {
    /// A project was opened.
    fn on_project_opened(&mut self, _root: &Path) {}

    /// The current project was closed.
    fn on_project_closed(&mut self) {}
}

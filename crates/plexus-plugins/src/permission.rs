//! Capability permissions a plugin may request in its manifest.
//!
//! Permissions are a closed set defined by the host. The string form only
//! exists at the manifest boundary; everything past the validator works with
//! [`Permission`] values.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PluginError;

/// A named grant that unlocks a tier of sensitive symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Permission {
    /// Read files through raw filesystem handles.
    FilesystemRead,
    /// Write files, including inside the plugin's private directory.
    FilesystemWrite,
    /// Open sockets and resolve URLs.
    NetworkAccess,
    /// Spawn and control child processes.
    SystemCommands,
    /// Read host (IDE) settings.
    IdeSettings,
    /// Read the structure of the open project.
    ProjectStructure,
}

/// Set of permissions granted to one plugin.
pub type PermissionSet = BTreeSet<Permission>;

impl Permission {
    /// Every permission the host defines.
    pub const ALL: [Self; 6] = [
        Self::FilesystemRead,
        Self::FilesystemWrite,
        Self::NetworkAccess,
        Self::SystemCommands,
        Self::IdeSettings,
        Self::ProjectStructure,
    ];

    /// Canonical manifest spelling, e.g. `filesystem.write`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FilesystemRead => "filesystem.read",
            Self::FilesystemWrite => "filesystem.write",
            Self::NetworkAccess => "network.access",
            Self::SystemCommands => "system.commands",
            Self::IdeSettings => "ide.settings",
            Self::ProjectStructure => "project.structure",
        }
    }

    /// Parse every name in `names`, failing on the first unknown one.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::UnknownPermission`] carrying the name exactly as
    /// it was written.
    pub fn parse_all<I, S>(names: I) -> Result<PermissionSet, PluginError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .map(|name| name.as_ref().parse())
            .collect()
    }
}

impl FromStr for Permission {
    type Err = PluginError;

    /// Accepts the dotted form (`network.access`) and the legacy upper-snake
    /// form (`NETWORK_ACCESS`), case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', ".");
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| PluginError::UnknownPermission(s.trim().to_string()))
    }
}

impl TryFrom<String> for Permission {
    type Error = PluginError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Permission> for String {
    fn from(p: Permission) -> Self {
        p.as_str().to_string()
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dotted_and_legacy_forms() {
        assert_eq!(
            "network.access".parse::<Permission>().unwrap(),
            Permission::NetworkAccess
        );
        assert_eq!(
            "FILESYSTEM_WRITE".parse::<Permission>().unwrap(),
            Permission::FilesystemWrite
        );
        assert_eq!(
            " System.Commands ".parse::<Permission>().unwrap(),
            Permission::SystemCommands
        );
    }

    #[test]
    fn unknown_permission_keeps_original_spelling() {
        let err = "delete.everything".parse::<Permission>().unwrap_err();
        match err {
            PluginError::UnknownPermission(name) => assert_eq!(name, "delete.everything"),
            other => panic!("expected UnknownPermission, got: {other:?}"),
        }
    }

    #[test]
    fn parse_all_stops_at_first_unknown() {
        let err = Permission::parse_all(["filesystem.read", "teleport", "network.access"])
            .unwrap_err();
        assert!(matches!(err, PluginError::UnknownPermission(ref n) if n == "teleport"));

        let set = Permission::parse_all(["network.access", "NETWORK_ACCESS"]).unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn serde_uses_manifest_spelling() {
        let json = serde_json::to_string(&Permission::IdeSettings).unwrap();
        assert_eq!(json, "\"ide.settings\"");
        let back: Permission = serde_json::from_str("\"PROJECT_STRUCTURE\"").unwrap();
        assert_eq!(back, Permission::ProjectStructure);
        assert!(serde_json::from_str::<Permission>("\"root.shell\"").is_err());
    }
}

//! Plugin runtime for Plexus hosts.
//!
//! Loads third-party extension packages, checks them, runs each one behind
//! its own loader and capability gate, and drives it through a managed
//! lifecycle:
//!
//! - [`parser`]: reads a package file (compiled or legacy archive) into a
//!   [`RawManifest`](manifest::RawManifest)
//! - [`validator`]: turns a raw manifest into a [`ManifestDescriptor`]
//! - [`gate`]: decides which host symbols a plugin may resolve
//! - [`loader`]: per-plugin [`IsolatedLoader`] over the module backends
//!   ([`wasm`], [`native`])
//! - [`registry`]: typed, concurrent [`CapabilityRegistry`]
//! - [`context`]: the [`ExtensionContext`] handed to every plugin
//! - [`manager`]: [`PluginManager`], the host's entry point
//!
//! # Lifecycle
//!
//! ```text
//! Discovered --load--> Loaded --enable--> Active
//!                        ^                 |  ^
//!                        |           disable  enable
//!                        |                 v  |
//!                        |               Disabled
//!                        |
//!        (any loaded) --unload--> Unloaded --load--> Loaded
//! ```
//!
//! Plugin callbacks never take the host down: errors and panics are
//! contained and reported as [`PluginError`] values or log records.
//!
//! # Storage
//!
//! Packages live under `<root>/plugins/<id>/package.plx`, next to the
//! plugin's private `data/` directory. See [`storage`].

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod backend;
pub mod config;
pub mod context;
pub mod discovery;
pub mod enablement;
pub mod error;
pub mod extension;
pub mod gate;
pub mod host;
pub mod integrity;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod native;
pub mod package;
pub mod parser;
pub mod permission;
pub mod plugin;
pub mod registry;
pub mod resources;
pub mod storage;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod validator;
pub mod wasm;

pub use config::RuntimeConfig;
pub use context::{ExtensionContext, PluginLogger};
pub use enablement::EnablementStore;
pub use error::{PluginError, PluginResult};
pub use extension::{
    Contribution, DocumentationEntry, DocumentationExtension, EditorExtension,
    EditorTabContribution, EditorTabExtension, ExtensionPoint, MenuItem, NavigationItem,
    ProjectExtension, TabContribution, UiExtension,
};
pub use gate::{CapabilityGate, GateDecision, GatePolicy};
pub use host::HostNamespace;
pub use integrity::{Blake3Verifier, IntegrityVerifier, NonEmptyFile};
pub use loader::{IsolatedLoader, LoaderStats, ResolvedSymbol};
pub use manager::{LoadReport, PluginInfo, PluginManager, PluginManagerBuilder, UiContributions};
pub use manifest::{ManifestDescriptor, RawManifest};
pub use native::NativeModuleTable;
pub use package::{ArchiveLimits, PackageEncoding};
pub use permission::{Permission, PermissionSet};
pub use plugin::{ExtensionPlugin, LifecycleState, PluginId};
pub use registry::CapabilityRegistry;
pub use resources::ResourceAccessor;
pub use wasm::{WasmExtension, WasmModuleBackend};

//! Module backends: how a plugin's own symbols are turned into code.
//!
//! An [`IsolatedLoader`](crate::IsolatedLoader) tries its backends in order.
//! The default pair is [`WasmModuleBackend`](crate::wasm::WasmModuleBackend)
//! (primary) and [`NativeModuleBackend`](crate::native::NativeModuleBackend)
//! (secondary).

use std::fmt;
use std::sync::Arc;

use crate::error::PluginResult;
use crate::package::PackageArchive;
use crate::plugin::{ExtensionPlugin, PluginId};

/// Directory inside a package that holds loadable units.
pub const MODULES_DIR: &str = "modules";

/// Path of the unit for `symbol` with the given file extension.
#[must_use]
pub fn module_entry(symbol: &str, extension: &str) -> String {
    format!("{MODULES_DIR}/{symbol}.{extension}")
}

/// What a backend is asked to load.
#[derive(Debug, Clone, Copy)]
pub struct ModuleRequest<'a> {
    /// Plugin whose package is being searched.
    pub plugin_id: &'a PluginId,
    /// That plugin's decoded package.
    pub archive: &'a PackageArchive,
    /// Symbol to resolve.
    pub symbol: &'a str,
}

/// A unit of plugin code resolved from a package.
///
/// Units are factories: the host calls [`instantiate`](Self::instantiate)
/// to obtain a fresh plugin instance. Nothing is reflected on.
pub trait ModuleUnit: Send + Sync {
    /// Symbol this unit was resolved for.
    fn symbol(&self) -> &str;

    /// Name of the backend that produced the unit.
    fn backend(&self) -> &'static str;

    /// Create a new plugin instance from this unit.
    ///
    /// # Errors
    ///
    /// Returns an error if the unit cannot be instantiated (e.g. the WASM
    /// module fails to compile).
    fn instantiate(&self) -> PluginResult<Box<dyn ExtensionPlugin>>;
}

impl fmt::Debug for dyn ModuleUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleUnit")
            .field("symbol", &self.symbol())
            .field("backend", &self.backend())
            .finish()
    }
}

/// A strategy for loading plugin-owned units.
pub trait ModuleBackend: Send + Sync {
    /// Short name used in diagnostics (`wasm`, `native`).
    fn name(&self) -> &'static str;

    /// Load the unit for `request.symbol` from the requesting plugin's package.
    ///
    /// # Errors
    ///
    /// Any error means "this backend cannot provide the symbol"; the loader
    /// moves on to the next backend and reports every error if all fail.
    fn load_unit(&self, request: ModuleRequest<'_>) -> PluginResult<Arc<dyn ModuleUnit>>;
}

impl fmt::Debug for dyn ModuleBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleBackend")
            .field("name", &self.name())
            .finish()
    }
}

//! Host-linked plugin units.
//!
//! Plugins compiled into the host binary register a factory per
//! `(plugin id, symbol)` in a [`NativeModuleTable`]. The package still has to
//! declare the unit with a `modules/<symbol>.native` marker, so a package can
//! only reach factories registered under its own id and for units it ships.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::backend::{ModuleBackend, ModuleRequest, ModuleUnit, module_entry};
use crate::error::{PluginError, PluginResult};
use crate::plugin::{ExtensionPlugin, PluginId};

/// File extension of native unit markers.
pub const NATIVE_MARKER_EXTENSION: &str = "native";

/// Factory producing a fresh plugin instance.
pub type PluginFactory = Arc<dyn Fn() -> Box<dyn ExtensionPlugin> + Send + Sync>;

/// Factories for host-linked plugin units, keyed by plugin id and symbol.
///
/// Cheap to clone; clones share the same table.
#[derive(Clone, Default)]
pub struct NativeModuleTable {
    factories: Arc<DashMap<(PluginId, String), PluginFactory>>,
}

impl fmt::Debug for NativeModuleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeModuleTable")
            .field("factories", &self.factories.len())
            .finish()
    }
}

impl NativeModuleTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` as the implementation of `symbol` for `plugin_id`.
    ///
    /// Replaces any earlier factory for the same key.
    pub fn register<F>(&self, plugin_id: PluginId, symbol: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn ExtensionPlugin> + Send + Sync + 'static,
    {
        let symbol = symbol.into();
        debug!(plugin_id = %plugin_id, symbol = %symbol, "Registered native unit");
        self.factories
            .insert((plugin_id, symbol), Arc::new(factory));
    }

    /// Remove the factory for `(plugin_id, symbol)`.
    pub fn unregister(&self, plugin_id: &PluginId, symbol: &str) -> bool {
        self.factories
            .remove(&(plugin_id.clone(), symbol.to_string()))
            .is_some()
    }

    /// Whether a factory is registered for `(plugin_id, symbol)`.
    #[must_use]
    pub fn contains(&self, plugin_id: &PluginId, symbol: &str) -> bool {
        self.factories
            .contains_key(&(plugin_id.clone(), symbol.to_string()))
    }

    fn get(&self, plugin_id: &PluginId, symbol: &str) -> Option<PluginFactory> {
        self.factories
            .get(&(plugin_id.clone(), symbol.to_string()))
            .map(|entry| Arc::clone(entry.value()))
    }
}

/// Secondary backend resolving units from a [`NativeModuleTable`].
#[derive(Debug, Clone, Default)]
pub struct NativeModuleBackend {
    table: NativeModuleTable,
}

impl NativeModuleBackend {
    /// Backend over `table`.
    #[must_use]
    pub fn new(table: NativeModuleTable) -> Self {
        Self { table }
    }
}

impl ModuleBackend for NativeModuleBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn load_unit(&self, request: ModuleRequest<'_>) -> PluginResult<Arc<dyn ModuleUnit>> {
        let marker = module_entry(request.symbol, NATIVE_MARKER_EXTENSION);
        if !request.archive.contains(&marker) {
            return Err(PluginError::SymbolNotFound {
                symbol: request.symbol.to_string(),
                attempts: vec![format!("package has no {marker}")],
            });
        }
        let factory = self
            .table
            .get(request.plugin_id, request.symbol)
            .ok_or_else(|| PluginError::SymbolNotFound {
                symbol: request.symbol.to_string(),
                attempts: vec![format!(
                    "no native factory registered for {}",
                    request.plugin_id
                )],
            })?;
        Ok(Arc::new(NativeUnit {
            symbol: request.symbol.to_string(),
            factory,
        }))
    }
}

struct NativeUnit {
    symbol: String,
    factory: PluginFactory,
}

impl ModuleUnit for NativeUnit {
    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn backend(&self) -> &'static str {
        "native"
    }

    fn instantiate(&self) -> PluginResult<Box<dyn ExtensionPlugin>> {
        Ok((self.factory)())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExtensionContext;
    use crate::package::{ArchiveLimits, PackageArchive, PackageEncoding};
    use crate::testing::PackageBuilder;

    struct Noop;

    impl ExtensionPlugin for Noop {
        fn initialize(&mut self, _ctx: &ExtensionContext) -> PluginResult<()> {
            Ok(())
        }
    }

    fn archive_with_marker(symbol: &str) -> PackageArchive {
        let bytes = PackageBuilder::new("demo")
            .native_unit(symbol)
            .build_bytes()
            .unwrap();
        PackageArchive::decode(&bytes, PackageEncoding::CompiledArchive, &ArchiveLimits::default())
            .unwrap()
    }

    #[test]
    fn resolves_registered_and_declared_units() {
        let table = NativeModuleTable::new();
        let id = PluginId::from_static("demo");
        table.register(id.clone(), "demo.Helper", || Box::new(Noop));
        let backend = NativeModuleBackend::new(table.clone());
        let archive = archive_with_marker("demo.Helper");

        let unit = backend
            .load_unit(ModuleRequest {
                plugin_id: &id,
                archive: &archive,
                symbol: "demo.Helper",
            })
            .unwrap();
        assert_eq!(unit.symbol(), "demo.Helper");
        assert_eq!(unit.backend(), "native");
        assert!(unit.instantiate().is_ok());
        assert!(table.contains(&id, "demo.Helper"));
    }

    #[test]
    fn undeclared_unit_is_not_resolved() {
        let table = NativeModuleTable::new();
        let id = PluginId::from_static("demo");
        table.register(id.clone(), "demo.Secret", || Box::new(Noop));
        let backend = NativeModuleBackend::new(table);
        let archive = archive_with_marker("demo.Helper");

        let err = backend
            .load_unit(ModuleRequest {
                plugin_id: &id,
                archive: &archive,
                symbol: "demo.Secret",
            })
            .unwrap_err();
        assert!(err.to_string().contains("modules/demo.Secret.native"));
    }

    #[test]
    fn factories_are_scoped_to_their_plugin() {
        let table = NativeModuleTable::new();
        table.register(PluginId::from_static("other"), "demo.Helper", || Box::new(Noop));
        let backend = NativeModuleBackend::new(table.clone());
        let archive = archive_with_marker("demo.Helper");

        let id = PluginId::from_static("demo");
        assert!(backend
            .load_unit(ModuleRequest {
                plugin_id: &id,
                archive: &archive,
                symbol: "demo.Helper",
            })
            .is_err());

        assert!(table.unregister(&PluginId::from_static("other"), "demo.Helper"));
        assert!(!table.unregister(&PluginId::from_static("other"), "demo.Helper"));
    }
}

//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use plexus_plugins::testing::{PackageBuilder, ScriptedPlugin};
use plexus_plugins::{
    ExtensionContext, NativeModuleTable, PluginId, PluginManager, PluginManagerBuilder,
};
use tempfile::TempDir;

/// A manager over a temporary root plus the native table it loads from.
pub struct Harness {
    pub dir: TempDir,
    pub table: NativeModuleTable,
    pub manager: PluginManager,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|builder| builder)
    }

    /// Build the manager through `configure`.
    pub fn with(configure: impl FnOnce(PluginManagerBuilder) -> PluginManagerBuilder) -> Self {
        plexus_telemetry::setup_test_logging();
        let dir = tempfile::tempdir().unwrap();
        let table = NativeModuleTable::new();
        let builder = PluginManager::builder(dir.path()).with_native_modules(table.clone());
        let manager = configure(builder).build();
        Self {
            dir,
            table,
            manager,
        }
    }

    /// Register `plugin` as the entry point of `id`.
    pub fn register(&self, id: &str, plugin: &ScriptedPlugin) {
        self.table
            .register(PluginId::from_static(id), format!("{id}.Main"), plugin.factory());
    }

    /// Register `plugin` and write a default package for it.
    pub fn package(&self, id: &str, plugin: &ScriptedPlugin) -> PathBuf {
        self.write(id, plugin, PackageBuilder::new(id))
    }

    /// Register `plugin` and write `builder`'s package.
    pub fn write(&self, id: &str, plugin: &ScriptedPlugin, builder: PackageBuilder) -> PathBuf {
        self.register(id, plugin);
        builder.write_to(self.dir.path()).unwrap()
    }

    /// Directory loose packages are discovered from.
    pub fn plugins_dir(&self) -> PathBuf {
        let dir = plexus_plugins::storage::plugins_dir(self.dir.path());
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}

/// Where a plugin's context lands once it initializes.
pub type ContextSlot = Arc<Mutex<Option<ExtensionContext>>>;

/// A plugin that keeps its context so a test can act as the plugin.
pub fn capturing_plugin() -> (ScriptedPlugin, ContextSlot) {
    let slot: ContextSlot = Arc::default();
    let captured = Arc::clone(&slot);
    let plugin = ScriptedPlugin::new().with_init_hook(move |ctx| {
        *captured.lock().unwrap() = Some(ctx.clone());
        Ok(())
    });
    (plugin, slot)
}

pub fn context(slot: &ContextSlot) -> ExtensionContext {
    slot.lock().unwrap().clone().expect("plugin was not initialized")
}

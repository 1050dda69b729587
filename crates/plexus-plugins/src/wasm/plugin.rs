//! WASM units and the extensions instantiated from them.

use std::fmt;
use std::time::Duration;

use extism::{Manifest, PluginBuilder, Wasm};
use serde::Serialize;
use tracing::{debug, warn};

use crate::backend::ModuleUnit;
use crate::context::ExtensionContext;
use crate::error::{PluginError, PluginResult};
use crate::permission::Permission;
use crate::plugin::{ExtensionPlugin, PluginId};

/// Limits applied to every Extism instance a backend creates.
#[derive(Debug, Clone)]
pub(crate) struct WasmConfig {
    pub(crate) max_memory_bytes: u64,
    pub(crate) max_execution_time: Duration,
    pub(crate) require_hash: bool,
}

/// A verified WASM module, ready to be instantiated.
pub(crate) struct WasmUnit {
    plugin_id: PluginId,
    symbol: String,
    bytes: Vec<u8>,
    config: WasmConfig,
}

impl WasmUnit {
    pub(crate) fn new(plugin_id: PluginId, symbol: String, bytes: Vec<u8>, config: WasmConfig) -> Self {
        Self {
            plugin_id,
            symbol,
            bytes,
            config,
        }
    }
}

impl ModuleUnit for WasmUnit {
    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn backend(&self) -> &'static str {
        "wasm"
    }

    fn instantiate(&self) -> PluginResult<Box<dyn ExtensionPlugin>> {
        let mut manifest = Manifest::new([Wasm::data(self.bytes.clone())]);
        manifest = manifest.with_timeout(self.config.max_execution_time);
        // WASM pages are 64KB each
        let pages = self.config.max_memory_bytes / (64 * 1024);
        manifest = manifest.with_memory_max(u32::try_from(pages).unwrap_or(u32::MAX));

        let plugin = PluginBuilder::new(manifest)
            .with_wasi(false)
            .build()
            .map_err(|e| PluginError::WasmError(format!("failed to build Extism plugin: {e}")))?;

        debug!(plugin_id = %self.plugin_id, symbol = %self.symbol, "Instantiated WASM unit");
        Ok(Box::new(WasmExtension {
            plugin_id: self.plugin_id.clone(),
            plugin,
        }))
    }
}

/// Payload passed to the guest's `initialize` export.
#[derive(Serialize)]
struct InitPayload<'a> {
    plugin_id: &'a str,
    permissions: Vec<&'static str>,
}

/// An [`ExtensionPlugin`] backed by an Extism instance.
///
/// Each lifecycle callback maps to a guest export of the same name. Exports
/// the guest does not define are treated as successful no-ops.
pub struct WasmExtension {
    plugin_id: PluginId,
    plugin: extism::Plugin,
}

impl fmt::Debug for WasmExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WasmExtension")
            .field("plugin_id", &self.plugin_id)
            .finish_non_exhaustive()
    }
}

impl WasmExtension {
    fn call_export(&mut self, name: &str, input: &str) -> PluginResult<()> {
        if !self.plugin.function_exists(name) {
            return Ok(());
        }
        let output = self
            .plugin
            .call::<&str, String>(name, input)
            .map_err(|e| PluginError::WasmError(format!("guest export `{name}` failed: {e}")))?;
        if !output.is_empty() {
            debug!(plugin_id = %self.plugin_id, export = name, output = %output, "Guest export returned");
        }
        Ok(())
    }
}

impl ExtensionPlugin for WasmExtension {
    fn initialize(&mut self, ctx: &ExtensionContext) -> PluginResult<()> {
        let payload = InitPayload {
            plugin_id: ctx.plugin_id().as_str(),
            permissions: ctx.permissions().iter().copied().map(Permission::as_str).collect(),
        };
        let input = serde_json::to_string(&payload)
            .map_err(|e| PluginError::WasmError(format!("failed to encode init payload: {e}")))?;
        self.call_export("initialize", &input)
    }

    fn activate(&mut self) -> PluginResult<()> {
        self.call_export("activate", "")
    }

    fn deactivate(&mut self) -> PluginResult<()> {
        self.call_export("deactivate", "")
    }

    fn dispose(&mut self) -> PluginResult<()> {
        let result = self.call_export("dispose", "");
        if let Err(ref e) = result {
            warn!(plugin_id = %self.plugin_id, error = %e, "WASM dispose failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_module_fails_to_instantiate() {
        let unit = WasmUnit::new(
            PluginId::from_static("demo"),
            "demo.Main".into(),
            b"\0asm\xff\xff\xff\xff".to_vec(),
            WasmConfig {
                max_memory_bytes: 1024 * 1024,
                max_execution_time: Duration::from_secs(1),
                require_hash: false,
            },
        );
        let err = unit.instantiate().unwrap_err();
        assert!(matches!(err, PluginError::WasmError(ref m) if m.contains("Extism")));
    }

    #[test]
    fn init_payload_shape() {
        let payload = InitPayload {
            plugin_id: "demo",
            permissions: vec![Permission::NetworkAccess.as_str()],
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["plugin_id"], "demo");
        assert_eq!(json["permissions"][0], Permission::NetworkAccess.as_str());
    }
}

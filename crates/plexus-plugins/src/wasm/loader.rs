//! WASM module backend with builder-pattern configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::{ModuleBackend, ModuleRequest, ModuleUnit, module_entry};
use crate::error::{PluginError, PluginResult};
use crate::integrity::verify_hash;
use crate::wasm::plugin::{WasmConfig, WasmUnit};

/// Default maximum WASM linear memory: 64 MB.
pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 64 * 1024 * 1024;

/// Default maximum execution time per call: 30 seconds.
pub const DEFAULT_MAX_EXECUTION_TIME: Duration = Duration::from_secs(30);

/// WASM magic bytes.
const WASM_MAGIC: &[u8; 4] = b"\0asm";

/// Primary module backend: resolves `modules/<symbol>.wasm` from the package.
///
/// # Example
///
/// ```rust
/// use plexus_plugins::wasm::WasmModuleBackend;
/// use std::time::Duration;
///
/// let backend = WasmModuleBackend::new()
///     .with_memory_limit(32 * 1024 * 1024) // 32 MB
///     .with_timeout(Duration::from_secs(10));
/// assert_eq!(backend.max_memory_bytes(), 32 * 1024 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct WasmModuleBackend {
    config: WasmConfig,
}

impl Default for WasmModuleBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl WasmModuleBackend {
    /// Create a backend with default settings (64 MB memory, 30s timeout).
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: WasmConfig {
                max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
                max_execution_time: DEFAULT_MAX_EXECUTION_TIME,
                require_hash: false,
            },
        }
    }

    /// Set the maximum WASM linear memory in bytes.
    #[must_use]
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.config.max_memory_bytes = bytes;
        self
    }

    /// Set the maximum execution time per WASM call.
    #[must_use]
    pub fn with_timeout(mut self, duration: Duration) -> Self {
        self.config.max_execution_time = duration;
        self
    }

    /// Require every WASM unit to ship a `.blake3` digest.
    #[must_use]
    pub fn with_require_hash(mut self, require: bool) -> Self {
        self.config.require_hash = require;
        self
    }

    /// Get the configured memory limit.
    #[must_use]
    pub fn max_memory_bytes(&self) -> u64 {
        self.config.max_memory_bytes
    }

    /// Get the configured execution timeout.
    #[must_use]
    pub fn max_execution_time(&self) -> Duration {
        self.config.max_execution_time
    }
}

impl ModuleBackend for WasmModuleBackend {
    fn name(&self) -> &'static str {
        "wasm"
    }

    fn load_unit(&self, request: ModuleRequest<'_>) -> PluginResult<Arc<dyn ModuleUnit>> {
        let entry = module_entry(request.symbol, "wasm");
        let bytes = request
            .archive
            .get(&entry)
            .ok_or_else(|| PluginError::WasmError(format!("package has no {entry}")))?;

        if !bytes.starts_with(WASM_MAGIC) {
            return Err(PluginError::WasmError(format!(
                "{entry} is not a WASM module"
            )));
        }

        let digest_entry = format!("{entry}.blake3");
        let expected = request
            .archive
            .get(&digest_entry)
            .map(|d| String::from_utf8_lossy(d).trim().to_ascii_lowercase());
        if expected.is_none() && self.config.require_hash {
            return Err(PluginError::WasmError(format!(
                "WASM module hash required but {digest_entry} is missing"
            )));
        }
        verify_hash(bytes, expected.as_deref(), request.plugin_id)?;

        Ok(Arc::new(WasmUnit::new(
            request.plugin_id.clone(),
            request.symbol.to_string(),
            bytes.to_vec(),
            self.config.clone(),
        )))
    }
}

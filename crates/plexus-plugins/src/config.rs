//! Runtime configuration.
//!
//! Loaded from TOML; every field has a default, so an empty file is valid.
//!
//! ```toml
//! root_dir = "/var/lib/host"
//! host_version = "2.1"
//! activate_on_load = true
//! persist_enablement = true
//!
//! [integrity]
//! require_pin = false
//! pins = { "acme.tools" = "<blake3 hex>" }
//!
//! [wasm]
//! max_memory_bytes = 67108864
//! timeout_secs = 30
//!
//! [gate]
//! extra_deny_prefixes = ["host.billing."]
//! extra_sensitive = { "host.vcs.Push" = ["network.access"] }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PluginError, PluginResult};
use crate::gate::GatePolicy;
use crate::integrity::{Blake3Verifier, IntegrityVerifier, NonEmptyFile};
use crate::package::{
    ArchiveLimits, DEFAULT_MAX_ENTRIES, DEFAULT_MAX_PACKAGE_BYTES, DEFAULT_MAX_UNPACKED_BYTES,
};
use crate::permission::Permission;
use crate::plugin::PluginId;
use crate::validator::parse_lenient;
use crate::wasm::WasmModuleBackend;
use crate::wasm::loader::{DEFAULT_MAX_EXECUTION_TIME, DEFAULT_MAX_MEMORY_BYTES};

/// Environment variable overriding [`RuntimeConfig::root_dir`].
pub const ENV_ROOT_DIR: &str = "PLEXUS_ROOT_DIR";

/// Environment variable overriding [`RuntimeConfig::host_version`].
pub const ENV_HOST_VERSION: &str = "PLEXUS_HOST_VERSION";

/// Maximum allowed config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

/// Top-level runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Storage root; packages live under `<root_dir>/plugins/`.
    pub root_dir: PathBuf,
    /// Host version checked against manifest bounds. Unset disables the
    /// check.
    pub host_version: Option<String>,
    /// Enable plugins as soon as they load.
    pub activate_on_load: bool,
    /// Remember enable/disable choices in `<root_dir>/plugin_states.toml`.
    pub persist_enablement: bool,
    /// Package integrity settings.
    pub integrity: IntegrityConfig,
    /// WASM backend limits.
    pub wasm: WasmSection,
    /// Archive reading limits.
    pub limits: LimitsSection,
    /// Capability gate additions.
    pub gate: GateSection,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            host_version: None,
            activate_on_load: false,
            persist_enablement: false,
            integrity: IntegrityConfig::default(),
            wasm: WasmSection::default(),
            limits: LimitsSection::default(),
            gate: GateSection::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Package integrity settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    /// Reject packages whose id has no pinned digest.
    pub require_pin: bool,
    /// Plugin id → blake3 hex digest of its package file.
    pub pins: BTreeMap<String, String>,
}

/// WASM backend limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WasmSection {
    /// Linear memory cap per instance.
    pub max_memory_bytes: u64,
    /// Per-call timeout.
    pub timeout_secs: u64,
    /// Require a `.blake3` digest next to every WASM module.
    pub require_hash: bool,
}

impl Default for WasmSection {
    fn default() -> Self {
        Self {
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            timeout_secs: DEFAULT_MAX_EXECUTION_TIME.as_secs(),
            require_hash: false,
        }
    }
}

/// Archive reading limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    /// Largest package file accepted.
    pub max_package_bytes: u64,
    /// Largest total unpacked size accepted.
    pub max_unpacked_bytes: u64,
    /// Most archive entries accepted.
    pub max_entries: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_package_bytes: DEFAULT_MAX_PACKAGE_BYTES,
            max_unpacked_bytes: DEFAULT_MAX_UNPACKED_BYTES,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

/// Additions to the default capability gate policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSection {
    /// Extra always-allowed namespaces.
    pub extra_allow_prefixes: Vec<String>,
    /// Extra never-allowed namespaces.
    pub extra_deny_prefixes: Vec<String>,
    /// Extra sensitive symbols and the permissions that unlock them.
    pub extra_sensitive: BTreeMap<String, Vec<Permission>>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl RuntimeConfig {
    /// Load and validate a TOML config file.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Config`] if the file is too large, unreadable,
    /// malformed or fails [`validate`](Self::validate).
    pub fn load(path: &Path) -> PluginResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PluginError::Config(format!("{}: {e}", path.display())))?;
        if content.len() as u64 > MAX_CONFIG_FILE_SIZE {
            return Err(PluginError::Config(format!(
                "{}: config file is {} bytes, exceeding the {MAX_CONFIG_FILE_SIZE} byte limit",
                path.display(),
                content.len()
            )));
        }
        let config = Self::from_toml_str(&content)
            .map_err(|e| PluginError::Config(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "Loaded runtime config");
        Ok(config)
    }

    /// Parse and validate TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Config`] if parsing or validation fails.
    pub fn from_toml_str(content: &str) -> PluginResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| PluginError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply [`ENV_ROOT_DIR`] and [`ENV_HOST_VERSION`] from the process
    /// environment.
    #[must_use]
    pub fn from_env(self) -> Self {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps variable names to values.
    /// Blank values are ignored.
    #[must_use]
    pub fn apply_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let present = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(root) = present(ENV_ROOT_DIR) {
            debug!(root_dir = %root, "Root directory overridden from environment");
            self.root_dir = PathBuf::from(root);
        }
        if let Some(version) = present(ENV_HOST_VERSION) {
            debug!(host_version = %version, "Host version overridden from environment");
            self.host_version = Some(version.trim().to_string());
        }
        self
    }

    /// Check limits, versions and pins.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Config`] describing the first problem.
    pub fn validate(&self) -> PluginResult<()> {
        if self.limits.max_package_bytes == 0
            || self.limits.max_unpacked_bytes == 0
            || self.limits.max_entries == 0
        {
            return Err(PluginError::Config("archive limits must be non-zero".into()));
        }
        if self.wasm.max_memory_bytes == 0 || self.wasm.timeout_secs == 0 {
            return Err(PluginError::Config("wasm limits must be non-zero".into()));
        }
        self.host_version()?;
        for (id, digest) in &self.integrity.pins {
            PluginId::new(id.as_str())
                .map_err(|e| PluginError::Config(format!("integrity pin: {e}")))?;
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(PluginError::Config(format!(
                    "integrity pin for {id} is not a blake3 hex digest"
                )));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Derived components
    // -----------------------------------------------------------------------

    /// The configured host version, parsed leniently.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Config`] if the version is malformed.
    pub fn host_version(&self) -> PluginResult<Option<Version>> {
        self.host_version
            .as_deref()
            .map(|v| {
                parse_lenient(v)
                    .map_err(|e| PluginError::Config(format!("host_version {v:?}: {e}")))
            })
            .transpose()
    }

    /// The default gate policy plus the configured additions.
    #[must_use]
    pub fn gate_policy(&self) -> GatePolicy {
        let mut policy = GatePolicy::default();
        for prefix in &self.gate.extra_allow_prefixes {
            policy = policy.with_allow_prefix(prefix.clone());
        }
        for (symbol, permissions) in &self.gate.extra_sensitive {
            policy = policy.with_sensitive(symbol.clone(), permissions);
        }
        for prefix in &self.gate.extra_deny_prefixes {
            policy = policy.with_deny_prefix(prefix.clone());
        }
        policy
    }

    /// Archive limits.
    #[must_use]
    pub fn archive_limits(&self) -> ArchiveLimits {
        ArchiveLimits {
            max_entries: self.limits.max_entries,
            max_unpacked_bytes: self.limits.max_unpacked_bytes,
            max_package_bytes: self.limits.max_package_bytes,
        }
    }

    /// The integrity verifier implied by the `integrity` section.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Config`] if a pinned id is malformed.
    pub fn integrity_verifier(&self) -> PluginResult<Arc<dyn IntegrityVerifier>> {
        if self.integrity.pins.is_empty() && !self.integrity.require_pin {
            return Ok(Arc::new(NonEmptyFile));
        }
        let mut verifier = Blake3Verifier::new().require_pin(self.integrity.require_pin);
        for (id, digest) in &self.integrity.pins {
            let id = PluginId::new(id.as_str())
                .map_err(|e| PluginError::Config(format!("integrity pin: {e}")))?;
            verifier = verifier.pin(id, digest.clone());
        }
        Ok(Arc::new(verifier))
    }

    /// A WASM backend with the configured limits.
    #[must_use]
    pub fn wasm_backend(&self) -> WasmModuleBackend {
        WasmModuleBackend::new()
            .with_memory_limit(self.wasm.max_memory_bytes)
            .with_timeout(Duration::from_secs(self.wasm.timeout_secs))
            .with_require_hash(self.wasm.require_hash)
    }
}

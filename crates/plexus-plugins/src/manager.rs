//! Plugin runtime manager.
//!
//! [`PluginManager`] is the single entry point a host uses. It owns the
//! plugin table and drives each plugin through
//! `Discovered -> Loaded -> Active <-> Disabled -> Unloaded`.
//!
//! Each plugin id has a slot guarded by its own mutex. The slot map is only
//! touched briefly to find or create a slot, and slots are never removed, so
//! operations on different ids run in parallel while operations on the same
//! id serialize. A separate catalog mirrors each slot's state and metadata
//! so snapshots never wait on a plugin callback.
//!
//! Every plugin callback runs behind [`std::panic::catch_unwind`]. Panics and
//! errors are logged and turned into typed results; nothing a plugin does
//! propagates into the host.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use semver::Version;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::ModuleBackend;
use crate::config::RuntimeConfig;
use crate::context::ExtensionContext;
use crate::discovery::{DiscoveredPackage, discover_packages, order_by_dependencies};
use crate::enablement::EnablementStore;
use crate::error::{PluginError, PluginResult};
use crate::extension::{
    Contribution, DocumentationEntry, EditorTabContribution, ExtensionPoint, MenuItem,
    NavigationItem, TabContribution,
};
use crate::gate::{CapabilityGate, GatePolicy};
use crate::host::HostNamespace;
use crate::integrity::IntegrityVerifier;
use crate::loader::{IsolatedLoader, LoaderEnv, LoaderStats};
use crate::manifest::ManifestDescriptor;
use crate::native::{NativeModuleBackend, NativeModuleTable};
use crate::package::{ArchiveLimits, PackageArchive, PackageEncoding, PackageHandle};
use crate::parser::parse_package;
use crate::permission::Permission;
use crate::plugin::{ExtensionPlugin, LifecycleState, PluginId};
use crate::registry::CapabilityRegistry;
use crate::resources::ResourceAccessor;
use crate::storage;
use crate::validator::PackageValidator;
use crate::wasm::WasmModuleBackend;

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Read-only view of a loaded plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginInfo {
    /// Plugin id.
    pub id: PluginId,
    /// Display name.
    pub name: String,
    /// Plugin version.
    pub version: String,
    /// Description.
    pub description: String,
    /// Author.
    pub author: String,
    /// Lifecycle state when the snapshot was taken.
    pub state: LifecycleState,
    /// Granted permissions, sorted.
    pub permissions: Vec<Permission>,
    /// Declared dependencies.
    pub dependencies: Vec<PluginId>,
    /// Declared extension points.
    pub extensions: Vec<ExtensionPoint>,
    /// Encoding the package was read with.
    pub encoding: PackageEncoding,
    /// Package file the plugin was loaded from.
    pub package_path: PathBuf,
    /// When this instance was loaded.
    pub loaded_at: DateTime<Utc>,
    /// Id of the plugin's isolated loader instance.
    pub loader_instance: Uuid,
}

/// Outcome of [`PluginManager::load_all`].
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Plugins loaded, in load order.
    pub loaded: Vec<PluginId>,
    /// Packages that failed discovery or loading.
    pub failed: Vec<(PathBuf, PluginError)>,
}

/// UI contributions from every active plugin, each list sorted by `order`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UiContributions {
    /// Menu items.
    pub menu_items: Vec<Contribution<MenuItem>>,
    /// Top-level tabs.
    pub tabs: Vec<Contribution<TabContribution>>,
    /// Navigation entries.
    pub navigation: Vec<Contribution<NavigationItem>>,
}

// ---------------------------------------------------------------------------
// Plugin table
// ---------------------------------------------------------------------------

struct LoadedPlugin {
    instance: Box<dyn ExtensionPlugin>,
    manifest: ManifestDescriptor,
    loader: Arc<IsolatedLoader>,
    // Kept alive with the instance; plugins hold their own clone.
    _context: ExtensionContext,
    handle: PackageHandle,
    loaded_at: DateTime<Utc>,
}

impl LoadedPlugin {
    fn info(&self, state: LifecycleState) -> PluginInfo {
        let m = &self.manifest;
        PluginInfo {
            id: m.id().clone(),
            name: m.name().to_string(),
            version: m.version().to_string(),
            description: m.description().to_string(),
            author: m.author().to_string(),
            state,
            permissions: m.permissions().iter().copied().collect(),
            dependencies: m.dependencies().to_vec(),
            extensions: m.extensions().to_vec(),
            encoding: self.handle.encoding(),
            package_path: self.handle.path().to_path_buf(),
            loaded_at: self.loaded_at,
            loader_instance: self.loader.instance_id(),
        }
    }
}

struct PluginSlot {
    state: LifecycleState,
    loaded: Option<LoadedPlugin>,
}

#[derive(Clone)]
struct CatalogEntry {
    state: LifecycleState,
    info: Option<PluginInfo>,
}

/// Why a guarded plugin call failed.
enum CallFailure {
    Error(PluginError),
    Panicked(String),
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(e) => write!(f, "{e}"),
            Self::Panicked(message) => write!(f, "panicked: {message}"),
        }
    }
}

/// Run a plugin callback behind a panic boundary.
fn guarded<T>(
    plugin_id: &PluginId,
    callback: &'static str,
    call: impl FnOnce() -> PluginResult<T>,
) -> Result<T, CallFailure> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            warn!(plugin_id = %plugin_id, callback, error = %e, "Plugin callback failed");
            Err(CallFailure::Error(e))
        },
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(plugin_id = %plugin_id, callback, panic = %message, "Plugin callback panicked");
            Err(CallFailure::Panicked(message))
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Drop a plugin instance; a panicking `Drop` is logged and contained.
fn drop_instance(plugin_id: &PluginId, instance: Box<dyn ExtensionPlugin>) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(move || drop(instance))) {
        error!(
            plugin_id = %plugin_id,
            panic = %panic_message(payload.as_ref()),
            "Plugin panicked while being dropped"
        );
    }
}

fn lock_slot(slot: &Mutex<PluginSlot>) -> MutexGuard<'_, PluginSlot> {
    slot.lock().unwrap_or_else(|poisoned| {
        warn!("Plugin slot mutex poisoned, recovering");
        PoisonError::into_inner(poisoned)
    })
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Composes a [`PluginManager`].
pub struct PluginManagerBuilder {
    root: PathBuf,
    limits: ArchiveLimits,
    activate_on_load: bool,
    host: HostNamespace,
    native: NativeModuleTable,
    gate_policy: GatePolicy,
    validator: PackageValidator,
    registry: Option<Arc<CapabilityRegistry>>,
    enablement: Option<EnablementStore>,
    wasm: WasmModuleBackend,
    extra_backends: Vec<Arc<dyn ModuleBackend>>,
}

impl fmt::Debug for PluginManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManagerBuilder")
            .field("root", &self.root)
            .field("activate_on_load", &self.activate_on_load)
            .finish_non_exhaustive()
    }
}

impl PluginManagerBuilder {
    /// Builder storing packages under `root`, with default policy.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            limits: ArchiveLimits::default(),
            activate_on_load: false,
            host: HostNamespace::standard(),
            native: NativeModuleTable::new(),
            gate_policy: GatePolicy::default(),
            validator: PackageValidator::new(),
            registry: None,
            enablement: None,
            wasm: WasmModuleBackend::new(),
            extra_backends: Vec::new(),
        }
    }

    /// Builder configured from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Config`] if the config is invalid.
    pub fn from_config(config: &RuntimeConfig) -> PluginResult<Self> {
        config.validate()?;
        let mut builder = Self::new(config.root_dir.clone())
            .with_limits(config.archive_limits())
            .with_activate_on_load(config.activate_on_load)
            .with_gate_policy(config.gate_policy())
            .with_verifier(config.integrity_verifier()?)
            .with_wasm_backend(config.wasm_backend());
        if let Some(version) = config.host_version()? {
            builder = builder.with_host_version(version);
        }
        if config.persist_enablement {
            builder = builder.with_enablement_store(EnablementStore::open(&config.root_dir)?);
        }
        Ok(builder)
    }

    /// Replace the host namespace. Defaults to [`HostNamespace::standard`].
    #[must_use]
    pub fn with_host_namespace(mut self, host: HostNamespace) -> Self {
        self.host = host;
        self
    }

    /// Table of host-linked plugin factories.
    #[must_use]
    pub fn with_native_modules(mut self, table: NativeModuleTable) -> Self {
        self.native = table;
        self
    }

    /// Capability gate policy.
    #[must_use]
    pub fn with_gate_policy(mut self, policy: GatePolicy) -> Self {
        self.gate_policy = policy;
        self
    }

    /// Package integrity verifier.
    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn IntegrityVerifier>) -> Self {
        self.validator = self.validator.with_verifier(verifier);
        self
    }

    /// Host version checked against manifest bounds.
    #[must_use]
    pub fn with_host_version(mut self, version: Version) -> Self {
        self.validator = self.validator.with_host_version(version);
        self
    }

    /// Share an existing registry instead of creating one.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<CapabilityRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Primary module backend settings.
    #[must_use]
    pub fn with_wasm_backend(mut self, backend: WasmModuleBackend) -> Self {
        self.wasm = backend;
        self
    }

    /// Append a backend tried after the WASM and native backends.
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn ModuleBackend>) -> Self {
        self.extra_backends.push(backend);
        self
    }

    /// Enable plugins as soon as they load.
    #[must_use]
    pub fn with_activate_on_load(mut self, activate: bool) -> Self {
        self.activate_on_load = activate;
        self
    }

    /// Remember enable/disable choices across restarts.
    ///
    /// A plugin with a saved state is enabled on load if it was last
    /// enabled, and left loaded if it was last disabled. Plugins without a
    /// saved state follow [`with_activate_on_load`](Self::with_activate_on_load).
    #[must_use]
    pub fn with_enablement_store(mut self, store: EnablementStore) -> Self {
        self.enablement = Some(store);
        self
    }

    /// Archive reading limits.
    #[must_use]
    pub fn with_limits(mut self, limits: ArchiveLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Build the manager.
    #[must_use]
    pub fn build(self) -> PluginManager {
        let mut backends: Vec<Arc<dyn ModuleBackend>> = vec![
            Arc::new(self.wasm),
            Arc::new(NativeModuleBackend::new(self.native)),
        ];
        backends.extend(self.extra_backends);
        let loader_env = LoaderEnv::new(
            Arc::new(self.host),
            CapabilityGate::new(self.gate_policy),
            backends,
        );
        info!(root = %self.root.display(), "Plugin manager created");
        PluginManager {
            root: self.root,
            limits: self.limits,
            activate_on_load: self.activate_on_load,
            validator: self.validator,
            loader_env,
            registry: self.registry.unwrap_or_default(),
            enablement: self.enablement,
            slots: DashMap::new(),
            catalog: DashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Owns the plugin table and drives plugin lifecycles.
pub struct PluginManager {
    root: PathBuf,
    limits: ArchiveLimits,
    activate_on_load: bool,
    validator: PackageValidator,
    loader_env: LoaderEnv,
    registry: Arc<CapabilityRegistry>,
    enablement: Option<EnablementStore>,
    slots: DashMap<PluginId, Arc<Mutex<PluginSlot>>>,
    catalog: DashMap<PluginId, CatalogEntry>,
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManager")
            .field("root", &self.root)
            .field("plugins", &self.catalog.len())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl PluginManager {
    /// Start composing a manager that stores packages under `root`.
    #[must_use]
    pub fn builder(root: impl Into<PathBuf>) -> PluginManagerBuilder {
        PluginManagerBuilder::new(root)
    }

    /// Storage root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Parse, validate, instantiate and initialize the package at `path`.
    ///
    /// On success the plugin is `Loaded`, or `Active` if its saved state
    /// (or, without one, activate-on-load) says so.
    ///
    /// # Errors
    ///
    /// - Parser and validator errors, before any code is loaded.
    /// - [`PluginError::AlreadyLoaded`] if the id is loaded.
    /// - Loader errors resolving the entry point.
    /// - [`PluginError::InitializationFailed`] if instantiation panics or
    ///   `initialize` fails or panics. Nothing is inserted in that case.
    pub fn load_plugin(&self, path: &Path) -> PluginResult<PluginId> {
        let parsed = parse_package(path, &self.limits)?;
        let manifest = self
            .validator
            .validate(&parsed.handle, &parsed.bytes, parsed.manifest)?;
        let id = manifest.id().clone();

        let slot = self.slot(&id);
        let mut guard = lock_slot(&slot);
        if guard.state.is_loaded() {
            debug!(plugin_id = %id, state = %guard.state, "Rejected load of loaded plugin");
            return Err(PluginError::AlreadyLoaded(id));
        }

        self.warn_missing_dependencies(&manifest);
        let loaded = self.instantiate(manifest, parsed.handle, parsed.archive)?;
        guard.loaded = Some(loaded);
        guard.state = LifecycleState::Loaded;
        self.publish(&id, &guard);
        info!(plugin_id = %id, "Plugin loaded");

        if self.should_activate_on_load(&id)
            && let Err(e) = self.activate_locked(&id, &mut guard)
        {
            warn!(plugin_id = %id, error = %e, "Activation on load failed, plugin stays loaded");
        }
        Ok(id)
    }

    /// Enable a plugin. Returns `false` on any failure.
    pub fn enable_plugin(&self, id: &PluginId) -> bool {
        self.try_enable_plugin(id).is_ok()
    }

    /// Enable a plugin: `Loaded | Disabled -> Active`.
    ///
    /// Enabling an active plugin succeeds without calling `activate` again.
    ///
    /// # Errors
    ///
    /// - [`PluginError::NotFound`] for an unknown id.
    /// - [`PluginError::InvalidState`] unless the plugin is loaded.
    /// - [`PluginError::ActivationFailed`] if `activate` fails or panics; the
    ///   state is unchanged.
    pub fn try_enable_plugin(&self, id: &PluginId) -> PluginResult<()> {
        let slot = self.existing_slot(id)?;
        let mut guard = lock_slot(&slot);
        match guard.state {
            LifecycleState::Active => {},
            LifecycleState::Loaded | LifecycleState::Disabled => self.activate_locked(id, &mut guard)?,
            state => {
                return Err(PluginError::InvalidState {
                    plugin_id: id.clone(),
                    state,
                    operation: "enable",
                });
            },
        }
        self.remember(id, true);
        Ok(())
    }

    /// Disable a plugin. Returns `false` on any failure.
    pub fn disable_plugin(&self, id: &PluginId) -> bool {
        self.try_disable_plugin(id).is_ok()
    }

    /// Disable a plugin: `Active -> Disabled`.
    ///
    /// `deactivate` is best-effort: the plugin ends up `Disabled` even if it
    /// fails or panics. Disabling a disabled plugin succeeds.
    ///
    /// # Errors
    ///
    /// - [`PluginError::NotFound`] for an unknown id.
    /// - [`PluginError::InvalidState`] unless the plugin is active or
    ///   disabled.
    pub fn try_disable_plugin(&self, id: &PluginId) -> PluginResult<()> {
        let slot = self.existing_slot(id)?;
        let mut guard = lock_slot(&slot);
        match guard.state {
            LifecycleState::Disabled => {},
            LifecycleState::Active => {
                if let Some(loaded) = guard.loaded.as_mut() {
                    let instance = &mut loaded.instance;
                    // Failure already logged by `guarded`.
                    let _ = guarded(id, "deactivate", || instance.deactivate());
                }
                guard.state = LifecycleState::Disabled;
                self.publish(id, &guard);
                info!(plugin_id = %id, "Plugin disabled");
            },
            state => {
                return Err(PluginError::InvalidState {
                    plugin_id: id.clone(),
                    state,
                    operation: "disable",
                });
            },
        }
        self.remember(id, false);
        Ok(())
    }

    /// Tear a plugin down and drop its instance.
    ///
    /// Runs `deactivate` (if active) and `dispose`, both best-effort, then
    /// closes the plugin's loader. Returns `false` if the id isn't loaded.
    pub fn unload_plugin(&self, id: &PluginId) -> bool {
        let Some(slot) = self.slots.get(id).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        let mut guard = lock_slot(&slot);
        self.unload_locked(id, &mut guard)
    }

    fn unload_locked(&self, id: &PluginId, guard: &mut PluginSlot) -> bool {
        let was_active = guard.state == LifecycleState::Active;
        let Some(mut loaded) = guard.loaded.take() else {
            return false;
        };

        if was_active {
            let instance = &mut loaded.instance;
            let _ = guarded(id, "deactivate", || instance.deactivate());
        }
        let instance = &mut loaded.instance;
        let _ = guarded(id, "dispose", || instance.dispose());
        loaded.loader.teardown();
        drop_instance(id, loaded.instance);

        guard.state = LifecycleState::Unloaded;
        self.publish(id, guard);
        info!(plugin_id = %id, "Plugin unloaded");
        true
    }

    /// Unload every loaded plugin. Returns how many were unloaded.
    pub fn shutdown(&self) -> usize {
        let ids = self.slot_ids();
        let unloaded = ids.iter().filter(|id| self.unload_plugin(id)).count();
        info!(unloaded, "Plugin manager shut down");
        unloaded
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Snapshot of every loaded plugin, sorted by id.
    #[must_use]
    pub fn get_all_plugins(&self) -> Vec<PluginInfo> {
        let mut infos: Vec<PluginInfo> = self
            .catalog
            .iter()
            .filter(|entry| entry.state.is_loaded())
            .filter_map(|entry| entry.info.clone())
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Current state of an id, if the manager has seen it.
    #[must_use]
    pub fn plugin_state(&self, id: &PluginId) -> Option<LifecycleState> {
        self.catalog.get(id).map(|entry| entry.state)
    }

    /// Snapshot of one loaded plugin.
    #[must_use]
    pub fn plugin_info(&self, id: &PluginId) -> Option<PluginInfo> {
        self.catalog
            .get(id)
            .filter(|entry| entry.state.is_loaded())
            .and_then(|entry| entry.info.clone())
    }

    /// The registry shared by the host and every plugin.
    #[must_use]
    pub fn capability_registry(&self) -> Arc<CapabilityRegistry> {
        Arc::clone(&self.registry)
    }

    /// Loader creation and teardown counters.
    #[must_use]
    pub fn loader_stats(&self) -> Arc<LoaderStats> {
        Arc::clone(self.loader_env.stats())
    }

    // -----------------------------------------------------------------------
    // Storage
    // -----------------------------------------------------------------------

    /// Scan storage for packages without loading code.
    ///
    /// Ids the manager hasn't seen yet are recorded as `Discovered`.
    /// Unreadable packages are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the plugins directory can't be listed.
    pub fn discover(&self) -> PluginResult<Vec<DiscoveredPackage>> {
        let (found, _errors) = discover_packages(&self.root, &self.limits)?;
        self.mark_discovered(&found);
        Ok(found)
    }

    /// Load every discovered package, dependencies first.
    ///
    /// Packages that are already loaded are skipped. A failure never stops
    /// the remaining loads.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the plugins directory can't be listed.
    pub fn load_all(&self) -> PluginResult<LoadReport> {
        let (found, errors) = discover_packages(&self.root, &self.limits)?;
        self.mark_discovered(&found);
        let mut report = LoadReport {
            loaded: Vec::new(),
            failed: errors,
        };

        for package in order_by_dependencies(found) {
            if self.plugin_state(&package.id).is_some_and(LifecycleState::is_loaded) {
                debug!(plugin_id = %package.id, "Already loaded, skipping");
                continue;
            }
            match self.load_plugin(&package.path) {
                Ok(id) => report.loaded.push(id),
                Err(e) => {
                    warn!(path = %package.path.display(), error = %e, "Failed to load plugin");
                    report.failed.push((package.path, e));
                },
            }
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "Loaded discovered plugins"
        );
        Ok(report)
    }

    /// Validate the package at `source` and copy it into storage.
    ///
    /// The plugin is not loaded.
    ///
    /// # Errors
    ///
    /// Parser and validator errors, [`PluginError::AlreadyLoaded`] if the id
    /// is loaded, or an I/O error while copying.
    pub fn install_package(&self, source: &Path) -> PluginResult<PluginId> {
        let parsed = parse_package(source, &self.limits)?;
        let manifest = self
            .validator
            .validate(&parsed.handle, &parsed.bytes, parsed.manifest)?;
        let id = manifest.id().clone();

        let slot = self.slot(&id);
        let guard = lock_slot(&slot);
        if guard.state.is_loaded() {
            return Err(PluginError::AlreadyLoaded(id));
        }
        storage::install_package(&self.root, &id, &parsed.bytes)?;
        self.catalog.insert(id.clone(), CatalogEntry {
            state: LifecycleState::Discovered,
            info: None,
        });
        drop(guard);
        Ok(id)
    }

    /// Unload a plugin and delete its directory, package and data included.
    /// Its saved enablement state, if any, is forgotten.
    ///
    /// The id's slot stays locked throughout, so a concurrent load of the
    /// same id runs entirely before or entirely after.
    ///
    /// Returns whether anything was deleted from storage.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory can't be removed, or a state
    /// file error if the saved state can't be updated.
    pub fn uninstall_plugin(&self, id: &PluginId) -> PluginResult<bool> {
        let slot = self.slot(id);
        let mut guard = lock_slot(&slot);
        self.unload_locked(id, &mut guard);
        let removed = storage::remove_plugin_dir(&self.root, id)?;
        self.catalog.remove(id);
        if let Some(store) = &self.enablement {
            store.remove(id)?;
        }
        drop(guard);
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Extension points
    // -----------------------------------------------------------------------

    /// UI contributions of every active plugin.
    #[must_use]
    pub fn ui_contributions(&self) -> UiContributions {
        let mut out = UiContributions::default();
        self.visit_active("ui_contributions", |id, plugin| {
            if let Some(ui) = plugin.as_ui() {
                out.menu_items
                    .extend(ui.menu_items().into_iter().map(|item| Contribution {
                        plugin_id: id.clone(),
                        item,
                    }));
                out.tabs.extend(ui.tabs().into_iter().map(|item| Contribution {
                    plugin_id: id.clone(),
                    item,
                }));
                out.navigation
                    .extend(ui.navigation_items().into_iter().map(|item| Contribution {
                        plugin_id: id.clone(),
                        item,
                    }));
            }
        });
        out.menu_items.sort_by_key(|c| c.item.order);
        out.tabs.sort_by_key(|c| c.item.order);
        out.navigation.sort_by_key(|c| c.item.order);
        out
    }

    /// Editor tabs of every active plugin.
    #[must_use]
    pub fn editor_tab_contributions(&self) -> Vec<Contribution<EditorTabContribution>> {
        let mut out = Vec::new();
        self.visit_active("editor_tab_contributions", |id, plugin| {
            if let Some(tabs) = plugin.as_editor_tab() {
                out.extend(tabs.editor_tabs().into_iter().map(|item| Contribution {
                    plugin_id: id.clone(),
                    item,
                }));
            }
        });
        out
    }

    /// Editor tabs able to open `path`.
    #[must_use]
    pub fn editor_tabs_for(&self, path: &Path) -> Vec<Contribution<EditorTabContribution>> {
        self.editor_tab_contributions()
            .into_iter()
            .filter(|c| c.item.handles(path))
            .collect()
    }

    /// Documentation of every active plugin.
    #[must_use]
    pub fn documentation(&self) -> Vec<Contribution<DocumentationEntry>> {
        let mut out = Vec::new();
        self.visit_active("documentation", |id, plugin| {
            if let Some(docs) = plugin.as_documentation() {
                out.extend(docs.documentation().into_iter().map(|item| Contribution {
                    plugin_id: id.clone(),
                    item,
                }));
            }
        });
        out
    }

    /// Active plugins implementing `point`, sorted by id.
    #[must_use]
    pub fn plugins_supporting(&self, point: ExtensionPoint) -> Vec<PluginId> {
        let mut out = Vec::new();
        self.visit_active("plugins_supporting", |id, plugin| {
            let supported = match point {
                ExtensionPoint::Ui => plugin.as_ui().is_some(),
                ExtensionPoint::EditorTab => plugin.as_editor_tab().is_some(),
                ExtensionPoint::Documentation => plugin.as_documentation().is_some(),
                ExtensionPoint::Editor => plugin.as_editor().is_some(),
                ExtensionPoint::Project => plugin.as_project().is_some(),
            };
            if supported {
                out.push(id.clone());
            }
        });
        out
    }

    /// Tell active editor extensions a file was opened.
    pub fn notify_file_opened(&self, path: &Path) {
        self.visit_active("on_file_opened", |_, plugin| {
            if let Some(editor) = plugin.as_editor() {
                editor.on_file_opened(path);
            }
        });
    }

    /// Tell active editor extensions a file was saved.
    pub fn notify_file_saved(&self, path: &Path) {
        self.visit_active("on_file_saved", |_, plugin| {
            if let Some(editor) = plugin.as_editor() {
                editor.on_file_saved(path);
            }
        });
    }

    /// Tell active editor extensions a file was closed.
    pub fn notify_file_closed(&self, path: &Path) {
        self.visit_active("on_file_closed", |_, plugin| {
            if let Some(editor) = plugin.as_editor() {
                editor.on_file_closed(path);
            }
        });
    }

    /// Tell active project extensions a project was opened.
    pub fn notify_project_opened(&self, root: &Path) {
        self.visit_active("on_project_opened", |_, plugin| {
            if let Some(project) = plugin.as_project() {
                project.on_project_opened(root);
            }
        });
    }

    /// Tell active project extensions the project was closed.
    pub fn notify_project_closed(&self) {
        self.visit_active("on_project_closed", |_, plugin| {
            if let Some(project) = plugin.as_project() {
                project.on_project_closed();
            }
        });
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn slot(&self, id: &PluginId) -> Arc<Mutex<PluginSlot>> {
        Arc::clone(
            self.slots
                .entry(id.clone())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(PluginSlot {
                        state: LifecycleState::Discovered,
                        loaded: None,
                    }))
                })
                .value(),
        )
    }

    fn existing_slot(&self, id: &PluginId) -> PluginResult<Arc<Mutex<PluginSlot>>> {
        self.slots
            .get(id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| PluginError::NotFound(id.clone()))
    }

    fn slot_ids(&self) -> Vec<PluginId> {
        let mut ids: Vec<PluginId> = self.slots.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Mirror a slot into the catalog. Call with the slot locked.
    fn publish(&self, id: &PluginId, slot: &PluginSlot) {
        self.catalog.insert(id.clone(), CatalogEntry {
            state: slot.state,
            info: slot.loaded.as_ref().map(|l| l.info(slot.state)),
        });
    }

    fn mark_discovered(&self, found: &[DiscoveredPackage]) {
        for package in found {
            self.catalog
                .entry(package.id.clone())
                .or_insert_with(|| CatalogEntry {
                    state: LifecycleState::Discovered,
                    info: None,
                });
        }
    }

    fn should_activate_on_load(&self, id: &PluginId) -> bool {
        self.enablement
            .as_ref()
            .and_then(|store| store.get(id))
            .unwrap_or(self.activate_on_load)
    }

    /// Save an enablement choice. Failure is logged; the transition stands.
    fn remember(&self, id: &PluginId, enabled: bool) {
        if let Some(store) = &self.enablement
            && let Err(e) = store.set(id, enabled)
        {
            warn!(plugin_id = %id, error = %e, "Failed to save plugin state");
        }
    }

    fn warn_missing_dependencies(&self, manifest: &ManifestDescriptor) {
        for dep in manifest.dependencies() {
            if !self.plugin_state(dep).is_some_and(LifecycleState::is_loaded) {
                warn!(plugin_id = %manifest.id(), dependency = %dep, "Dependency is not loaded");
            }
        }
    }

    fn instantiate(
        &self,
        manifest: ManifestDescriptor,
        handle: PackageHandle,
        archive: Arc<PackageArchive>,
    ) -> PluginResult<LoadedPlugin> {
        let id = manifest.id().clone();
        let loader = Arc::new(self.loader_env.create_loader(
            id.clone(),
            manifest.permissions().clone(),
            Arc::clone(&archive),
        ));
        let init_failed = |message: String| {
            loader.teardown();
            PluginError::InitializationFailed {
                plugin_id: id.clone(),
                message,
            }
        };

        let mut instance = match guarded(&id, "instantiate", || {
            loader.instantiate_entry_point(manifest.entry_point())
        }) {
            Ok(instance) => instance,
            Err(CallFailure::Error(e)) => {
                loader.teardown();
                return Err(e);
            },
            Err(failure @ CallFailure::Panicked(_)) => return Err(init_failed(failure.to_string())),
        };

        let fresh_data_dir = !storage::plugin_data_dir(&self.root, &id).is_dir();
        let data_dir = match storage::ensure_plugin_data_dir(&self.root, &id) {
            Ok(dir) => dir,
            Err(e) => {
                drop_instance(&id, instance);
                return Err(init_failed(format!("cannot create data directory: {e}")));
            },
        };

        let resources = ResourceAccessor::new(
            id.clone(),
            &data_dir,
            manifest.permissions().clone(),
            archive,
        );
        let context = ExtensionContext::new(
            Arc::clone(&self.registry),
            resources,
            Arc::clone(&loader),
        );

        if let Err(failure) = guarded(&id, "initialize", || instance.initialize(&context)) {
            drop_instance(&id, instance);
            if fresh_data_dir && let Err(e) = std::fs::remove_dir_all(&data_dir) {
                debug!(plugin_id = %id, error = %e, "Could not remove data directory");
            }
            return Err(init_failed(failure.to_string()));
        }

        Ok(LoadedPlugin {
            instance,
            manifest,
            loader,
            _context: context,
            handle,
            loaded_at: Utc::now(),
        })
    }

    fn activate_locked(&self, id: &PluginId, slot: &mut PluginSlot) -> PluginResult<()> {
        let Some(loaded) = slot.loaded.as_mut() else {
            return Err(PluginError::InvalidState {
                plugin_id: id.clone(),
                state: slot.state,
                operation: "enable",
            });
        };
        let instance = &mut loaded.instance;
        guarded(id, "activate", || instance.activate()).map_err(|failure| {
            PluginError::ActivationFailed {
                plugin_id: id.clone(),
                message: failure.to_string(),
            }
        })?;
        slot.state = LifecycleState::Active;
        self.publish(id, slot);
        info!(plugin_id = %id, "Plugin enabled");
        Ok(())
    }

    /// Run `visit` on every active plugin, in id order, each behind its own
    /// panic boundary.
    fn visit_active<F>(&self, what: &'static str, mut visit: F)
    where
        F: FnMut(&PluginId, &mut dyn ExtensionPlugin),
    {
        for id in self.slot_ids() {
            let Some(slot) = self.slots.get(&id).map(|s| Arc::clone(s.value())) else {
                continue;
            };
            let mut guard = lock_slot(&slot);
            if guard.state != LifecycleState::Active {
                continue;
            }
            let Some(loaded) = guard.loaded.as_mut() else {
                continue;
            };
            let instance = loaded.instance.as_mut();
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| visit(&id, instance))) {
                error!(
                    plugin_id = %id,
                    callback = what,
                    panic = %panic_message(payload.as_ref()),
                    "Extension callback panicked"
                );
            }
        }
    }
}

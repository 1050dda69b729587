//! Per-plugin isolated loader.
//!
//! Every loaded plugin gets its own [`IsolatedLoader`]. A symbol is resolved
//! through, in order:
//!
//! 1. the host's public exports (never gated),
//! 2. the [`CapabilityGate`], which may deny outright,
//! 3. the host's gated primitives,
//! 4. the plugin's own package, through each [`ModuleBackend`] in turn.
//!
//! Units resolved from the package are cached for the loader's lifetime.
//! [`IsolatedLoader::teardown`] drops the cache and closes the loader.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{ModuleBackend, ModuleRequest, ModuleUnit};
use crate::error::{PluginError, PluginResult};
use crate::gate::{CapabilityGate, GateDecision};
use crate::host::{HostNamespace, HostSymbol};
use crate::package::PackageArchive;
use crate::permission::PermissionSet;
use crate::plugin::{ExtensionPlugin, PluginId};

/// Directory inside a package that holds bundled resources.
pub const RESOURCES_DIR: &str = "resources";

/// Counters shared by every loader created from one [`LoaderEnv`].
#[derive(Debug, Default)]
pub struct LoaderStats {
    created: AtomicU64,
    torn_down: AtomicU64,
}

impl LoaderStats {
    /// Loaders created so far.
    #[must_use]
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Loaders torn down so far.
    #[must_use]
    pub fn torn_down(&self) -> u64 {
        self.torn_down.load(Ordering::Relaxed)
    }

    /// Loaders currently open.
    #[must_use]
    pub fn live(&self) -> u64 {
        self.created().saturating_sub(self.torn_down())
    }
}

/// Everything the manager hands to each new loader.
#[derive(Clone)]
pub struct LoaderEnv {
    host: Arc<HostNamespace>,
    gate: CapabilityGate,
    backends: Vec<Arc<dyn ModuleBackend>>,
    stats: Arc<LoaderStats>,
}

impl fmt::Debug for LoaderEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderEnv")
            .field("host", &self.host)
            .field("gate", &self.gate)
            .field(
                "backends",
                &self.backends.iter().map(|b| b.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl LoaderEnv {
    /// Environment with the given host namespace, gate and backends, tried
    /// in the order given.
    #[must_use]
    pub fn new(
        host: Arc<HostNamespace>,
        gate: CapabilityGate,
        backends: Vec<Arc<dyn ModuleBackend>>,
    ) -> Self {
        Self {
            host,
            gate,
            backends,
            stats: Arc::new(LoaderStats::default()),
        }
    }

    /// Shared loader counters.
    #[must_use]
    pub fn stats(&self) -> &Arc<LoaderStats> {
        &self.stats
    }

    /// The gate every loader consults.
    #[must_use]
    pub fn gate(&self) -> &CapabilityGate {
        &self.gate
    }

    /// Create a fresh loader for `plugin_id`.
    #[must_use]
    pub fn create_loader(
        &self,
        plugin_id: PluginId,
        permissions: PermissionSet,
        archive: Arc<PackageArchive>,
    ) -> IsolatedLoader {
        self.stats.created.fetch_add(1, Ordering::Relaxed);
        let loader = IsolatedLoader {
            instance_id: Uuid::new_v4(),
            plugin_id,
            permissions,
            archive,
            host: Arc::clone(&self.host),
            gate: self.gate.clone(),
            backends: self.backends.clone(),
            stats: Arc::clone(&self.stats),
            cache: DashMap::new(),
            closed: AtomicBool::new(false),
        };
        debug!(
            plugin_id = %loader.plugin_id,
            loader = %loader.instance_id,
            "Created isolated loader"
        );
        loader
    }
}

/// What a symbol resolved to.
#[derive(Debug, Clone)]
pub enum ResolvedSymbol {
    /// A host export or gated host primitive.
    Host(HostSymbol),
    /// A unit from the plugin's own package.
    Module(Arc<dyn ModuleUnit>),
}

impl ResolvedSymbol {
    /// The host symbol, if this is one.
    #[must_use]
    pub fn as_host(&self) -> Option<&HostSymbol> {
        match self {
            Self::Host(symbol) => Some(symbol),
            Self::Module(_) => None,
        }
    }

    /// The package unit, if this is one.
    #[must_use]
    pub fn as_module(&self) -> Option<&Arc<dyn ModuleUnit>> {
        match self {
            Self::Module(unit) => Some(unit),
            Self::Host(_) => None,
        }
    }
}

/// Resolution boundary for one loaded plugin.
pub struct IsolatedLoader {
    instance_id: Uuid,
    plugin_id: PluginId,
    permissions: PermissionSet,
    archive: Arc<PackageArchive>,
    host: Arc<HostNamespace>,
    gate: CapabilityGate,
    backends: Vec<Arc<dyn ModuleBackend>>,
    stats: Arc<LoaderStats>,
    cache: DashMap<String, Arc<dyn ModuleUnit>>,
    closed: AtomicBool,
}

impl fmt::Debug for IsolatedLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolatedLoader")
            .field("instance_id", &self.instance_id)
            .field("plugin_id", &self.plugin_id)
            .field("permissions", &self.permissions)
            .field("cached", &self.cache.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl IsolatedLoader {
    /// Unique id of this loader instance. A reload gets a new one.
    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// The plugin this loader belongs to.
    #[must_use]
    pub fn plugin_id(&self) -> &PluginId {
        &self.plugin_id
    }

    /// Permissions the gate is checked against.
    #[must_use]
    pub fn permissions(&self) -> &PermissionSet {
        &self.permissions
    }

    /// Whether [`teardown`](Self::teardown) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Symbols currently cached, sorted.
    #[must_use]
    pub fn cached_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.cache.iter().map(|e| e.key().clone()).collect();
        symbols.sort();
        symbols
    }

    /// Resolve `symbol` for this plugin.
    ///
    /// # Errors
    ///
    /// - [`PluginError::LoaderClosed`] after teardown.
    /// - [`PluginError::AccessDenied`] if the gate denies the symbol.
    /// - [`PluginError::SymbolNotFound`] if no backend provides it.
    pub fn resolve(&self, symbol: &str) -> PluginResult<ResolvedSymbol> {
        if self.is_closed() {
            return Err(PluginError::LoaderClosed(self.plugin_id.clone()));
        }

        if let Some(export) = self.host.export(symbol) {
            return Ok(ResolvedSymbol::Host(export.clone()));
        }

        if let GateDecision::Deny { reason } = self.gate.check(symbol, &self.permissions) {
            warn!(
                security_event = true,
                plugin_id = %self.plugin_id,
                symbol = %symbol,
                reason = %reason,
                "Symbol resolution denied"
            );
            return Err(PluginError::access_denied(symbol, reason));
        }

        if let Some(primitive) = self.host.primitive(symbol) {
            return Ok(ResolvedSymbol::Host(primitive.clone()));
        }

        if let Some(unit) = self.cache.get(symbol) {
            return Ok(ResolvedSymbol::Module(Arc::clone(unit.value())));
        }

        let mut attempts = Vec::with_capacity(self.backends.len());
        for backend in &self.backends {
            let request = ModuleRequest {
                plugin_id: &self.plugin_id,
                archive: &self.archive,
                symbol,
            };
            match backend.load_unit(request) {
                Ok(unit) => {
                    debug!(
                        plugin_id = %self.plugin_id,
                        symbol = %symbol,
                        backend = backend.name(),
                        "Resolved package symbol"
                    );
                    let unit = self
                        .cache
                        .entry(symbol.to_string())
                        .or_insert(unit)
                        .value()
                        .clone();
                    return Ok(ResolvedSymbol::Module(unit));
                },
                Err(e) => attempts.push(format!("{}: {e}", backend.name())),
            }
        }

        Err(PluginError::SymbolNotFound {
            symbol: symbol.to_string(),
            attempts,
        })
    }

    /// Resolve `entry_point` and create a plugin instance from it.
    ///
    /// # Errors
    ///
    /// Any resolution error, or [`PluginError::SymbolNotFound`] if the entry
    /// point names a host symbol.
    pub fn instantiate_entry_point(&self, entry_point: &str) -> PluginResult<Box<dyn ExtensionPlugin>> {
        match self.resolve(entry_point)? {
            ResolvedSymbol::Module(unit) => unit.instantiate(),
            ResolvedSymbol::Host(_) => Err(PluginError::SymbolNotFound {
                symbol: entry_point.to_string(),
                attempts: vec!["host symbols are not instantiable".into()],
            }),
        }
    }

    /// Read the bundled resource `resources/<name>` from the package.
    ///
    /// # Errors
    ///
    /// [`PluginError::LoaderClosed`] after teardown, or
    /// [`PluginError::SymbolNotFound`] if the package has no such resource.
    pub fn read_resource(&self, name: &str) -> PluginResult<Vec<u8>> {
        if self.is_closed() {
            return Err(PluginError::LoaderClosed(self.plugin_id.clone()));
        }
        let entry = format!("{RESOURCES_DIR}/{}", name.trim_start_matches('/'));
        self.archive
            .get(&entry)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| PluginError::SymbolNotFound {
                symbol: entry.clone(),
                attempts: vec![format!("package has no {entry}")],
            })
    }

    /// Drop cached units and refuse further resolutions. Idempotent.
    pub fn teardown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = self.cache.len();
        self.cache.clear();
        self.stats.torn_down.fetch_add(1, Ordering::Relaxed);
        debug!(
            plugin_id = %self.plugin_id,
            loader = %self.instance_id,
            dropped,
            "Tore down isolated loader"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExtensionContext;
    use crate::gate::GatePolicy;
    use crate::native::{NativeModuleBackend, NativeModuleTable};
    use crate::package::{ArchiveLimits, PackageEncoding};
    use crate::permission::Permission;
    use crate::testing::PackageBuilder;
    use crate::wasm::WasmModuleBackend;

    struct Noop;

    impl ExtensionPlugin for Noop {
        fn initialize(&mut self, _ctx: &ExtensionContext) -> PluginResult<()> {
            Ok(())
        }
    }

    struct Clock;

    fn env(table: &NativeModuleTable) -> LoaderEnv {
        let host = HostNamespace::standard().with_export("host.api.Clock", Arc::new(Clock));
        LoaderEnv::new(
            Arc::new(host),
            CapabilityGate::new(GatePolicy::default()),
            vec![
                Arc::new(WasmModuleBackend::new()),
                Arc::new(NativeModuleBackend::new(table.clone())),
            ],
        )
    }

    fn archive() -> Arc<PackageArchive> {
        let bytes = PackageBuilder::new("demo")
            .native_unit("demo.Helper")
            .resource("greeting.txt", "hello")
            .build_bytes()
            .unwrap();
        Arc::new(
            PackageArchive::decode(&bytes, PackageEncoding::CompiledArchive, &ArchiveLimits::default())
                .unwrap(),
        )
    }

    fn loader(perms: &[Permission]) -> (IsolatedLoader, LoaderEnv) {
        let table = NativeModuleTable::new();
        let id = PluginId::from_static("demo");
        table.register(id.clone(), "demo.Main", || Box::new(Noop));
        table.register(id.clone(), "demo.Helper", || Box::new(Noop));
        let env = env(&table);
        let loader = env.create_loader(id, perms.iter().copied().collect(), archive());
        (loader, env)
    }

    #[test]
    fn host_exports_bypass_gate() {
        let (loader, _env) = loader(&[]);
        let resolved = loader.resolve("host.api.Clock").unwrap();
        assert!(resolved.as_host().unwrap().downcast::<Clock>().is_some());
    }

    #[test]
    fn sensitive_primitive_needs_permission() {
        let (denied, _env) = loader(&[]);
        let err = denied.resolve("std.net.TcpStream").unwrap_err();
        assert!(matches!(err, PluginError::AccessDenied { ref symbol, .. } if symbol == "std.net.TcpStream"));

        let (allowed, _env) = loader(&[Permission::NetworkAccess]);
        assert!(allowed.resolve("std.net.TcpStream").unwrap().as_host().is_some());
    }

    #[test]
    fn denylisted_namespace_rejected_with_every_permission() {
        let (loader, _env) = loader(&Permission::ALL);
        assert!(matches!(
            loader.resolve("host.internal.PluginTable"),
            Err(PluginError::AccessDenied { .. })
        ));
    }

    #[test]
    fn package_units_resolve_through_secondary_backend_and_cache() {
        let (loader, _env) = loader(&[]);
        let unit = loader.resolve("demo.Helper").unwrap();
        assert_eq!(unit.as_module().unwrap().backend(), "native");
        assert_eq!(loader.cached_symbols(), vec!["demo.Helper".to_string()]);

        let again = loader.resolve("demo.Helper").unwrap();
        assert!(Arc::ptr_eq(unit.as_module().unwrap(), again.as_module().unwrap()));
    }

    #[test]
    fn missing_symbol_lists_every_backend() {
        let (loader, _env) = loader(&[]);
        let err = loader.resolve("demo.Missing").unwrap_err();
        match err {
            PluginError::SymbolNotFound { symbol, attempts } => {
                assert_eq!(symbol, "demo.Missing");
                assert_eq!(attempts.len(), 2);
                assert!(attempts[0].starts_with("wasm:"));
                assert!(attempts[1].starts_with("native:"));
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn entry_point_instantiates() {
        let (loader, _env) = loader(&[]);
        assert!(loader.instantiate_entry_point("demo.Main").is_ok());
        assert!(loader.instantiate_entry_point("host.api.Clock").is_err());
    }

    #[test]
    fn bundled_resources_are_readable() {
        let (loader, _env) = loader(&[]);
        assert_eq!(loader.read_resource("greeting.txt").unwrap(), b"hello");
        assert!(loader.read_resource("absent.txt").is_err());
    }

    #[test]
    fn teardown_closes_loader() {
        let (loader, env) = loader(&[]);
        loader.resolve("demo.Helper").unwrap();
        assert_eq!(env.stats().live(), 1);

        loader.teardown();
        loader.teardown();
        assert!(loader.is_closed());
        assert!(loader.cached_symbols().is_empty());
        assert_eq!(env.stats().torn_down(), 1);
        assert!(matches!(
            loader.resolve("demo.Helper"),
            Err(PluginError::LoaderClosed(_))
        ));
    }

    #[test]
    fn loaders_are_distinct_instances() {
        let table = NativeModuleTable::new();
        let env = env(&table);
        let a = env.create_loader(PluginId::from_static("demo"), PermissionSet::new(), archive());
        let b = env.create_loader(PluginId::from_static("demo"), PermissionSet::new(), archive());
        assert_ne!(a.instance_id(), b.instance_id());
        assert_eq!(env.stats().created(), 2);
    }
}

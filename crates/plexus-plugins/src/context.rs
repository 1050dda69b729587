//! Extension context handed to plugins during initialization.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::PluginResult;
use crate::loader::{IsolatedLoader, ResolvedSymbol};
use crate::permission::{Permission, PermissionSet};
use crate::plugin::PluginId;
use crate::registry::CapabilityRegistry;
use crate::resources::ResourceAccessor;

/// Logger that tags every event with the owning plugin's id.
#[derive(Debug, Clone)]
pub struct PluginLogger {
    plugin_id: PluginId,
}

impl PluginLogger {
    pub(crate) fn new(plugin_id: PluginId) -> Self {
        Self { plugin_id }
    }

    /// Log at debug level.
    pub fn debug(&self, message: &str) {
        debug!(target: "plexus::plugin", plugin_id = %self.plugin_id, "{message}");
    }

    /// Log at info level.
    pub fn info(&self, message: &str) {
        info!(target: "plexus::plugin", plugin_id = %self.plugin_id, "{message}");
    }

    /// Log at warn level.
    pub fn warn(&self, message: &str) {
        warn!(target: "plexus::plugin", plugin_id = %self.plugin_id, "{message}");
    }

    /// Log at error level.
    pub fn error(&self, message: &str) {
        error!(target: "plexus::plugin", plugin_id = %self.plugin_id, "{message}");
    }
}

/// Everything a plugin may reach in the host.
///
/// Built once per loaded plugin. Cheap to clone, so a plugin may keep a copy
/// from [`initialize`](crate::ExtensionPlugin::initialize) for later
/// callbacks.
#[derive(Clone)]
pub struct ExtensionContext {
    plugin_id: PluginId,
    logger: PluginLogger,
    registry: Arc<CapabilityRegistry>,
    resources: ResourceAccessor,
    loader: Arc<IsolatedLoader>,
}

impl fmt::Debug for ExtensionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionContext")
            .field("plugin_id", &self.plugin_id)
            .field("permissions", self.permissions())
            .field("resources", &self.resources)
            .finish_non_exhaustive()
    }
}

impl ExtensionContext {
    pub(crate) fn new(
        registry: Arc<CapabilityRegistry>,
        resources: ResourceAccessor,
        loader: Arc<IsolatedLoader>,
    ) -> Self {
        let plugin_id = loader.plugin_id().clone();
        Self {
            logger: PluginLogger::new(plugin_id.clone()),
            plugin_id,
            registry,
            resources,
            loader,
        }
    }

    /// The plugin this context belongs to.
    #[must_use]
    pub fn plugin_id(&self) -> &PluginId {
        &self.plugin_id
    }

    /// Logger tagged with the plugin id.
    #[must_use]
    pub fn logger(&self) -> &PluginLogger {
        &self.logger
    }

    /// The registry shared by every plugin and the host.
    #[must_use]
    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Access to the plugin's private directory and bundled resources.
    #[must_use]
    pub fn resources(&self) -> &ResourceAccessor {
        &self.resources
    }

    /// This plugin's isolated loader.
    #[must_use]
    pub fn loader(&self) -> &Arc<IsolatedLoader> {
        &self.loader
    }

    /// Resolve `symbol` through this plugin's isolated loader.
    ///
    /// # Errors
    ///
    /// See [`IsolatedLoader::resolve`].
    pub fn resolve(&self, symbol: &str) -> PluginResult<ResolvedSymbol> {
        self.loader.resolve(symbol)
    }

    /// Permissions granted from the plugin's manifest.
    #[must_use]
    pub fn permissions(&self) -> &PermissionSet {
        self.loader.permissions()
    }

    /// Whether `permission` was granted.
    #[must_use]
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }
}

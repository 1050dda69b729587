//! Capability registry.
//!
//! A concurrent service locator shared by every loaded plugin and the host.
//! Providers are keyed by the Rust type of the capability interface,
//! typically a trait object such as `dyn Greeter`:
//!
//! ```rust
//! use std::sync::Arc;
//! use plexus_plugins::CapabilityRegistry;
//!
//! trait Greeter: Send + Sync {
//!     fn greet(&self) -> String;
//! }
//!
//! struct English;
//! impl Greeter for English {
//!     fn greet(&self) -> String {
//!         "hello".into()
//!     }
//! }
//!
//! let registry = CapabilityRegistry::new();
//! registry.register::<dyn Greeter>(Arc::new(English));
//! assert_eq!(registry.get::<dyn Greeter>().unwrap().greet(), "hello");
//! ```
//!
//! Providers outlive the plugin that registered them; only
//! [`CapabilityRegistry::unregister`] removes them.

use std::any::{Any, TypeId, type_name};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

struct Entry {
    interface: &'static str,
    providers: Vec<Box<dyn Any + Send + Sync>>,
}

/// Concurrent multi-map from capability interface to ordered providers.
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: DashMap<TypeId, Entry>,
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("interfaces", &self.interfaces())
            .finish()
    }
}

impl CapabilityRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `provider` to the providers of interface `C`.
    pub fn register<C>(&self, provider: Arc<C>)
    where
        C: ?Sized + Send + Sync + 'static,
    {
        let mut entry = self.entries.entry(TypeId::of::<C>()).or_insert_with(|| Entry {
            interface: type_name::<C>(),
            providers: Vec::new(),
        });
        entry.providers.push(Box::new(provider));
        debug!(
            interface = entry.interface,
            providers = entry.providers.len(),
            "Registered capability provider"
        );
    }

    /// The first provider registered for `C`.
    #[must_use]
    pub fn get<C>(&self) -> Option<Arc<C>>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        let entry = self.entries.get(&TypeId::of::<C>())?;
        entry
            .providers
            .first()
            .and_then(|p| p.downcast_ref::<Arc<C>>())
            .map(Arc::clone)
    }

    /// Every provider registered for `C`, in registration order.
    #[must_use]
    pub fn get_all<C>(&self) -> Vec<Arc<C>>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        self.entries
            .get(&TypeId::of::<C>())
            .map(|entry| {
                entry
                    .providers
                    .iter()
                    .filter_map(|p| p.downcast_ref::<Arc<C>>())
                    .map(Arc::clone)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove every provider of `C`, returning how many were removed.
    pub fn unregister<C>(&self) -> usize
    where
        C: ?Sized + Send + Sync + 'static,
    {
        let removed = self
            .entries
            .remove(&TypeId::of::<C>())
            .map_or(0, |(_, entry)| entry.providers.len());
        if removed > 0 {
            debug!(interface = type_name::<C>(), removed, "Unregistered capability");
        }
        removed
    }

    /// Whether at least one provider of `C` is registered.
    #[must_use]
    pub fn contains<C>(&self) -> bool
    where
        C: ?Sized + Send + Sync + 'static,
    {
        self.provider_count::<C>() > 0
    }

    /// Number of providers registered for `C`.
    #[must_use]
    pub fn provider_count<C>(&self) -> usize
    where
        C: ?Sized + Send + Sync + 'static,
    {
        self.entries
            .get(&TypeId::of::<C>())
            .map_or(0, |entry| entry.providers.len())
    }

    /// Number of interfaces with at least one provider.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Type names of every registered interface, sorted.
    #[must_use]
    pub fn interfaces(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.entries.iter().map(|e| e.interface).collect();
        names.sort_unstable();
        names
    }
}

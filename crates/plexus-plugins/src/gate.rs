//! Capability gate for symbol resolution.
//!
//! Every symbol a plugin resolves outside the host's public namespace goes
//! through [`CapabilityGate::check`]. The decision has three tiers,
//! evaluated in order:
//!
//! 1. **Open allowlist.** Host public API, UI toolkit, event types and the
//!    pure parts of the base runtime are always allowed.
//! 2. **Sensitive set.** Raw filesystem handles, sockets, process control,
//!    dynamic loading and similar symbols are allowed only when the plugin
//!    holds one of the permissions mapped to the symbol. Entries mapped to no
//!    permission are never allowed.
//! 3. **Denylist.** Runtime internals and unsafe machinery are denied. No
//!    permission unlocks this tier.
//!
//! Anything that matches none of the tiers is allowed and left to the
//! module backends.
//!
//! Symbols are dotted paths (`std.net.TcpStream`). A sensitive entry also
//! covers its members (`std.net.TcpStream.connect`).

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::permission::{Permission, PermissionSet};

/// Why the gate allowed a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowTier {
    /// Tier 1: matched an allowlisted namespace.
    Allowlisted,
    /// Tier 2: sensitive, unlocked by this permission.
    Permitted(Permission),
    /// Tier 4: matched nothing.
    Unlisted,
}

/// Outcome of a gate check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// The symbol may be resolved.
    Allow(AllowTier),
    /// The symbol must not be resolved.
    Deny {
        /// Human-readable reason, surfaced in
        /// [`PluginError::AccessDenied`](crate::PluginError::AccessDenied).
        reason: String,
    },
}

impl GateDecision {
    /// Whether the decision is an allow.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow(_))
    }
}

/// A sensitive symbol and the permissions that unlock it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensitiveSymbol {
    /// Fully-qualified symbol.
    pub symbol: String,
    /// Any one of these unlocks the symbol. Empty means never.
    #[serde(default)]
    pub unlocked_by: Vec<Permission>,
}

impl SensitiveSymbol {
    fn new(symbol: &str, unlocked_by: &[Permission]) -> Self {
        Self {
            symbol: symbol.to_string(),
            unlocked_by: unlocked_by.to_vec(),
        }
    }

    fn covers(&self, symbol: &str) -> bool {
        symbol
            .strip_prefix(self.symbol.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
    }
}

const FS: &[Permission] = &[Permission::FilesystemRead, Permission::FilesystemWrite];
const NET: &[Permission] = &[Permission::NetworkAccess];
const PROC: &[Permission] = &[Permission::SystemCommands];
const NEVER: &[Permission] = &[];

const DEFAULT_ALLOW_PREFIXES: &[&str] = &[
    "host.api.",
    "host.events.",
    "host.ui.",
    "core.option.",
    "core.result.",
    "core.iter.",
    "core.fmt.",
    "core.str.",
    "core.cmp.",
    "core.convert.",
    "alloc.string.",
    "alloc.vec.",
    "alloc.boxed.",
    "alloc.sync.",
    "std.collections.",
    "std.fmt.",
    "std.string.",
    "std.vec.",
    "std.sync.",
    "std.time.",
];

const DEFAULT_SENSITIVE: &[(&str, &[Permission])] = &[
    ("std.fs.File", FS),
    ("std.fs.OpenOptions", FS),
    ("std.fs.read", FS),
    ("std.fs.read_to_string", FS),
    ("std.fs.read_dir", FS),
    ("std.fs.metadata", FS),
    ("std.fs.write", FS),
    ("std.fs.create_dir_all", FS),
    ("std.fs.remove_file", FS),
    ("std.fs.remove_dir_all", FS),
    ("std.net.TcpStream", NET),
    ("std.net.TcpListener", NET),
    ("std.net.UdpSocket", NET),
    ("std.net.ToSocketAddrs", NET),
    ("url.Url", NET),
    ("std.process.Command", PROC),
    ("std.process.Child", PROC),
    ("std.process.exit", NEVER),
    ("std.process.abort", NEVER),
    ("std.env.set_var", NEVER),
    ("std.env.remove_var", NEVER),
    ("std.env.set_current_dir", NEVER),
    ("std.mem.transmute", NEVER),
    ("std.panic.set_hook", NEVER),
    ("libloading.Library", NEVER),
    ("libloading.Symbol", NEVER),
];

const DEFAULT_DENY_PREFIXES: &[&str] = &[
    "host.internal.",
    "runtime.",
    "plexus_plugins.",
    "std.intrinsics.",
    "core.intrinsics.",
    "std.ptr.",
    "core.ptr.",
    "std.os.",
    "std.arch.",
    "core.arch.",
];

/// The data behind a [`CapabilityGate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatePolicy {
    /// Tier 1 namespace prefixes.
    pub allow_prefixes: Vec<String>,
    /// Tier 2 entries.
    pub sensitive: Vec<SensitiveSymbol>,
    /// Tier 3 namespace prefixes.
    pub deny_prefixes: Vec<String>,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            allow_prefixes: DEFAULT_ALLOW_PREFIXES.iter().map(|s| (*s).to_string()).collect(),
            sensitive: DEFAULT_SENSITIVE
                .iter()
                .map(|(symbol, perms)| SensitiveSymbol::new(symbol, perms))
                .collect(),
            deny_prefixes: DEFAULT_DENY_PREFIXES.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

impl GatePolicy {
    /// Add a tier 1 prefix.
    #[must_use]
    pub fn with_allow_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.allow_prefixes.push(prefix.into());
        self
    }

    /// Add a tier 2 entry.
    #[must_use]
    pub fn with_sensitive(mut self, symbol: impl Into<String>, unlocked_by: &[Permission]) -> Self {
        self.sensitive.push(SensitiveSymbol {
            symbol: symbol.into(),
            unlocked_by: unlocked_by.to_vec(),
        });
        self
    }

    /// Add a tier 3 prefix.
    #[must_use]
    pub fn with_deny_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.deny_prefixes.push(prefix.into());
        self
    }
}

/// Three-tier allow/deny decision for symbol resolution.
///
/// Cheap to clone; the policy is shared.
#[derive(Clone, Default)]
pub struct CapabilityGate {
    policy: Arc<GatePolicy>,
}

impl fmt::Debug for CapabilityGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityGate")
            .field("allow_prefixes", &self.policy.allow_prefixes.len())
            .field("sensitive", &self.policy.sensitive.len())
            .field("deny_prefixes", &self.policy.deny_prefixes.len())
            .finish()
    }
}

impl CapabilityGate {
    /// Gate enforcing `policy`.
    #[must_use]
    pub fn new(policy: GatePolicy) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }

    /// The policy in force.
    #[must_use]
    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    /// Decide whether a plugin holding `granted` may resolve `symbol`.
    #[must_use]
    pub fn check(&self, symbol: &str, granted: &PermissionSet) -> GateDecision {
        if self
            .policy
            .allow_prefixes
            .iter()
            .any(|prefix| symbol.starts_with(prefix.as_str()))
        {
            return GateDecision::Allow(AllowTier::Allowlisted);
        }

        if let Some(entry) = self.policy.sensitive.iter().find(|e| e.covers(symbol)) {
            return match entry.unlocked_by.iter().copied().find(|p| granted.contains(p)) {
                Some(permission) => GateDecision::Allow(AllowTier::Permitted(permission)),
                None if entry.unlocked_by.is_empty() => GateDecision::Deny {
                    reason: format!("{} is never available to plugins", entry.symbol),
                },
                None => GateDecision::Deny {
                    reason: format!(
                        "{} requires one of: {}",
                        entry.symbol,
                        entry
                            .unlocked_by
                            .iter()
                            .map(|p| p.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                },
            };
        }

        if let Some(prefix) = self
            .policy
            .deny_prefixes
            .iter()
            .find(|prefix| symbol.starts_with(prefix.as_str()))
        {
            return GateDecision::Deny {
                reason: format!("namespace {prefix} is reserved"),
            };
        }

        GateDecision::Allow(AllowTier::Unlisted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn granted(perms: &[Permission]) -> PermissionSet {
        perms.iter().copied().collect()
    }

    #[test]
    fn allowlisted_namespaces_need_no_permission() {
        let gate = CapabilityGate::default();
        let none = PermissionSet::new();
        assert_eq!(
            gate.check("host.api.Editor", &none),
            GateDecision::Allow(AllowTier::Allowlisted)
        );
        assert_eq!(
            gate.check("std.collections.HashMap", &none),
            GateDecision::Allow(AllowTier::Allowlisted)
        );
    }

    #[test]
    fn network_symbols_need_network_access() {
        let gate = CapabilityGate::default();
        assert!(!gate.check("std.net.TcpStream", &PermissionSet::new()).is_allowed());
        assert!(!gate.check("url.Url.parse", &PermissionSet::new()).is_allowed());
        assert_eq!(
            gate.check(
                "std.net.TcpStream.connect",
                &granted(&[Permission::NetworkAccess])
            ),
            GateDecision::Allow(AllowTier::Permitted(Permission::NetworkAccess))
        );
    }

    #[test]
    fn filesystem_symbols_accept_read_or_write() {
        let gate = CapabilityGate::default();
        assert!(!gate.check("std.fs.File", &PermissionSet::new()).is_allowed());
        assert!(gate
            .check("std.fs.File", &granted(&[Permission::FilesystemRead]))
            .is_allowed());
        assert!(gate
            .check("std.fs.File", &granted(&[Permission::FilesystemWrite]))
            .is_allowed());
        // The wrong permission doesn't help.
        assert!(!gate
            .check("std.fs.File", &granted(&[Permission::NetworkAccess]))
            .is_allowed());
    }

    #[test]
    fn process_symbols_need_system_commands() {
        let gate = CapabilityGate::default();
        assert!(!gate.check("std.process.Command", &PermissionSet::new()).is_allowed());
        assert!(gate
            .check("std.process.Command", &granted(&[Permission::SystemCommands]))
            .is_allowed());
    }

    #[test]
    fn unmapped_sensitive_symbols_are_never_allowed() {
        let gate = CapabilityGate::default();
        let all = granted(&Permission::ALL);
        for symbol in ["std.env.set_var", "std.process.exit", "libloading.Library.new"] {
            assert!(!gate.check(symbol, &all).is_allowed(), "{symbol}");
        }
    }

    #[test]
    fn denylist_ignores_permissions() {
        let gate = CapabilityGate::default();
        let all = granted(&Permission::ALL);
        for symbol in [
            "host.internal.PluginTable",
            "runtime.Scheduler",
            "std.ptr.write",
            "core.intrinsics.transmute",
            "std.os.unix.process.CommandExt",
        ] {
            match gate.check(symbol, &all) {
                GateDecision::Deny { reason } => assert!(reason.contains("reserved"), "{symbol}"),
                other => panic!("{symbol} should be denied, got {other:?}"),
            }
        }
    }

    #[test]
    fn unlisted_symbols_default_to_allow() {
        let gate = CapabilityGate::default();
        assert_eq!(
            gate.check("demo.util.Formatter", &PermissionSet::new()),
            GateDecision::Allow(AllowTier::Unlisted)
        );
        // Prefix matching respects member boundaries.
        assert_eq!(
            gate.check("std.fs.FileTimes", &PermissionSet::new()),
            GateDecision::Allow(AllowTier::Unlisted)
        );
    }

    #[test]
    fn policy_extensions_apply() {
        let gate = CapabilityGate::new(
            GatePolicy::default()
                .with_allow_prefix("acme.sdk.")
                .with_sensitive("acme.telemetry.Upload", &[Permission::NetworkAccess])
                .with_deny_prefix("acme.secret."),
        );
        let none = PermissionSet::new();
        assert!(gate.check("acme.sdk.Widget", &none).is_allowed());
        assert!(!gate.check("acme.telemetry.Upload", &none).is_allowed());
        assert!(!gate.check("acme.secret.Key", &granted(&Permission::ALL)).is_allowed());
    }
}

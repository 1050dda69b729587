//! Plugin runtime error types.

use std::path::PathBuf;

use crate::plugin::PluginId;

/// Errors from plugin runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The package file is missing or could not be opened.
    #[error("package unreadable at {path}: {message}")]
    PackageUnreadable {
        /// Path to the package file.
        path: PathBuf,
        /// Underlying failure.
        message: String,
    },

    /// No supported encoding yielded a manifest with the required fields.
    #[error("manifest invalid in {path}: {message}")]
    ManifestInvalid {
        /// Path to the package file.
        path: PathBuf,
        /// What was missing or malformed.
        message: String,
    },

    /// The manifest requests a permission the host does not define.
    #[error("unknown permission: {0}")]
    UnknownPermission(String),

    /// The package failed an integrity or checksum step.
    #[error("integrity check failed for {path}: {message}")]
    IntegrityError {
        /// Path to the package file.
        path: PathBuf,
        /// Failure reason.
        message: String,
    },

    /// A plugin with this ID is currently loaded, active or disabled.
    #[error("plugin already loaded: {0}")]
    AlreadyLoaded(PluginId),

    /// The capability gate refused to resolve a symbol.
    #[error("access denied: {symbol}")]
    AccessDenied {
        /// Symbol (or resource) that was refused.
        symbol: String,
        /// Why the gate said no.
        reason: String,
    },

    /// Neither module backend could resolve the symbol.
    #[error("symbol not found: {symbol} ({})", attempts.join("; "))]
    SymbolNotFound {
        /// Symbol that was requested.
        symbol: String,
        /// One diagnostic per backend that was tried.
        attempts: Vec<String>,
    },

    /// The plugin's `initialize` callback failed or panicked.
    #[error("plugin initialization failed: {plugin_id} - {message}")]
    InitializationFailed {
        /// The plugin that failed to initialize.
        plugin_id: PluginId,
        /// Failure reason.
        message: String,
    },

    /// The plugin's `activate` callback failed or panicked.
    #[error("plugin activation failed: {plugin_id} - {message}")]
    ActivationFailed {
        /// The plugin that failed to activate.
        plugin_id: PluginId,
        /// Failure reason.
        message: String,
    },

    /// A plugin tried to reach a path outside its private directory.
    #[error("path traversal denied for plugin {plugin_id}: {path}")]
    PathTraversalDenied {
        /// The offending plugin.
        plugin_id: PluginId,
        /// The requested path.
        path: String,
    },

    /// The requested plugin is not loaded.
    #[error("plugin not found: {0}")]
    NotFound(PluginId),

    /// The operation is not valid in the plugin's current lifecycle state.
    #[error("plugin {plugin_id} is {state}, cannot {operation}")]
    InvalidState {
        /// The plugin in question.
        plugin_id: PluginId,
        /// Its current state.
        state: crate::plugin::LifecycleState,
        /// The operation that was refused.
        operation: &'static str,
    },

    /// The plugin ID is invalid.
    #[error("invalid plugin id: {0}")]
    InvalidId(String),

    /// The plugin does not support the running host version.
    #[error("plugin {plugin_id} requires host {required}, running {host}")]
    IncompatibleHost {
        /// The plugin in question.
        plugin_id: PluginId,
        /// The version range the manifest declares.
        required: String,
        /// The running host version.
        host: String,
    },

    /// Package hash verification failed.
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// Expected blake3 hex digest.
        expected: String,
        /// Actual blake3 hex digest.
        actual: String,
    },

    /// The isolated loader was torn down and no longer resolves symbols.
    #[error("loader for plugin {0} has been torn down")]
    LoaderClosed(PluginId),

    /// WASM runtime error (Extism/Wasmtime).
    #[error("WASM error: {0}")]
    WasmError(String),

    /// The persisted enablement file could not be read or written.
    #[error("plugin state file error at {path}: {message}")]
    StateFileError {
        /// Path to the state file.
        path: PathBuf,
        /// What went wrong.
        message: String,
    },

    /// Runtime configuration could not be read or is invalid.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginError {
    /// Whether this error should be reported as a security event.
    #[must_use]
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            Self::AccessDenied { .. }
                | Self::PathTraversalDenied { .. }
                | Self::IntegrityError { .. }
                | Self::HashMismatch { .. }
        )
    }

    /// Whether retrying the same call later could succeed without changing
    /// the package.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PackageUnreadable { .. }
                | Self::AlreadyLoaded(_)
                | Self::InitializationFailed { .. }
                | Self::ActivationFailed { .. }
                | Self::InvalidState { .. }
                | Self::StateFileError { .. }
                | Self::Io(_)
        )
    }

    pub(crate) fn access_denied(symbol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AccessDenied {
            symbol: symbol.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for plugin runtime operations.
pub type PluginResult<T> = Result<T, PluginError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_events_are_classified() {
        let denied = PluginError::access_denied("std.net.TcpStream", "network.access not granted");
        assert!(denied.is_security_event());
        assert!(!denied.is_retryable());

        let traversal = PluginError::PathTraversalDenied {
            plugin_id: PluginId::from_static("demo"),
            path: "../../etc/passwd".into(),
        };
        assert!(traversal.is_security_event());
    }

    #[test]
    fn symbol_not_found_lists_attempts() {
        let err = PluginError::SymbolNotFound {
            symbol: "demo.Main".into(),
            attempts: vec!["wasm: no module".into(), "native: no factory".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("demo.Main"));
        assert!(msg.contains("wasm: no module; native: no factory"));
    }

    #[test]
    fn unreadable_package_is_retryable() {
        let err = PluginError::PackageUnreadable {
            path: PathBuf::from("/nope.plx"),
            message: "not found".into(),
        };
        assert!(err.is_retryable());
        assert!(!err.is_security_event());
    }
}

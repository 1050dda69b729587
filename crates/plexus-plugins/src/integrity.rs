//! Pluggable package integrity verification.
//!
//! The validator runs one [`IntegrityVerifier`] per package, over the exact
//! bytes the parser decoded. The default, [`NonEmptyFile`], only proves the
//! package is non-empty; hosts that distribute packages out-of-band can pin
//! blake3 digests with [`Blake3Verifier`].

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::{PluginError, PluginResult};
use crate::package::PackageHandle;
use crate::plugin::PluginId;

/// Verifies that a package file has not been corrupted or tampered with.
pub trait IntegrityVerifier: Send + Sync {
    /// Check `bytes`, read from `handle`, which claim to contain plugin
    /// `plugin_id`.
    ///
    /// `bytes` are the ones the package is loaded from; implementations must
    /// not go back to the file.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::IntegrityError`] or
    /// [`PluginError::HashMismatch`] when the package must be rejected.
    fn verify(&self, handle: &PackageHandle, bytes: &[u8], plugin_id: &PluginId) -> PluginResult<()>;
}

/// Accepts any non-empty package.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonEmptyFile;

impl IntegrityVerifier for NonEmptyFile {
    fn verify(&self, handle: &PackageHandle, bytes: &[u8], _plugin_id: &PluginId) -> PluginResult<()> {
        if bytes.is_empty() {
            return Err(PluginError::IntegrityError {
                path: handle.path().to_path_buf(),
                message: "package file is empty".into(),
            });
        }
        Ok(())
    }
}

/// Verifies packages against pinned blake3 digests.
///
/// Packages without a pin are accepted with a warning unless
/// [`require_pin`](Self::require_pin) is set.
#[derive(Debug, Clone, Default)]
pub struct Blake3Verifier {
    pins: HashMap<PluginId, String>,
    require_pin: bool,
}

impl Blake3Verifier {
    /// Create a verifier with no pins.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `plugin_id` to a blake3 hex digest.
    #[must_use]
    pub fn pin(mut self, plugin_id: PluginId, hex_digest: impl Into<String>) -> Self {
        self.pins
            .insert(plugin_id, hex_digest.into().to_ascii_lowercase());
        self
    }

    /// Reject packages whose plugin id has no pin.
    #[must_use]
    pub fn require_pin(mut self, require: bool) -> Self {
        self.require_pin = require;
        self
    }
}

impl IntegrityVerifier for Blake3Verifier {
    fn verify(&self, handle: &PackageHandle, bytes: &[u8], plugin_id: &PluginId) -> PluginResult<()> {
        NonEmptyFile.verify(handle, bytes, plugin_id)?;

        let expected = self.pins.get(plugin_id).map(String::as_str);

        if expected.is_none() && self.require_pin {
            return Err(PluginError::IntegrityError {
                path: handle.path().to_path_buf(),
                message: format!("no pinned digest for plugin {plugin_id}"),
            });
        }
        verify_hash(bytes, expected, plugin_id)
    }
}

/// Compare the blake3 digest of `bytes` with `expected`, if given.
///
/// # Errors
///
/// Returns [`PluginError::HashMismatch`] when the digests differ.
pub fn verify_hash(bytes: &[u8], expected: Option<&str>, plugin_id: &PluginId) -> PluginResult<()> {
    match expected {
        Some(expected_hex) => {
            let actual_hex = blake3::hash(bytes).to_hex().to_string();
            if actual_hex != expected_hex {
                return Err(PluginError::HashMismatch {
                    expected: expected_hex.to_string(),
                    actual: actual_hex,
                });
            }
            debug!(plugin_id = %plugin_id, "Package hash verified");
        },
        None => {
            warn!(
                plugin_id = %plugin_id,
                "No pinned hash for package, integrity not verified"
            );
        },
    }
    Ok(())
}

//! Host-side symbol tables.
//!
//! The host publishes two kinds of symbols to plugins:
//!
//! - **Exports** form the host's public API. Loaders return them before
//!   consulting the capability gate.
//! - **Primitives** are host-native implementations of sensitive
//!   operations (sockets, processes, raw files). They are only reachable
//!   after the gate has allowed the symbol for the requesting plugin.
//!
//! [`HostNamespace::standard`] registers primitives for the default
//! sensitive symbols.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::process::{Command, Output};
use std::sync::Arc;
use std::time::Duration;

/// A symbol published by the host.
#[derive(Clone)]
pub struct HostSymbol {
    name: String,
    value: Arc<dyn Any + Send + Sync>,
}

impl HostSymbol {
    /// Fully-qualified name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The published value, if it is a `T`.
    #[must_use]
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.value).downcast::<T>().ok()
    }
}

impl fmt::Debug for HostSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSymbol")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Symbols the host makes available to every plugin loader.
#[derive(Clone, Default)]
pub struct HostNamespace {
    exports: HashMap<String, HostSymbol>,
    primitives: HashMap<String, HostSymbol>,
}

impl fmt::Debug for HostNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut exports: Vec<_> = self.exports.keys().collect();
        exports.sort();
        let mut primitives: Vec<_> = self.primitives.keys().collect();
        primitives.sort();
        f.debug_struct("HostNamespace")
            .field("exports", &exports)
            .field("primitives", &primitives)
            .finish()
    }
}

impl HostNamespace {
    /// An empty namespace.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A namespace with primitives for the default sensitive symbols:
    /// `std.net.TcpStream`, `std.process.Command` and `std.fs.File`.
    #[must_use]
    pub fn standard() -> Self {
        Self::new()
            .with_primitive("std.net.TcpStream", Arc::new(TcpConnector::default()))
            .with_primitive("std.process.Command", Arc::new(CommandRunner))
            .with_primitive("std.fs.File", Arc::new(FileOpener))
    }

    /// Publish `value` as part of the host's public API.
    #[must_use]
    pub fn with_export<T: Any + Send + Sync>(mut self, name: impl Into<String>, value: Arc<T>) -> Self {
        let name = name.into();
        self.exports
            .insert(name.clone(), HostSymbol { name, value });
        self
    }

    /// Publish `value` as a gated primitive.
    #[must_use]
    pub fn with_primitive<T: Any + Send + Sync>(
        mut self,
        name: impl Into<String>,
        value: Arc<T>,
    ) -> Self {
        let name = name.into();
        self.primitives
            .insert(name.clone(), HostSymbol { name, value });
        self
    }

    /// Look up a public export.
    #[must_use]
    pub fn export(&self, name: &str) -> Option<&HostSymbol> {
        self.exports.get(name)
    }

    /// Look up a gated primitive.
    #[must_use]
    pub fn primitive(&self, name: &str) -> Option<&HostSymbol> {
        self.primitives.get(name)
    }
}

/// Primitive behind `std.net.TcpStream`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

impl TcpConnector {
    /// Connect to `addr` with the connector's timeout.
    ///
    /// # Errors
    ///
    /// Returns the socket error.
    pub fn connect(&self, addr: &SocketAddr) -> io::Result<TcpStream> {
        TcpStream::connect_timeout(addr, self.timeout)
    }
}

/// Primitive behind `std.process.Command`.
#[derive(Debug, Clone, Copy)]
pub struct CommandRunner;

impl CommandRunner {
    /// Run `program` with `args` to completion and capture its output.
    ///
    /// # Errors
    ///
    /// Returns the spawn error.
    pub fn output(&self, program: &str, args: &[&str]) -> io::Result<Output> {
        Command::new(program).args(args).output()
    }
}

/// Primitive behind `std.fs.File`.
#[derive(Debug, Clone, Copy)]
pub struct FileOpener;

impl FileOpener {
    /// Open `path` read-only.
    ///
    /// # Errors
    ///
    /// Returns the filesystem error.
    pub fn open(&self, path: &Path) -> io::Result<File> {
        File::open(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Clock(u64);

    #[test]
    fn exports_and_primitives_are_separate() {
        let ns = HostNamespace::new()
            .with_export("host.api.Clock", Arc::new(Clock(7)))
            .with_primitive("std.net.TcpStream", Arc::new(TcpConnector::default()));

        assert!(ns.export("host.api.Clock").is_some());
        assert!(ns.primitive("host.api.Clock").is_none());
        assert!(ns.export("std.net.TcpStream").is_none());
        assert!(ns.primitive("std.net.TcpStream").is_some());
    }

    #[test]
    fn downcast_checks_type() {
        let ns = HostNamespace::new().with_export("host.api.Clock", Arc::new(Clock(7)));
        let symbol = ns.export("host.api.Clock").unwrap();
        assert_eq!(symbol.name(), "host.api.Clock");
        assert_eq!(symbol.downcast::<Clock>().unwrap().0, 7);
        assert!(symbol.downcast::<TcpConnector>().is_none());
    }

    #[test]
    fn standard_namespace_has_gated_primitives_only() {
        let ns = HostNamespace::standard();
        assert!(ns.primitive("std.net.TcpStream").is_some());
        assert!(ns.primitive("std.process.Command").is_some());
        assert!(ns.primitive("std.fs.File").is_some());
        assert!(ns.export("std.net.TcpStream").is_none());
    }
}

//! Package encodings and in-memory archive reading.
//!
//! A package is a tar archive, either gzip-compressed (the compiled-archive
//! encoding) or plain (the legacy-archive encoding). Archives are read fully
//! into memory and indexed by entry name while guarding against:
//! - Path traversal (`../` components) and absolute paths
//! - Links, device nodes and other non-regular entries
//! - Excessive entry counts and decompression bombs

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use tar::Archive;

/// Maximum number of entries allowed in a package.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Maximum total unpacked size (500 MB).
pub const DEFAULT_MAX_UNPACKED_BYTES: u64 = 500_000_000;

/// Maximum size of the package file itself (200 MB).
pub const DEFAULT_MAX_PACKAGE_BYTES: u64 = 200_000_000;

/// Gzip magic bytes.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// How a package file is encoded on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageEncoding {
    /// Gzip-compressed tar.
    CompiledArchive,
    /// Plain tar.
    LegacyArchive,
}

impl PackageEncoding {
    /// Encodings in the order the parser attempts them.
    pub const PRIORITY: [Self; 2] = [Self::CompiledArchive, Self::LegacyArchive];
}

impl fmt::Display for PackageEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CompiledArchive => "compiled-archive",
            Self::LegacyArchive => "legacy-archive",
        })
    }
}

/// The on-disk package file plus the encoding it was decoded with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageHandle {
    path: PathBuf,
    encoding: PackageEncoding,
}

impl PackageHandle {
    pub(crate) fn new(path: PathBuf, encoding: PackageEncoding) -> Self {
        Self { path, encoding }
    }

    /// Path to the package file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Detected encoding.
    #[must_use]
    pub fn encoding(&self) -> PackageEncoding {
        self.encoding
    }
}

/// Limits applied while reading a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveLimits {
    /// Maximum number of entries.
    pub max_entries: usize,
    /// Maximum sum of entry sizes.
    pub max_unpacked_bytes: u64,
    /// Maximum size of the package file on disk.
    pub max_package_bytes: u64,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            max_unpacked_bytes: DEFAULT_MAX_UNPACKED_BYTES,
            max_package_bytes: DEFAULT_MAX_PACKAGE_BYTES,
        }
    }
}

/// Why an archive could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DecodeError {
    /// The bytes are not in this encoding (or are corrupt); try the next one.
    Mismatch(String),
    /// The bytes are in this encoding but the content is hostile.
    Unsafe(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mismatch(m) | Self::Unsafe(m) => f.write_str(m),
        }
    }
}

/// A decoded package: regular-file entries indexed by normalized name.
#[derive(Clone, PartialEq, Eq)]
pub struct PackageArchive {
    encoding: PackageEncoding,
    entries: BTreeMap<String, Vec<u8>>,
}

impl fmt::Debug for PackageArchive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackageArchive")
            .field("encoding", &self.encoding)
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PackageArchive {
    /// Decode `bytes` as `encoding`.
    pub(crate) fn decode(
        bytes: &[u8],
        encoding: PackageEncoding,
        limits: &ArchiveLimits,
    ) -> Result<Self, DecodeError> {
        let entries = match encoding {
            PackageEncoding::CompiledArchive => {
                if !bytes.starts_with(&GZIP_MAGIC) {
                    return Err(DecodeError::Mismatch("not gzip-compressed".into()));
                }
                read_entries(Archive::new(GzDecoder::new(bytes)), limits)?
            },
            PackageEncoding::LegacyArchive => {
                if bytes.starts_with(&GZIP_MAGIC) {
                    return Err(DecodeError::Mismatch("gzip data is not a plain tar".into()));
                }
                read_entries(Archive::new(bytes), limits)?
            },
        };
        Ok(Self { encoding, entries })
    }

    /// Encoding the archive was decoded with.
    #[must_use]
    pub fn encoding(&self) -> PackageEncoding {
        self.encoding
    }

    /// Contents of the entry `name` (e.g. `modules/demo.Main.wasm`).
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    /// Whether the archive has an entry `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Entry names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of regular-file entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the archive has no regular files.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn read_entries<R: Read>(
    mut archive: Archive<R>,
    limits: &ArchiveLimits,
) -> Result<BTreeMap<String, Vec<u8>>, DecodeError> {
    let mut entries = BTreeMap::new();
    let mut entry_count = 0usize;
    let mut total_size: u64 = 0;

    let iter = archive
        .entries()
        .map_err(|e| DecodeError::Mismatch(format!("failed to read archive entries: {e}")))?;

    for entry_result in iter {
        let mut entry = entry_result
            .map_err(|e| DecodeError::Mismatch(format!("failed to read archive entry: {e}")))?;

        entry_count = entry_count.saturating_add(1);
        if entry_count > limits.max_entries {
            return Err(DecodeError::Unsafe(format!(
                "archive exceeds maximum entry count ({})",
                limits.max_entries
            )));
        }

        let entry_type = entry.header().entry_type();
        if !is_safe_entry_type(entry_type) {
            let entry_path = entry
                .path()
                .map_or_else(|_| "<unknown>".to_string(), |p| p.display().to_string());
            return Err(DecodeError::Unsafe(format!(
                "unsafe archive entry type '{entry_type:?}' at {entry_path}"
            )));
        }

        let entry_size = entry
            .header()
            .size()
            .map_err(|e| DecodeError::Mismatch(format!("failed to read entry size: {e}")))?;
        total_size = total_size.saturating_add(entry_size);
        if total_size > limits.max_unpacked_bytes {
            return Err(DecodeError::Unsafe(format!(
                "archive exceeds maximum unpacked size ({} bytes)",
                limits.max_unpacked_bytes
            )));
        }

        let entry_path = entry
            .path()
            .map_err(|e| DecodeError::Mismatch(format!("failed to read entry path: {e}")))?
            .into_owned();
        let name = normalize_entry_path(&entry_path)?;

        if entry_type != tar::EntryType::Regular || name.is_empty() {
            continue;
        }

        let mut data = Vec::with_capacity(usize::try_from(entry_size).unwrap_or(0));
        entry.read_to_end(&mut data).map_err(|e| {
            DecodeError::Mismatch(format!("failed to read {}: {e}", entry_path.display()))
        })?;
        entries.insert(name, data);
    }

    if entry_count == 0 {
        return Err(DecodeError::Mismatch("archive is empty".into()));
    }

    Ok(entries)
}

/// Check whether a tar entry type is safe to index.
///
/// Allows regular files, directories, and metadata headers. Rejects
/// symlinks, hardlinks, block/char devices, FIFOs, and GNU sparse entries.
fn is_safe_entry_type(entry_type: tar::EntryType) -> bool {
    matches!(
        entry_type,
        tar::EntryType::Regular
            | tar::EntryType::Directory
            | tar::EntryType::GNULongName
            | tar::EntryType::XHeader
            | tar::EntryType::XGlobalHeader
    )
}

/// Turn an entry path into a `/`-joined name, rejecting anything that could
/// escape the package root.
fn normalize_entry_path(path: &Path) -> Result<String, DecodeError> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {},
            Component::ParentDir | Component::Prefix(_) | Component::RootDir => {
                return Err(DecodeError::Unsafe(format!(
                    "path traversal detected: {}",
                    path.display()
                )));
            },
        }
    }
    Ok(parts.join("/"))
}

//! Upload validation: zip-bomb limits, path safety and content hashing.
//!
//! Every check runs before anything is persisted or enqueued. Rejections are
//! `AppError::Validation` with one of the `zip_*` codes (or `upload_too_large`).

use crate::config::IngestConfig;
use crate::error::{AppError, Result};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::{Cursor, Read};

pub const UPLOAD_TOO_LARGE: &str = "upload_too_large";
pub const ZIP_INVALID: &str = "zip_invalid";
pub const ZIP_TOO_MANY_ENTRIES: &str = "zip_too_many_entries";
pub const ZIP_TOO_DEEP: &str = "zip_too_deep";
pub const ZIP_TOO_LARGE: &str = "zip_too_large";
pub const ZIP_RATIO: &str = "zip_ratio";
pub const ZIP_UNSAFE_PATH: &str = "zip_unsafe_path";

const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ZipLimits {
    pub max_upload_bytes: u64,
    pub max_entries: usize,
    pub max_depth: usize,
    pub max_uncompressed_bytes: u64,
    pub max_ratio: f64,
}

impl From<&IngestConfig> for ZipLimits {
    fn from(config: &IngestConfig) -> Self {
        Self {
            max_upload_bytes: config.max_upload_bytes,
            max_entries: config.zip_max_entries,
            max_depth: config.zip_max_depth,
            max_uncompressed_bytes: config.zip_max_uncompressed_bytes,
            max_ratio: config.zip_max_ratio,
        }
    }
}

impl Default for ZipLimits {
    fn default() -> Self {
        ZipLimits::from(&IngestConfig::default())
    }
}

/// One file of a validated archive
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    /// `/`-separated path relative to the archive root
    pub path: String,
    pub size: u64,
    pub sha256: String,
}

/// What the guard learned about an accepted archive
#[derive(Debug, Clone, PartialEq)]
pub struct ZipManifest {
    /// Hex sha256 over the sorted `(path, sha256(bytes))` pairs
    pub content_hash: String,
    pub entries: Vec<ManifestEntry>,
    pub total_bytes: u64,
}

impl ZipManifest {
    pub fn file_count(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ZipGuard {
    limits: ZipLimits,
}

impl ZipGuard {
    pub fn new(limits: ZipLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ZipLimits {
        &self.limits
    }

    /// Validate `bytes` as an archive and compute its content hash
    pub fn inspect(&self, bytes: &[u8]) -> Result<ZipManifest> {
        let limits = &self.limits;
        if bytes.len() as u64 > limits.max_upload_bytes {
            return Err(AppError::validation(
                UPLOAD_TOO_LARGE,
                format!(
                    "upload is {} bytes, limit is {}",
                    bytes.len(),
                    limits.max_upload_bytes
                ),
            ));
        }

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
        if archive.len() > limits.max_entries {
            return Err(AppError::validation(
                ZIP_TOO_MANY_ENTRIES,
                format!(
                    "archive has {} entries, limit is {}",
                    archive.len(),
                    limits.max_entries
                ),
            ));
        }

        // Declared metadata first, so a bomb is refused before anything is inflated
        let mut declared_total: u64 = 0;
        for i in 0..archive.len() {
            let entry = archive.by_index_raw(i)?;
            let name = entry.name().to_string();
            let path = self.normalize(&name)?;

            let declared = entry.size();
            if declared > limits.max_uncompressed_bytes {
                return Err(too_large(format!("{} declares {} bytes", path, declared)));
            }
            declared_total = declared_total.saturating_add(declared);
            if declared_total > limits.max_uncompressed_bytes {
                return Err(too_large(format!(
                    "archive declares more than {} bytes uncompressed",
                    limits.max_uncompressed_bytes
                )));
            }

            let compressed = entry.compressed_size();
            if compressed > 0 {
                let ratio = declared as f64 / compressed as f64;
                if ratio > limits.max_ratio {
                    return Err(AppError::validation(
                        ZIP_RATIO,
                        format!(
                            "{} compresses {:.0}:1, limit is {:.0}:1",
                            path, ratio, limits.max_ratio
                        ),
                    ));
                }
            }
        }

        // Then inflate, trusting nothing the headers said
        let mut entries = Vec::new();
        let mut seen = HashSet::new();
        let mut actual_total: u64 = 0;
        for i in 0..archive.len() {
            let entry = archive.by_index(i)?;
            if entry.is_dir() {
                continue;
            }
            let path = self.normalize(entry.name())?;
            if !seen.insert(path.clone()) {
                return Err(AppError::validation(
                    ZIP_UNSAFE_PATH,
                    format!("duplicate entry {}", path),
                ));
            }

            let budget = limits.max_uncompressed_bytes - actual_total;
            let mut hasher = Sha256::new();
            let copied = std::io::copy(&mut entry.take(budget.saturating_add(1)), &mut hasher)
                .map_err(|e| AppError::validation(ZIP_INVALID, format!("{}: {}", path, e)))?;
            if copied > budget {
                return Err(too_large(format!(
                    "{} inflates past the {} byte limit",
                    path, limits.max_uncompressed_bytes
                )));
            }
            actual_total += copied;

            entries.push(ManifestEntry {
                path,
                size: copied,
                sha256: format!("{:x}", hasher.finalize()),
            });
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        let content_hash = content_hash(&entries);

        tracing::debug!(
            entries = entries.len(),
            total_bytes = actual_total,
            content_hash = %content_hash,
            "Archive accepted"
        );

        Ok(ZipManifest {
            content_hash,
            entries,
            total_bytes: actual_total,
        })
    }

    /// Normalize an entry name to a relative `/`-separated path, rejecting
    /// anything that could escape the extraction root
    pub fn normalize(&self, name: &str) -> Result<String> {
        let unsafe_path = |reason: &str| {
            AppError::validation(ZIP_UNSAFE_PATH, format!("{}: {}", reason, name))
        };

        if name.is_empty() {
            return Err(unsafe_path("empty entry name"));
        }
        if name.starts_with('/') || name.starts_with('\\') {
            return Err(unsafe_path("absolute path"));
        }
        let bytes = name.as_bytes();
        if bytes.len() >= 2 && bytes[1] == b':' {
            return Err(unsafe_path("drive letter"));
        }

        let mut parts = Vec::new();
        for component in name.split(['/', '\\']) {
            match component {
                "" | "." => continue,
                ".." => return Err(unsafe_path("parent traversal")),
                part => {
                    if part.contains(':') {
                        return Err(unsafe_path("drive or stream separator"));
                    }
                    if is_reserved(part) {
                        return Err(unsafe_path("reserved device name"));
                    }
                    parts.push(part);
                }
            }
        }

        if parts.is_empty() {
            return Err(unsafe_path("empty entry name"));
        }
        if parts.len() > self.limits.max_depth {
            return Err(AppError::validation(
                ZIP_TOO_DEEP,
                format!(
                    "{} is {} levels deep, limit is {}",
                    name,
                    parts.len(),
                    self.limits.max_depth
                ),
            ));
        }
        Ok(parts.join("/"))
    }
}

fn too_large(message: String) -> AppError {
    AppError::validation(ZIP_TOO_LARGE, message)
}

/// Windows device names, with or without an extension, in any case
fn is_reserved(component: &str) -> bool {
    let stem = component.split('.').next().unwrap_or(component).trim_end();
    RESERVED_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(stem))
}

fn content_hash(entries: &[ManifestEntry]) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(entry.path.as_bytes());
        hasher.update(b"\0");
        hasher.update(entry.sha256.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

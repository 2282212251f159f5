use super::zip_guard::ZipGuard;
use crate::error::{AppError, Result};
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

/// Extract an archive into `snapshots_dir/{commit_hash}`.
///
/// Files are written to a temporary directory beside the target and renamed
/// into place, so a snapshot directory is either complete or absent. Returns
/// `false` when the snapshot was already extracted.
pub fn extract_snapshot(
    guard: &ZipGuard,
    bytes: &[u8],
    snapshots_dir: &Path,
    commit_hash: &str,
) -> Result<bool> {
    let target = snapshots_dir.join(commit_hash);
    if target.exists() {
        return Ok(false);
    }
    fs::create_dir_all(snapshots_dir)?;

    let staging = tempfile::Builder::new()
        .prefix(&format!(".{}-", commit_hash))
        .tempdir_in(snapshots_dir)?;

    let limit = guard.limits().max_uncompressed_bytes;
    let mut written: u64 = 0;
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        let relative = guard.normalize(entry.name())?;
        let path = staging.path().join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&path)?;
            continue;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let budget = limit.saturating_sub(written);
        let mut out = fs::File::create(&path)?;
        let copied = std::io::copy(&mut entry.take(budget.saturating_add(1)), &mut out)?;
        if copied > budget {
            return Err(AppError::validation(
                super::zip_guard::ZIP_TOO_LARGE,
                format!("{} inflates past the {} byte limit", relative, limit),
            ));
        }
        out.flush()?;
        written += copied;
    }

    match fs::rename(staging.path(), &target) {
        Ok(()) => {
            tracing::info!(target = ?target, bytes = written, "Snapshot extracted");
            Ok(true)
        }
        // A concurrent extraction of the same content won the rename
        Err(_) if target.exists() => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Where an extracted snapshot lives
pub fn snapshot_dir(snapshots_dir: &Path, commit_hash: &str) -> PathBuf {
    snapshots_dir.join(commit_hash)
}

/// Read a snapshot file, returning `None` when it is not valid UTF-8
pub fn read_source(root: &Path, relative: &str) -> Result<Option<String>> {
    let mut bytes = Vec::new();
    fs::File::open(root.join(relative))?.read_to_end(&mut bytes)?;
    Ok(String::from_utf8(bytes).ok())
}

//! Upload intake: archive validation, content hashing, upload persistence and
//! snapshot extraction.

pub mod extract;
pub mod zip_guard;

pub use extract::{extract_snapshot, read_source, snapshot_dir};
pub use zip_guard::{ManifestEntry, ZipGuard, ZipLimits, ZipManifest};

use crate::error::{AppError, Result};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Path of the stored upload for a job
pub fn upload_path(uploads_dir: &Path, job_id: &Uuid) -> PathBuf {
    uploads_dir.join(format!("{}.zip", job_id))
}

/// Persist the raw upload so the ingest task can run on any worker
pub async fn store_upload(uploads_dir: &Path, job_id: &Uuid, bytes: &[u8]) -> Result<PathBuf> {
    tokio::fs::create_dir_all(uploads_dir).await?;
    let path = upload_path(uploads_dir, job_id);
    tokio::fs::write(&path, bytes).await?;
    Ok(path)
}

pub async fn load_upload(uploads_dir: &Path, job_id: &Uuid) -> Result<Vec<u8>> {
    let path = upload_path(uploads_dir, job_id);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AppError::NotFound(format!(
            "upload for job {} is missing",
            job_id
        ))),
        Err(e) => Err(e.into()),
    }
}

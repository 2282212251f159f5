//! Object layout: `repos/{repoId}/snapshots/{commitHash}/{settingsHash}/{kind}.v{n}.json`
//!
//! Version metadata sits next to the payload as `{kind}.v{n}.meta.json`, which
//! never matches the payload pattern.

use crate::error::{AppError, Result};
use crate::models::{ArtifactKey, ArtifactKind};
use lazy_static::lazy_static;
use regex::Regex;
use std::str::FromStr;

lazy_static! {
    static ref PAYLOAD_NAME: Regex =
        Regex::new(r"^([a-z]+)\.v([0-9]+)\.json$").expect("valid artifact name pattern");
}

/// Directory holding every settings scope of one snapshot
pub fn snapshot_prefix(repo_id: &str, commit_hash: &str) -> String {
    format!("repos/{}/snapshots/{}", repo_id, commit_hash)
}

/// Directory holding every version of every kind under one settings hash
pub fn scope_prefix(key: &ArtifactKey) -> String {
    format!(
        "{}/{}",
        snapshot_prefix(&key.repo_id, &key.commit_hash),
        key.settings_hash
    )
}

pub fn payload_name(kind: ArtifactKind, version: u32) -> String {
    format!("{}.v{}.json", kind, version)
}

pub fn meta_name(kind: ArtifactKind, version: u32) -> String {
    format!("{}.v{}.meta.json", kind, version)
}

pub fn payload_path(key: &ArtifactKey, version: u32) -> String {
    format!("{}/{}", scope_prefix(key), payload_name(key.kind, version))
}

pub fn meta_path(key: &ArtifactKey, version: u32) -> String {
    format!("{}/{}", scope_prefix(key), meta_name(key.kind, version))
}

/// Parse `{kind}.v{n}.json`; metadata files and unknown kinds yield `None`
pub fn parse_payload_name(name: &str) -> Option<(ArtifactKind, u32)> {
    let caps = PAYLOAD_NAME.captures(name)?;
    let kind = ArtifactKind::from_str(caps.get(1)?.as_str()).ok()?;
    let version = caps.get(2)?.as_str().parse().ok()?;
    Some((kind, version))
}

/// Reject identifiers that would escape their directory
pub fn check_segment(label: &str, segment: &str) -> Result<()> {
    let valid = !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(AppError::validation(
            "invalid_identifier",
            format!("{} '{}' is not a valid path segment", label, segment),
        ))
    }
}

pub fn check_key(key: &ArtifactKey) -> Result<()> {
    check_segment("repo id", &key.repo_id)?;
    check_segment("commit hash", &key.commit_hash)?;
    check_segment("settings hash", &key.settings_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_path_layout() {
        let key = ArtifactKey::new("r1", "c0ffee", "s1", ArtifactKind::Graph);
        assert_eq!(
            payload_path(&key, 3),
            "repos/r1/snapshots/c0ffee/s1/graph.v3.json"
        );
        assert_eq!(
            meta_path(&key, 3),
            "repos/r1/snapshots/c0ffee/s1/graph.v3.meta.json"
        );
    }

    #[test]
    fn test_parse_payload_name() {
        assert_eq!(
            parse_payload_name("summaries.v12.json"),
            Some((ArtifactKind::Summaries, 12))
        );
        assert_eq!(parse_payload_name("graph.v1.meta.json"), None);
        assert_eq!(parse_payload_name("unknown.v1.json"), None);
        assert_eq!(parse_payload_name("graph.json"), None);
    }

    #[test]
    fn test_segments_cannot_escape() {
        assert!(check_segment("repo id", "abc-123_x").is_ok());
        assert!(check_segment("repo id", "..").is_err());
        assert!(check_segment("repo id", "a/b").is_err());
        assert!(check_segment("repo id", "").is_err());
    }
}

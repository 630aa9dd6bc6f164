//! Shared value types for the synchronization engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Name of the metadata directory that marks a checkout root.
pub const META_DIR_NAME: &str = ".firmament";

/// Prefix for temporary download files created next to their final path.
pub const TEMP_FILE_PREFIX: &str = ".firmament-temp.";

/// Reserved content hash marking a tombstone FileVersion entry.
pub const DELETED_SENTINEL: &str = "__deleted__";

/// This checkout's record of one on-disk file.
///
/// `content_hash` is `None` between the scanner observing a file and the
/// hasher digesting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalVersionData {
    pub content_hash: Option<String>,
    /// Modification time in whole seconds since the epoch.
    pub mtime: i64,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_hashed: Option<i64>,
}

/// Timestamp and size recorded for one `(path, content_hash)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersionMeta {
    pub mtime: i64,
    pub size: u64,
}

/// Per-path history of observed content hashes.
pub type FileVersionData = BTreeMap<String, FileVersionMeta>;

/// The global `path -> {content_hash -> meta}` map exchanged with backends.
pub type FileVersionSet = BTreeMap<String, FileVersionData>;

/// Per-subtree sync policy, resolved by walking a path's ancestors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PathStatus {
    /// Keep the subtree fully materialized, propagating deletions.
    Full,
    /// Track versions but do not download bodies.
    OnDemand,
    /// Download everything currently known, then revert to on-demand.
    DownloadOnce,
    /// Do not sync the subtree at all.
    Ignore,
}

impl PathStatus {
    /// Whether the materializer should create local files under this policy.
    pub fn materializes(self) -> bool {
        matches!(self, PathStatus::Full | PathStatus::DownloadOnce)
    }
}

impl std::fmt::Display for PathStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PathStatus::Full => "full",
            PathStatus::OnDemand => "on-demand",
            PathStatus::DownloadOnce => "download-once",
            PathStatus::Ignore => "ignore",
        };
        f.write_str(name)
    }
}

/// A file's modification time in whole seconds since the epoch.
pub fn file_mtime_secs(metadata: &std::fs::Metadata) -> std::io::Result<i64> {
    let modified = metadata.modified()?;
    Ok(
        match modified.duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
            Err(_) => 0,
        },
    )
}

/// Current wall-clock time in whole seconds since the epoch.
pub fn unix_time() -> i64 {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_status_round_trips_as_literal_strings() {
        for (status, literal) in [
            (PathStatus::Full, "full"),
            (PathStatus::OnDemand, "on-demand"),
            (PathStatus::DownloadOnce, "download-once"),
            (PathStatus::Ignore, "ignore"),
        ] {
            let packed = rmp_serde::to_vec(&status).unwrap();
            let unpacked: PathStatus = rmp_serde::from_slice(&packed).unwrap();
            assert_eq!(unpacked, status);
            assert_eq!(status.to_string(), literal);
        }
    }

    #[test]
    fn local_version_tolerates_missing_last_hashed() {
        let data = LocalVersionData {
            content_hash: None,
            mtime: 100,
            size: 5,
            last_hashed: None,
        };
        let packed = rmp_serde::to_vec_named(&data).unwrap();
        let unpacked: LocalVersionData = rmp_serde::from_slice(&packed).unwrap();
        assert_eq!(unpacked, data);
    }
}

//! Materializes remote file versions into the local checkout, and applies
//! tombstones to files deleted elsewhere.

use std::fs;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use filetime::FileTime;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::hash::sha256_file;
use crate::types::{DELETED_SENTINEL, LocalVersionData, TEMP_FILE_PREFIX};

use super::{Operator, StepError};

/// Bound on combined creations and deletions per step.
const MAX_PER_STEP: u64 = 20;

pub struct LocalCreate {
    config: Arc<Config>,
}

impl LocalCreate {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Download the content into the temp path from the first backend that
    /// has it, verifying the digest. Returns false when no backend could
    /// serve an intact copy.
    fn download_verified(&self, content_hash: &str, temp_path: &std::path::Path) -> bool {
        for backend in self.config.backends() {
            match backend.content_exists(content_hash) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    warn!(
                        backend = backend.name(),
                        hash = %content_hash,
                        error = %err,
                        "content existence check failed"
                    );
                    continue;
                }
            }
            debug!(
                backend = backend.name(),
                hash = %content_hash,
                "downloading content"
            );
            if let Err(err) = backend.content_download(content_hash, temp_path) {
                warn!(
                    backend = backend.name(),
                    hash = %content_hash,
                    error = %err,
                    "content download failed"
                );
                let _ = fs::remove_file(temp_path);
                continue;
            }
            match sha256_file(temp_path) {
                Ok(actual) if actual == content_hash => return true,
                Ok(actual) => {
                    warn!(
                        backend = backend.name(),
                        expected = %content_hash,
                        actual = %actual,
                        "downloaded content failed verification, discarding"
                    );
                    let _ = fs::remove_file(temp_path);
                }
                Err(err) => {
                    warn!(error = %err, "could not verify downloaded content");
                    let _ = fs::remove_file(temp_path);
                }
            }
        }
        false
    }
}

impl Operator for LocalCreate {
    fn name(&self) -> &'static str {
        "local-create"
    }

    fn short_interval(&self) -> Duration {
        Duration::from_millis(500)
    }

    fn step(&mut self) -> Result<bool, StepError> {
        let mut worked = 0u64;

        let local_paths: std::collections::HashSet<String> =
            self.config.local_versions.keys()?.into_iter().collect();
        for path in self.config.file_versions.keys()? {
            if worked >= MAX_PER_STEP {
                break;
            }
            if local_paths.contains(&path) {
                continue;
            }
            let status = self.config.path_requests.resolve_status(&path)?;
            if !status.materializes() {
                continue;
            }
            let Some((content_hash, meta)) = self.config.file_versions.most_recent_content(&path)?
            else {
                continue;
            };
            // Tombstoned paths are handled in the deletion pass below.
            if content_hash == DELETED_SENTINEL {
                continue;
            }

            let final_path = self.config.disk_path(&path);
            if let Some(parent) = final_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let Some(file_name) = final_path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let temp_path = final_path.with_file_name(format!("{TEMP_FILE_PREFIX}{file_name}"));

            if !self.download_verified(&content_hash, &temp_path) {
                warn!(
                    path = %path,
                    hash = %content_hash,
                    "content not available on any backend"
                );
                continue;
            }
            filetime::set_file_mtime(&temp_path, FileTime::from_unix_time(meta.mtime, 0))?;

            // The file must be in place before its LocalVersion exists: a
            // LocalVersion without its file reads as a local deletion and
            // gets tombstoned.
            fs::rename(&temp_path, &final_path)?;
            // Hash left empty so the hasher re-verifies what actually
            // landed on disk.
            self.config.local_versions.set(
                &path,
                &LocalVersionData {
                    content_hash: None,
                    mtime: meta.mtime,
                    size: meta.size,
                    last_hashed: None,
                },
            )?;
            info!(path = %path, hash = %content_hash, "file materialized");
            worked += 1;
        }

        // Apply tombstones from other checkouts.
        for path in self.config.file_versions.deleted_paths()? {
            if worked >= MAX_PER_STEP {
                break;
            }
            if !self.config.local_versions.contains(&path)? {
                continue;
            }
            match fs::remove_file(self.config.disk_path(&path)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            self.config.local_versions.delete(&path)?;
            info!(path = %path, "deleted file removed locally");
            worked += 1;
        }

        Ok(worked > 0)
    }
}

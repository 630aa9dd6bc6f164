//! Walks the checkout and records what is on disk.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::io;
use std::sync::Arc;

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::Config;
use crate::types::{
    DELETED_SENTINEL, FileVersionMeta, LocalVersionData, META_DIR_NAME, file_mtime_secs, unix_time,
};

use super::{Operator, StepError};

/// Discovers new and modified files as LocalVersions, and turns on-disk
/// deletions into tombstone FileVersions for fully-synced paths.
pub struct LocalScanner {
    config: Arc<Config>,
}

impl LocalScanner {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl Operator for LocalScanner {
    fn name(&self) -> &'static str {
        "local-scanner"
    }

    fn step(&mut self) -> Result<bool, StepError> {
        let mut scanned = 0u64;
        let mut changed = 0u64;
        let mut seen = HashSet::new();

        let walker = WalkDir::new(self.config.root_path())
            .into_iter()
            .filter_entry(|entry| entry.file_name() != OsStr::new(META_DIR_NAME));
        for entry in walker {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(file_name) = entry.file_name().to_str() else {
                continue;
            };
            // Metadata-prefixed names cover our own temp downloads too.
            if file_name.starts_with(META_DIR_NAME) {
                continue;
            }
            scanned += 1;

            let relative = entry
                .path()
                .strip_prefix(self.config.root_path())
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
            let Some(relative) = relative.to_str() else {
                continue;
            };
            let virtual_path = format!("/{relative}");
            seen.insert(virtual_path.clone());

            let metadata = entry.metadata().map_err(io::Error::from)?;
            let new_data = LocalVersionData {
                content_hash: None,
                mtime: file_mtime_secs(&metadata)?,
                size: metadata.len(),
                last_hashed: None,
            };
            let stale = match self.config.local_versions.get(&virtual_path)? {
                None => true,
                Some(existing) => existing.mtime < new_data.mtime,
            };
            if stale {
                self.config.local_versions.set(&virtual_path, &new_data)?;
                debug!(path = %virtual_path, mtime = new_data.mtime, "local file recorded");
                changed += 1;
            }
        }

        // Anything left in the store but not on disk was deleted locally.
        for path in self.config.local_versions.keys()? {
            if seen.contains(&path) {
                continue;
            }
            let status = self.config.path_requests.resolve_status(&path)?;
            if status == crate::types::PathStatus::Full {
                self.config.file_versions.set_with_content(
                    &path,
                    DELETED_SENTINEL,
                    FileVersionMeta {
                        mtime: unix_time(),
                        size: 0,
                    },
                )?;
                info!(path = %path, "local deletion recorded");
            } else {
                debug!(path = %path, %status, "forgetting deleted local file");
            }
            self.config.local_versions.delete(&path)?;
            changed += 1;
        }

        debug!(scanned, "scan pass complete");
        Ok(changed > 0)
    }
}

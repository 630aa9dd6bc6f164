//! Retires download-once policies whose work is finished.
//!
//! A `download-once` PathRequest only exists to pull the subtree in; once
//! every live FileVersion under the prefix has a LocalVersion, the request
//! is removed so the subtree reverts to its surrounding policy instead of
//! being retained forever.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::config::Config;
use crate::types::PathStatus;

use super::{Operator, StepError};

pub struct DownloadOnceCleanup {
    config: Arc<Config>,
}

impl DownloadOnceCleanup {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl Operator for DownloadOnceCleanup {
    fn name(&self) -> &'static str {
        "download-once-cleanup"
    }

    fn step(&mut self) -> Result<bool, StepError> {
        let mut cleaned = 0u64;
        let requests = self.config.path_requests.items()?;
        if requests
            .iter()
            .all(|(_, status)| *status != PathStatus::DownloadOnce)
        {
            return Ok(false);
        }

        let file_paths = self.config.file_versions.keys()?;
        // Tombstoned paths never materialize and must not hold the
        // request open.
        let deleted: HashSet<String> =
            self.config.file_versions.deleted_paths()?.into_iter().collect();

        for (request_path, status) in requests {
            if status != PathStatus::DownloadOnce {
                continue;
            }
            let prefix = if request_path == "/" {
                "/".to_owned()
            } else {
                format!("{request_path}/")
            };
            let mut all_downloaded = true;
            for file_path in &file_paths {
                if *file_path != request_path && !file_path.starts_with(&prefix) {
                    continue;
                }
                if deleted.contains(file_path) {
                    continue;
                }
                if !self.config.local_versions.contains(file_path)? {
                    all_downloaded = false;
                    break;
                }
            }
            if all_downloaded {
                debug!(
                    path = %request_path,
                    "download-once subtree fully materialized, removing request"
                );
                self.config.path_requests.delete(&request_path)?;
                cleaned += 1;
            }
        }
        Ok(cleaned > 0)
    }
}

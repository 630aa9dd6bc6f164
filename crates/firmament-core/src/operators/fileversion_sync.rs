//! Exchanges FileVersion sets with every backend.
//!
//! This is the cross-checkout propagation mechanism: remote entries merge
//! into the local store, then the merged set is pushed back so every
//! backend converges on the union. Concurrent writers are resolved by the
//! per-backend optimistic merge loop.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::backend::BackendError;
use crate::config::Config;

use super::{Operator, StepError};

pub struct FileVersionSync {
    config: Arc<Config>,
}

impl FileVersionSync {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl Operator for FileVersionSync {
    fn name(&self) -> &'static str {
        "fileversion-sync"
    }

    fn short_interval(&self) -> Duration {
        Duration::from_secs(5)
    }

    fn step(&mut self) -> Result<bool, StepError> {
        let mut merged = self.config.file_versions.all()?;
        let mut new_entries = 0u64;

        for backend in self.config.backends() {
            let remote = match backend.file_version_download() {
                Ok(remote) => remote,
                Err(err) => {
                    warn!(
                        backend = backend.name(),
                        error = %err,
                        "file-versions download failed"
                    );
                    continue;
                }
            };
            for (path, contents) in remote {
                for (content_hash, meta) in contents {
                    let known = merged
                        .get(&path)
                        .is_some_and(|entries| entries.contains_key(&content_hash));
                    if known {
                        continue;
                    }
                    self.config
                        .file_versions
                        .set_with_content(&path, &content_hash, meta)?;
                    merged
                        .entry(path.clone())
                        .or_default()
                        .insert(content_hash.clone(), meta);
                    debug!(path = %path, hash = %content_hash, "new remote file version");
                    new_entries += 1;
                }
            }
        }

        for backend in self.config.backends() {
            match backend.file_version_upload(&merged) {
                Ok(()) => {}
                // An exhausted merge loop means we lost a hundred races in
                // a row; that is worth the error back-off, not a shrug.
                Err(err @ BackendError::MergeExhausted { .. }) => return Err(err.into()),
                Err(err) => {
                    warn!(
                        backend = backend.name(),
                        error = %err,
                        "file-versions upload failed"
                    );
                }
            }
        }

        Ok(new_entries > 0)
    }
}

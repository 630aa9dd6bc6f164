//! Pushes local content bodies to every backend that lacks them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::Config;

use super::{Operator, StepError};

pub struct ContentUpload {
    config: Arc<Config>,
}

impl ContentUpload {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl Operator for ContentUpload {
    fn name(&self) -> &'static str {
        "content-upload"
    }

    fn short_interval(&self) -> Duration {
        Duration::from_secs(10)
    }

    fn step(&mut self) -> Result<bool, StepError> {
        let local_hashes = self.config.local_versions.all_content_hashes()?;
        let mut placements: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut uploaded = 0u64;

        for backend in self.config.backends() {
            let remote_hashes = match backend.content_list() {
                Ok(hashes) => hashes,
                Err(err) => {
                    warn!(backend = backend.name(), error = %err, "content listing failed");
                    continue;
                }
            };
            for hash in &remote_hashes {
                placements
                    .entry(hash.clone())
                    .or_default()
                    .push(backend.name().to_owned());
            }

            for missing in local_hashes.difference(&remote_hashes) {
                let Some((path, _)) = self.config.local_versions.by_content_hash(missing)? else {
                    continue;
                };
                let disk_path = self.config.disk_path(&path);
                if !disk_path.is_file() {
                    // The file went away between hashing and upload; the
                    // scanner will reconcile the store.
                    warn!(path = %path, hash = %missing, "local file vanished before upload");
                    continue;
                }
                match backend.content_upload(missing, &disk_path) {
                    Ok(()) => {
                        debug!(
                            backend = backend.name(),
                            hash = %missing,
                            "content uploaded"
                        );
                        placements
                            .entry(missing.clone())
                            .or_default()
                            .push(backend.name().to_owned());
                        uploaded += 1;
                    }
                    Err(err) => {
                        warn!(
                            backend = backend.name(),
                            hash = %missing,
                            error = %err,
                            "content upload failed"
                        );
                    }
                }
            }
        }

        // The placement map is advisory and rebuilt from scratch each pass.
        self.config.content_backends.set_all(&placements)?;
        Ok(uploaded > 0)
    }
}

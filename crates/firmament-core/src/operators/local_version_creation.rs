//! Promotes hashed LocalVersions into the global FileVersion history.

use std::sync::Arc;

use tracing::debug;

use crate::config::Config;
use crate::types::FileVersionMeta;

use super::{Operator, StepError};

pub struct LocalVersionCreation {
    config: Arc<Config>,
}

impl LocalVersionCreation {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl Operator for LocalVersionCreation {
    fn name(&self) -> &'static str {
        "local-version-creation"
    }

    fn step(&mut self) -> Result<bool, StepError> {
        let mut added = 0u64;
        let missing = self
            .config
            .local_versions
            .not_in_file_versions(&self.config.file_versions)?;
        for (path, data) in missing {
            let Some(content_hash) = data.content_hash else {
                continue;
            };
            self.config.file_versions.set_with_content(
                &path,
                &content_hash,
                FileVersionMeta {
                    mtime: data.mtime,
                    size: data.size,
                },
            )?;
            debug!(path = %path, hash = %content_hash, "file version added");
            added += 1;
        }
        Ok(added > 0)
    }
}

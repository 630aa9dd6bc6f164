//! Digests files the scanner has observed but not yet hashed.

use std::fs::File;
use std::io;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::Config;
use crate::hash::sha256_reader;
use crate::types::{LocalVersionData, file_mtime_secs, unix_time};

use super::{Operator, StepError};

pub struct LocalHasher {
    config: Arc<Config>,
}

impl LocalHasher {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl Operator for LocalHasher {
    fn name(&self) -> &'static str {
        "local-hasher"
    }

    fn step(&mut self) -> Result<bool, StepError> {
        let mut hashed = 0u64;
        for path in self.config.local_versions.without_content_hashes()? {
            let disk_path = self.config.disk_path(&path);
            let file = match File::open(&disk_path) {
                Ok(file) => file,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    // Deleted between scan and hash; the scanner will
                    // forget the entry on its next pass.
                    warn!(path = %path, "file vanished before hashing");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            // Stat the open handle so hash and metadata describe the same
            // inode even if the path is replaced mid-hash.
            let metadata = file.metadata()?;
            let content_hash = sha256_reader(&file)?;
            self.config.local_versions.set(
                &path,
                &LocalVersionData {
                    content_hash: Some(content_hash.clone()),
                    mtime: file_mtime_secs(&metadata)?,
                    size: metadata.len(),
                    last_hashed: Some(unix_time()),
                },
            )?;
            debug!(path = %path, hash = %content_hash, "file hashed");
            hashed += 1;
        }
        Ok(hashed > 0)
    }
}

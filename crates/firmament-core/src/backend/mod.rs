//! Replica targets: content-addressed blob storage plus shared metadata
//! files with optimistic concurrency.
//!
//! Every backend is split in two layers. The low level ([`RemoteStore`])
//! moves encrypted bytes to and from opaque remote paths and hands out
//! version tokens (mtime-ns locally, ETag on object stores). The high level
//! ([`Backend`]) composes it into content operations and the two metadata
//! files (`database-contents`, `database-file-versions`), including the
//! read-merge-write loop that lets concurrent checkouts converge.

pub mod local;
pub mod rclone;
pub mod s3;

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::encrypt::EncryptError;
use crate::types::FileVersionSet;

/// Attempts before giving up on the metadata merge loop.
const MERGE_RETRY_LIMIT: u32 = 100;

/// Characters of the encrypted identifier used as the shard prefix,
/// bounding top-level fan-out to roughly 4096 entries.
pub(crate) const SHARD_PREFIX_LEN: usize = 3;

#[derive(Error, Debug)]
pub enum BackendError {
    /// Optimistic-concurrency mismatch on a metadata write.
    #[error("remote version changed: expected {expected}, found {found}")]
    Version { expected: String, found: String },

    #[error("remote object not found: {path}")]
    NotFound { path: String },

    #[error("bucket {bucket:?} does not exist")]
    BucketMissing { bucket: String },

    #[error("access denied to bucket {bucket:?}")]
    AccessDenied { bucket: String },

    /// The merge loop lost every race it entered.
    #[error("could not write clean version of {path} after {attempts} attempts")]
    MergeExhausted { path: String, attempts: u32 },

    #[error("failed to decode metadata file {path}: {reason}")]
    Decode { path: String, reason: String },

    /// Decryption failure on a remote read: tampering or truncation.
    #[error("integrity failure: {0}")]
    Integrity(EncryptError),

    #[error("backend io error: {0}")]
    Io(io::Error),

    /// Storage-specific failure (SDK error, subprocess crash, bad root).
    #[error("{0}")]
    Storage(String),
}

impl From<io::Error> for BackendError {
    fn from(err: io::Error) -> Self {
        // Surface chunk authentication failures distinctly; the encryption
        // readers report them as InvalidData wrapping an EncryptError.
        if err.kind() == io::ErrorKind::InvalidData
            && err.get_ref().is_some_and(|inner| inner.is::<EncryptError>())
        {
            let inner = err.into_inner().expect("inner error checked above");
            let encrypt = inner.downcast::<EncryptError>().expect("type checked above");
            return BackendError::Integrity(*encrypt);
        }
        BackendError::Io(err)
    }
}

impl From<EncryptError> for BackendError {
    fn from(err: EncryptError) -> Self {
        BackendError::Integrity(err)
    }
}

/// Low-level remote storage: encrypted bytes at opaque paths.
///
/// Implementations encrypt on write and decrypt on read, so callers only
/// ever see plaintext. All methods must be safe to call from multiple
/// threads and multiple processes at once.
pub trait RemoteStore: Send + Sync {
    /// Human-readable description for logs ("Local (root /srv/store)").
    fn describe(&self) -> String;

    /// How often the content index may be rebuilt by walking the remote.
    fn content_rebuild_interval(&self) -> Duration;

    /// Stream the decrypted object at `path` into `sink`, returning the
    /// version token the object had while being read.
    fn remote_read_io(&self, path: &str, sink: &mut dyn Write) -> Result<String, BackendError>;

    /// Stream `source` into `path`, encrypting. With `expected_version`,
    /// refuse (with [`BackendError::Version`]) when the remote object's
    /// current token differs. `is_content` hints that cold-storage classes
    /// may apply.
    fn remote_write_io(
        &self,
        path: &str,
        source: &mut dyn Read,
        expected_version: Option<&str>,
        is_content: bool,
    ) -> Result<(), BackendError>;

    fn remote_exists(&self, path: &str) -> Result<bool, BackendError>;

    fn remote_delete(&self, path: &str) -> Result<(), BackendError>;

    /// Every content hash stored on the remote, found by walking the
    /// content tree and decrypting object names.
    fn remote_content_walk(&self) -> Result<Vec<String>, BackendError>;

    /// Remote path for a content body, sharded by encrypted-identifier
    /// prefix.
    fn remote_content_path(&self, sha256: &str) -> Result<String, BackendError>;

    /// Remote path for a metadata file.
    fn remote_database_path(&self, name: &str) -> String {
        format!("database-{name}")
    }
}

/// A named replica target: a [`RemoteStore`] plus the content-index cache
/// and metadata-file logic shared by every backend kind.
pub struct Backend {
    name: String,
    store: Box<dyn RemoteStore>,
    /// Hashes uploaded since the last index rebuild; unioned into
    /// `content_list` until the next rebuild observes them.
    extra_content_known: Mutex<HashSet<String>>,
    last_content_rebuild: Mutex<Option<Instant>>,
}

impl Backend {
    pub fn new(name: impl Into<String>, store: Box<dyn RemoteStore>) -> Self {
        Self {
            name: name.into(),
            store,
            extra_content_known: Mutex::new(HashSet::new()),
            last_content_rebuild: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn describe(&self) -> String {
        self.store.describe()
    }

    /// Read a whole remote object into memory, with its version token.
    pub fn remote_read_bytes(&self, path: &str) -> Result<(Vec<u8>, String), BackendError> {
        let mut buffer = Vec::new();
        let version = self.store.remote_read_io(path, &mut buffer)?;
        Ok((buffer, version))
    }

    /// Write a byte slice to a remote path.
    pub fn remote_write_bytes(
        &self,
        path: &str,
        content: &[u8],
        expected_version: Option<&str>,
        is_content: bool,
    ) -> Result<(), BackendError> {
        let mut source = content;
        self.store
            .remote_write_io(path, &mut source, expected_version, is_content)
    }

    pub fn content_exists(&self, sha256: &str) -> Result<bool, BackendError> {
        let path = self.store.remote_content_path(sha256)?;
        self.store.remote_exists(&path)
    }

    /// Upload a content body from a local file. Blocks until complete.
    #[instrument(level = "debug", skip(self, disk_path), fields(backend = %self.name))]
    pub fn content_upload(&self, sha256: &str, disk_path: &Path) -> Result<(), BackendError> {
        let path = self.store.remote_content_path(sha256)?;
        let mut source = BufReader::new(File::open(disk_path)?);
        self.store
            .remote_write_io(&path, &mut source, None, true)?;
        self.extra_content_known
            .lock()
            .expect("extras mutex poisoned")
            .insert(sha256.to_owned());
        Ok(())
    }

    /// Download a content body into a local file.
    #[instrument(level = "debug", skip(self, disk_path), fields(backend = %self.name))]
    pub fn content_download(&self, sha256: &str, disk_path: &Path) -> Result<(), BackendError> {
        let path = self.store.remote_content_path(sha256)?;
        let mut sink = BufWriter::new(File::create(disk_path)?);
        self.store.remote_read_io(&path, &mut sink)?;
        sink.flush()?;
        Ok(())
    }

    pub fn content_delete(&self, sha256: &str) -> Result<(), BackendError> {
        let path = self.store.remote_content_path(sha256)?;
        self.store.remote_delete(&path)?;
        self.extra_content_known
            .lock()
            .expect("extras mutex poisoned")
            .remove(sha256);
        Ok(())
    }

    /// The set of content hashes this backend holds: the persisted index
    /// plus anything uploaded since it was last rebuilt.
    pub fn content_list(&self) -> Result<HashSet<String>, BackendError> {
        let rebuild_due = {
            let last = self
                .last_content_rebuild
                .lock()
                .expect("rebuild mutex poisoned");
            match *last {
                Some(at) => at.elapsed() > self.store.content_rebuild_interval(),
                None => true,
            }
        };
        if rebuild_due {
            self.rebuild_content_index()?;
            *self
                .last_content_rebuild
                .lock()
                .expect("rebuild mutex poisoned") = Some(Instant::now());
        }

        let index_path = self.store.remote_database_path("contents");
        let mut result: HashSet<String> = if self.store.remote_exists(&index_path)? {
            let (raw, _) = self.remote_read_bytes(&index_path)?;
            let hashes: Vec<String> =
                rmp_serde::from_slice(&raw).map_err(|err| BackendError::Decode {
                    path: index_path.clone(),
                    reason: err.to_string(),
                })?;
            hashes.into_iter().collect()
        } else {
            HashSet::new()
        };
        result.extend(
            self.extra_content_known
                .lock()
                .expect("extras mutex poisoned")
                .iter()
                .cloned(),
        );
        Ok(result)
    }

    /// Walk the remote and overwrite the content index file.
    ///
    /// The extras set is snapshotted before the walk and only the snapshot
    /// is cleared afterwards, so uploads landing mid-walk stay visible
    /// until the next rebuild picks them up.
    fn rebuild_content_index(&self) -> Result<(), BackendError> {
        let snapshot: HashSet<String> = self
            .extra_content_known
            .lock()
            .expect("extras mutex poisoned")
            .clone();
        let hashes = self.store.remote_content_walk()?;
        let index_path = self.store.remote_database_path("contents");
        let encoded = rmp_serde::to_vec(&hashes)
            .map_err(|err| BackendError::Storage(format!("failed to encode content index: {err}")))?;
        self.remote_write_bytes(&index_path, &encoded, None, false)?;
        self.extra_content_known
            .lock()
            .expect("extras mutex poisoned")
            .retain(|hash| !snapshot.contains(hash));
        debug!(backend = %self.name, count = hashes.len(), "content index rebuilt");
        Ok(())
    }

    /// All file versions this backend knows about; empty if the metadata
    /// file does not exist yet.
    pub fn file_version_download(&self) -> Result<FileVersionSet, BackendError> {
        let path = self.store.remote_database_path("file-versions");
        if !self.store.remote_exists(&path)? {
            return Ok(FileVersionSet::new());
        }
        let (raw, _) = self.remote_read_bytes(&path)?;
        rmp_serde::from_slice(&raw).map_err(|err| BackendError::Decode {
            path,
            reason: err.to_string(),
        })
    }

    /// Merge the given set into the remote file-versions metadata.
    ///
    /// Optimistic loop: read current state with its version token, union by
    /// `(path, content_hash)`, write back asserting the token. A losing
    /// race re-reads and retries, up to the retry limit.
    #[instrument(level = "debug", skip(self, file_versions), fields(backend = %self.name))]
    pub fn file_version_upload(&self, file_versions: &FileVersionSet) -> Result<(), BackendError> {
        let path = self.store.remote_database_path("file-versions");
        for attempt in 0..MERGE_RETRY_LIMIT {
            let (mut existing, version): (FileVersionSet, Option<String>) =
                if self.store.remote_exists(&path)? {
                    let (raw, version) = self.remote_read_bytes(&path)?;
                    let decoded =
                        rmp_serde::from_slice(&raw).map_err(|err| BackendError::Decode {
                            path: path.clone(),
                            reason: err.to_string(),
                        })?;
                    (decoded, Some(version))
                } else {
                    (FileVersionSet::new(), None)
                };

            for (file_path, contents) in file_versions {
                let entry = existing.entry(file_path.clone()).or_default();
                for (content_hash, meta) in contents {
                    entry.insert(content_hash.clone(), *meta);
                }
            }

            let encoded = rmp_serde::to_vec_named(&existing).map_err(|err| {
                BackendError::Storage(format!("failed to encode file versions: {err}"))
            })?;
            match self.remote_write_bytes(&path, &encoded, version.as_deref(), false) {
                Ok(()) => return Ok(()),
                Err(BackendError::Version { expected, found }) => {
                    debug!(
                        backend = %self.name,
                        attempt,
                        expected = %expected,
                        found = %found,
                        "file-versions write lost a race, retrying"
                    );
                }
                Err(other) => return Err(other),
            }
        }
        warn!(backend = %self.name, "file-versions merge retry limit exhausted");
        Err(BackendError::MergeExhausted {
            path,
            attempts: MERGE_RETRY_LIMIT,
        })
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("store", &self.store.describe())
            .finish_non_exhaustive()
    }
}

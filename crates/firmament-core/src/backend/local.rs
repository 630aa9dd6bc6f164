//! Local-filesystem remote store.
//!
//! The "remote" space is a directory subtree: content bodies under
//! `content/`, metadata files at `database-<name>`. Version tokens are the
//! file's mtime in nanoseconds rendered as a decimal string. Compare-and-set
//! holds an exclusive advisory lock across the stat-compare-write critical
//! section, which closes the race object stores cannot avoid. Reads take no
//! lock; truncated concurrent reads are caught by the per-chunk
//! authentication of the encryption layer.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::{Duration, UNIX_EPOCH};

use fs2::FileExt;
use tracing::warn;
use walkdir::WalkDir;

use crate::encrypt::Encryptor;

use super::{BackendError, RemoteStore, SHARD_PREFIX_LEN};

const CONTENT_REBUILD_INTERVAL: Duration = Duration::from_secs(60);

pub struct LocalStore {
    root: PathBuf,
    content_root: PathBuf,
    encryptor: Encryptor,
}

impl LocalStore {
    /// Open a storage root, initializing the layout on first use. A
    /// non-empty directory that is not already a storage root is refused
    /// rather than silently adopted.
    pub fn new(root: impl Into<PathBuf>, encryptor: Encryptor) -> Result<Self, BackendError> {
        let root = root.into();
        let content_root = root.join("content");
        if !content_root.is_dir() {
            fs::create_dir_all(&root)?;
            if fs::read_dir(&root)?.next().is_some() {
                return Err(BackendError::Storage(format!(
                    "cannot initialize storage root {}: directory is not empty",
                    root.display()
                )));
            }
            fs::create_dir_all(&content_root)?;
        }
        Ok(Self {
            root,
            content_root,
            encryptor,
        })
    }

    fn disk_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn mtime_ns(metadata: &fs::Metadata) -> Result<String, BackendError> {
        let modified = metadata.modified()?;
        let nanos = modified
            .duration_since(UNIX_EPOCH)
            .map_err(|err| BackendError::Storage(format!("mtime before epoch: {err}")))?
            .as_nanos();
        Ok(nanos.to_string())
    }

    /// Body of the write critical section, separated so the caller can
    /// release the lock on every exit path.
    fn locked_write(
        &self,
        file: &File,
        source: &mut dyn Read,
        expected_version: Option<&str>,
    ) -> Result<(), BackendError> {
        if let Some(expected) = expected_version {
            let found = Self::mtime_ns(&file.metadata()?)?;
            if found != expected {
                return Err(BackendError::Version {
                    expected: expected.to_owned(),
                    found,
                });
            }
        }
        file.set_len(0)?;
        let mut handle: &File = file;
        handle.seek(SeekFrom::Start(0))?;
        let mut reader = self.encryptor.encrypting_reader(source);
        let mut writer = BufWriter::new(file);
        io::copy(&mut reader, &mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

impl RemoteStore for LocalStore {
    fn describe(&self) -> String {
        format!("Local (root {})", self.root.display())
    }

    fn content_rebuild_interval(&self) -> Duration {
        CONTENT_REBUILD_INTERVAL
    }

    fn remote_read_io(&self, path: &str, sink: &mut dyn Write) -> Result<String, BackendError> {
        let disk = self.disk_path(path);
        let file = File::open(&disk).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                BackendError::NotFound {
                    path: path.to_owned(),
                }
            } else {
                err.into()
            }
        })?;
        let version = Self::mtime_ns(&file.metadata()?)?;
        let mut reader = self.encryptor.decrypting_reader(BufReader::new(file));
        io::copy(&mut reader, sink)?;
        Ok(version)
    }

    fn remote_write_io(
        &self,
        path: &str,
        source: &mut dyn Read,
        expected_version: Option<&str>,
        _is_content: bool,
    ) -> Result<(), BackendError> {
        let disk = self.disk_path(path);
        if let Some(parent) = disk.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Some(expected) = expected_version {
            if !disk.exists() {
                return Err(BackendError::Version {
                    expected: expected.to_owned(),
                    found: "<missing>".to_owned(),
                });
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&disk)?;
        FileExt::lock_exclusive(&file)?;
        let result = self.locked_write(&file, source, expected_version);
        let unlocked = FileExt::unlock(&file);
        result?;
        unlocked?;
        Ok(())
    }

    fn remote_exists(&self, path: &str) -> Result<bool, BackendError> {
        Ok(self.disk_path(path).is_file())
    }

    fn remote_delete(&self, path: &str) -> Result<(), BackendError> {
        match fs::remove_file(self.disk_path(path)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn remote_content_walk(&self) -> Result<Vec<String>, BackendError> {
        let mut hashes = Vec::new();
        for entry in WalkDir::new(&self.content_root) {
            let entry = entry.map_err(|err| BackendError::Storage(err.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            match self.encryptor.decrypt_identifier(name) {
                Ok(hash) => hashes.push(hash),
                Err(err) => {
                    warn!(
                        object = name,
                        error = %err,
                        "skipping undecryptable content object"
                    );
                }
            }
        }
        Ok(hashes)
    }

    fn remote_content_path(&self, sha256: &str) -> Result<String, BackendError> {
        let encrypted = self.encryptor.encrypt_identifier(sha256)?;
        Ok(format!(
            "content/{}/{}",
            &encrypted[..SHARD_PREFIX_LEN],
            encrypted
        ))
    }
}

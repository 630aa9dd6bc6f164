//! Typed wrappers around [`DiskStore`] for the four logical stores.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::types::{
    DELETED_SENTINEL, FileVersionData, FileVersionMeta, FileVersionSet, LocalVersionData,
    PathStatus,
};

use super::{DiskStore, StoreError};

/// What this checkout has on disk, keyed by `/`-rooted virtual path.
pub struct LocalVersionStore {
    store: DiskStore<LocalVersionData>,
}

impl LocalVersionStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            store: DiskStore::open(dir, true)?,
        })
    }

    pub fn get(&self, path: &str) -> Result<Option<LocalVersionData>, StoreError> {
        self.store.get(path)
    }

    pub fn set(&self, path: &str, data: &LocalVersionData) -> Result<(), StoreError> {
        self.store.set(path, data)
    }

    pub fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.store.delete(path)
    }

    pub fn contains(&self, path: &str) -> Result<bool, StoreError> {
        self.store.contains(path)
    }

    pub fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.store.keys()
    }

    pub fn items(&self) -> Result<Vec<(String, LocalVersionData)>, StoreError> {
        self.store.items()
    }

    pub fn len(&self) -> Result<u64, StoreError> {
        self.store.len()
    }

    /// First path whose content matches the given hash, if any.
    pub fn by_content_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<(String, LocalVersionData)>, StoreError> {
        for (path, data) in self.store.items()? {
            if data.content_hash.as_deref() == Some(content_hash) {
                return Ok(Some((path, data)));
            }
        }
        Ok(None)
    }

    /// Every distinct content hash present in the checkout.
    pub fn all_content_hashes(&self) -> Result<HashSet<String>, StoreError> {
        let mut hashes = HashSet::new();
        for (_, data) in self.store.items()? {
            if let Some(hash) = data.content_hash {
                hashes.insert(hash);
            }
        }
        Ok(hashes)
    }

    /// Paths the scanner has seen but the hasher has not digested yet.
    pub fn without_content_hashes(&self) -> Result<Vec<String>, StoreError> {
        let mut paths = Vec::new();
        for (path, data) in self.store.items()? {
            if data.content_hash.is_none() {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    /// Hashed LocalVersions whose `(path, content_hash)` pair is missing
    /// from the given FileVersion store.
    pub fn not_in_file_versions(
        &self,
        file_versions: &FileVersionStore,
    ) -> Result<Vec<(String, LocalVersionData)>, StoreError> {
        let mut missing = Vec::new();
        for (path, data) in self.store.items()? {
            let Some(content_hash) = data.content_hash.as_deref() else {
                continue;
            };
            let known = file_versions
                .get(&path)?
                .is_some_and(|versions| versions.contains_key(content_hash));
            if !known {
                missing.push((path, data));
            }
        }
        Ok(missing)
    }
}

/// The global per-path history of observed content hashes.
pub struct FileVersionStore {
    store: DiskStore<FileVersionData>,
}

impl FileVersionStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            store: DiskStore::open(dir, true)?,
        })
    }

    pub fn get(&self, path: &str) -> Result<Option<FileVersionData>, StoreError> {
        self.store.get(path)
    }

    pub fn contains(&self, path: &str) -> Result<bool, StoreError> {
        self.store.contains(path)
    }

    pub fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.store.keys()
    }

    pub fn all(&self) -> Result<FileVersionSet, StoreError> {
        self.store.all()
    }

    pub fn len(&self) -> Result<u64, StoreError> {
        self.store.len()
    }

    /// Merge one `(path, content_hash)` entry, creating the path map if it
    /// does not exist already.
    pub fn set_with_content(
        &self,
        path: &str,
        content_hash: &str,
        meta: FileVersionMeta,
    ) -> Result<(), StoreError> {
        let mut versions = self.store.get(path)?.unwrap_or_default();
        versions.insert(content_hash.to_owned(), meta);
        self.store.set(path, &versions)
    }

    /// The entry with the largest mtime for a path. Equal mtimes resolve to
    /// the lexicographically greatest hash so every checkout picks the same
    /// winner.
    pub fn most_recent_content(
        &self,
        path: &str,
    ) -> Result<Option<(String, FileVersionMeta)>, StoreError> {
        let Some(versions) = self.store.get(path)? else {
            return Ok(None);
        };
        Ok(versions
            .into_iter()
            .max_by(|a, b| (a.1.mtime, &a.0).cmp(&(b.1.mtime, &b.0))))
    }

    /// Paths whose current version is the deleted sentinel.
    pub fn deleted_paths(&self) -> Result<Vec<String>, StoreError> {
        let mut deleted = Vec::new();
        for (path, versions) in self.store.items()? {
            let current = versions
                .iter()
                .max_by(|a, b| (a.1.mtime, a.0).cmp(&(b.1.mtime, b.0)));
            if let Some((hash, _)) = current {
                if hash == DELETED_SENTINEL {
                    deleted.push(path);
                }
            }
        }
        Ok(deleted)
    }
}

/// Per-subtree sync policies.
pub struct PathRequestStore {
    store: DiskStore<PathStatus>,
}

impl PathRequestStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            store: DiskStore::open(dir, true)?,
        })
    }

    pub fn get(&self, path: &str) -> Result<Option<PathStatus>, StoreError> {
        self.store.get(path)
    }

    pub fn set(&self, path: &str, status: PathStatus) -> Result<(), StoreError> {
        self.store.set(path, &status)
    }

    pub fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.store.delete(path)
    }

    pub fn contains(&self, path: &str) -> Result<bool, StoreError> {
        self.store.contains(path)
    }

    pub fn items(&self) -> Result<Vec<(String, PathStatus)>, StoreError> {
        self.store.items()
    }

    /// Resolve the policy for a path by trying the path itself, then each
    /// ancestor up to and including `/`. Default is on-demand so a fresh
    /// checkout does not mass-download.
    pub fn resolve_status(&self, path: &str) -> Result<PathStatus, StoreError> {
        let mut current = path.to_owned();
        loop {
            if let Some(status) = self.store.get(&current)? {
                return Ok(status);
            }
            if current == "/" {
                break;
            }
            current = match current.rfind('/') {
                Some(0) => "/".to_owned(),
                Some(index) => current[..index].to_owned(),
                None => break,
            };
        }
        Ok(PathStatus::OnDemand)
    }
}

/// Advisory map of which backends are known to hold each content hash.
pub struct ContentBackendStore {
    store: DiskStore<Vec<String>>,
}

impl ContentBackendStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            store: DiskStore::open(dir, false)?,
        })
    }

    pub fn get(&self, content_hash: &str) -> Result<Option<Vec<String>>, StoreError> {
        self.store.get(content_hash)
    }

    pub fn all(&self) -> Result<BTreeMap<String, Vec<String>>, StoreError> {
        self.store.all()
    }

    /// Replace the whole placement map in one transaction.
    pub fn set_all(&self, placements: &BTreeMap<String, Vec<String>>) -> Result<(), StoreError> {
        self.store.set_all(placements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(mtime: i64, size: u64) -> FileVersionMeta {
        FileVersionMeta { mtime, size }
    }

    #[test]
    fn most_recent_content_is_argmax_by_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileVersionStore::open(dir.path()).unwrap();

        assert_eq!(store.most_recent_content("/missing").unwrap(), None);

        store.set_with_content("/f", "aaa", meta(10, 1)).unwrap();
        store.set_with_content("/f", "bbb", meta(30, 2)).unwrap();
        store.set_with_content("/f", "ccc", meta(20, 3)).unwrap();

        let (hash, m) = store.most_recent_content("/f").unwrap().unwrap();
        assert_eq!(hash, "bbb");
        assert_eq!(m.mtime, 30);
    }

    #[test]
    fn deleted_paths_follow_the_mtime_maximum() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileVersionStore::open(dir.path()).unwrap();

        store.set_with_content("/gone", "aaa", meta(10, 1)).unwrap();
        store
            .set_with_content("/gone", DELETED_SENTINEL, meta(20, 0))
            .unwrap();
        store.set_with_content("/kept", "bbb", meta(40, 2)).unwrap();
        store
            .set_with_content("/kept", DELETED_SENTINEL, meta(30, 0))
            .unwrap();

        assert_eq!(store.deleted_paths().unwrap(), vec!["/gone".to_owned()]);
    }

    #[test]
    fn resolve_status_walks_ancestors() {
        let dir = tempfile::tempdir().unwrap();
        let store = PathRequestStore::open(dir.path()).unwrap();

        store.set("/archive", PathStatus::Ignore).unwrap();
        store.set("/media/photos", PathStatus::Full).unwrap();

        assert_eq!(
            store.resolve_status("/archive/2020/file.txt").unwrap(),
            PathStatus::Ignore
        );
        assert_eq!(
            store.resolve_status("/media/photos/cat.jpg").unwrap(),
            PathStatus::Full
        );
        // Sibling subtree falls through to the default.
        assert_eq!(
            store.resolve_status("/media/videos/dog.mp4").unwrap(),
            PathStatus::OnDemand
        );

        // A root policy covers everything without a closer match.
        store.set("/", PathStatus::Full).unwrap();
        assert_eq!(
            store.resolve_status("/media/videos/dog.mp4").unwrap(),
            PathStatus::Full
        );
    }

    #[test]
    fn not_in_file_versions_reports_missing_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let locals = LocalVersionStore::open(&dir.path().join("lv")).unwrap();
        let versions = FileVersionStore::open(&dir.path().join("fv")).unwrap();

        let hashed = LocalVersionData {
            content_hash: Some("aaa".to_owned()),
            mtime: 10,
            size: 1,
            last_hashed: Some(11),
        };
        let unhashed = LocalVersionData {
            content_hash: None,
            mtime: 10,
            size: 1,
            last_hashed: None,
        };
        locals.set("/known", &hashed).unwrap();
        locals.set("/new", &hashed).unwrap();
        locals.set("/pending", &unhashed).unwrap();
        versions.set_with_content("/known", "aaa", meta(10, 1)).unwrap();

        let missing = locals.not_in_file_versions(&versions).unwrap();
        let paths: Vec<&str> = missing.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["/new"]);
    }

    #[test]
    fn content_hash_queries() {
        let dir = tempfile::tempdir().unwrap();
        let locals = LocalVersionStore::open(dir.path()).unwrap();

        locals
            .set(
                "/a",
                &LocalVersionData {
                    content_hash: Some("h1".to_owned()),
                    mtime: 1,
                    size: 1,
                    last_hashed: Some(2),
                },
            )
            .unwrap();
        locals
            .set(
                "/b",
                &LocalVersionData {
                    content_hash: None,
                    mtime: 2,
                    size: 2,
                    last_hashed: None,
                },
            )
            .unwrap();

        assert_eq!(
            locals.all_content_hashes().unwrap(),
            HashSet::from(["h1".to_owned()])
        );
        assert_eq!(locals.without_content_hashes().unwrap(), vec!["/b"]);
        let (path, _) = locals.by_content_hash("h1").unwrap().unwrap();
        assert_eq!(path, "/a");
        assert!(locals.by_content_hash("h2").unwrap().is_none());
    }
}

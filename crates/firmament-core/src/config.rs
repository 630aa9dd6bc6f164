//! Checkout discovery, configuration parsing, and backend construction.
//!
//! The configuration root owns everything the operators share: the backend
//! instances (including any rclone subprocess supervisors, which tear down
//! when the config drops) and the four datastores.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::backend::local::LocalStore;
use crate::backend::rclone::{RcloneOptions, RcloneStore};
use crate::backend::s3::{S3Options, S3Store};
use crate::backend::{Backend, BackendError, RemoteStore};
use crate::datastore::{
    ContentBackendStore, FileVersionStore, LocalVersionStore, PathRequestStore, StoreError,
};
use crate::encrypt::{DEFAULT_KEY_ITERATIONS, Encryptor};
use crate::types::{META_DIR_NAME, PathStatus};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no firmament checkout found in {start:?} or any parent directory")]
    NoCheckoutRoot { start: PathBuf },

    #[error("unknown backend type {alias:?} for backend {name:?}")]
    UnknownBackendType { name: String, alias: String },

    #[error("invalid configuration for backend {name:?}: {source}")]
    BackendOptions {
        name: String,
        source: serde_yaml::Error,
    },

    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("failed to initialize backend {name:?}: {source}")]
    Backend {
        name: String,
        source: BackendError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("config io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Deserialize)]
struct ConfigSchema {
    backends: serde_yaml::Mapping,
    #[serde(default)]
    paths: BTreeMap<String, PathSchema>,
}

#[derive(Debug, Deserialize)]
struct BackendSchema {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    encryption_key: Option<String>,
    #[serde(default)]
    key_iterations: Option<u32>,
    #[serde(default)]
    options: serde_yaml::Value,
}

#[derive(Debug, Deserialize)]
struct PathSchema {
    #[serde(default)]
    on_demand: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct LocalOptions {
    root: PathBuf,
}

type BackendFactory =
    fn(&str, Encryptor, serde_yaml::Value) -> Result<Box<dyn RemoteStore>, ConfigError>;

/// The alias table consulted at startup; adding a backend kind means
/// adding a row here.
fn backend_factories() -> &'static [(&'static str, BackendFactory)] {
    &[
        ("local", build_local),
        ("s3", build_s3),
        ("rclone", build_rclone),
        ("rclone-s3", build_rclone),
    ]
}

fn decode_options<T: serde::de::DeserializeOwned>(
    name: &str,
    options: serde_yaml::Value,
) -> Result<T, ConfigError> {
    serde_yaml::from_value(options).map_err(|source| ConfigError::BackendOptions {
        name: name.to_owned(),
        source,
    })
}

fn backend_error(name: &str) -> impl FnOnce(BackendError) -> ConfigError + '_ {
    move |source| ConfigError::Backend {
        name: name.to_owned(),
        source,
    }
}

fn build_local(
    name: &str,
    encryptor: Encryptor,
    options: serde_yaml::Value,
) -> Result<Box<dyn RemoteStore>, ConfigError> {
    let options: LocalOptions = decode_options(name, options)?;
    let store = LocalStore::new(options.root, encryptor).map_err(backend_error(name))?;
    Ok(Box::new(store))
}

fn build_s3(
    name: &str,
    encryptor: Encryptor,
    options: serde_yaml::Value,
) -> Result<Box<dyn RemoteStore>, ConfigError> {
    let options: S3Options = decode_options(name, options)?;
    let store = S3Store::new(&options, encryptor).map_err(backend_error(name))?;
    Ok(Box::new(store))
}

fn build_rclone(
    name: &str,
    encryptor: Encryptor,
    options: serde_yaml::Value,
) -> Result<Box<dyn RemoteStore>, ConfigError> {
    let options: RcloneOptions = decode_options(name, options)?;
    let store = RcloneStore::new(&options, encryptor).map_err(backend_error(name))?;
    Ok(Box::new(store))
}

/// A loaded checkout: resolved paths, live backends, open datastores.
pub struct Config {
    root_path: PathBuf,
    meta_path: PathBuf,
    backends: Vec<Backend>,
    pub local_versions: LocalVersionStore,
    pub file_versions: FileVersionStore,
    pub path_requests: PathRequestStore,
    pub content_backends: ContentBackendStore,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("root_path", &self.root_path)
            .field("meta_path", &self.meta_path)
            .field("backends", &self.backends.len())
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Walk upward from `start` until a directory containing `.firmament`
    /// is found.
    pub fn discover(start: &Path) -> Result<PathBuf, ConfigError> {
        let start = start.canonicalize()?;
        let mut current = start.clone();
        loop {
            if current.join(META_DIR_NAME).is_dir() {
                return Ok(current);
            }
            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return Err(ConfigError::NoCheckoutRoot { start }),
            }
        }
    }

    /// Load the checkout rooted at `root_path`: parse the config file,
    /// instantiate backends in file order (which doubles as download
    /// priority), and open the datastores.
    pub fn load(root_path: &Path) -> Result<Self, ConfigError> {
        let root_path = root_path.canonicalize()?;
        let meta_path = root_path.join(META_DIR_NAME);
        let config_path = meta_path.join("config");
        let raw = fs::read_to_string(&config_path)?;
        let schema: ConfigSchema =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: config_path.clone(),
                source,
            })?;

        let mut backends = Vec::new();
        for (key, value) in schema.backends {
            let name: String =
                serde_yaml::from_value(key).map_err(|source| ConfigError::Parse {
                    path: config_path.clone(),
                    source,
                })?;
            let backend_schema: BackendSchema = serde_yaml::from_value(value)
                .map_err(|source| ConfigError::BackendOptions {
                    name: name.clone(),
                    source,
                })?;
            let factory = backend_factories()
                .iter()
                .find(|(alias, _)| *alias == backend_schema.kind)
                .map(|(_, factory)| *factory)
                .ok_or_else(|| ConfigError::UnknownBackendType {
                    name: name.clone(),
                    alias: backend_schema.kind.clone(),
                })?;
            let encryptor = Encryptor::from_passphrase(
                backend_schema.encryption_key.as_deref(),
                backend_schema.key_iterations.unwrap_or(DEFAULT_KEY_ITERATIONS),
            );
            let store = factory(&name, encryptor, backend_schema.options)?;
            info!(backend = %name, "{}", store.describe());
            backends.push(Backend::new(name, store));
        }

        let datastore_path = meta_path.join("datastore");
        let local_versions = LocalVersionStore::open(&datastore_path.join("local_versions"))?;
        let file_versions = FileVersionStore::open(&datastore_path.join("file_versions"))?;
        let path_requests = PathRequestStore::open(&datastore_path.join("path_requests"))?;
        let content_backends = ContentBackendStore::open(&datastore_path.join("content_backends"))?;

        // Seed policies from the config file without clobbering requests
        // made at runtime.
        for (path, path_schema) in &schema.paths {
            let Some(on_demand) = path_schema.on_demand else {
                continue;
            };
            if path_requests.contains(path)? {
                continue;
            }
            let status = if on_demand {
                PathStatus::OnDemand
            } else {
                PathStatus::Full
            };
            path_requests.set(path, status)?;
        }

        Ok(Self {
            root_path,
            meta_path,
            backends,
            local_versions,
            file_versions,
            path_requests,
            content_backends,
        })
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    /// Backends in download-priority order.
    pub fn backends(&self) -> impl Iterator<Item = &Backend> {
        self.backends.iter()
    }

    pub fn backend(&self, name: &str) -> Option<&Backend> {
        self.backends.iter().find(|backend| backend.name() == name)
    }

    /// Rejoin a `/`-rooted virtual path with the checkout root.
    pub fn disk_path(&self, virtual_path: &str) -> PathBuf {
        self.root_path.join(virtual_path.trim_start_matches('/'))
    }
}

//! Bridge backend that exposes any rclone remote through `rclone serve s3`.
//!
//! On construction a supervisor writes a temporary rclone config naming the
//! user's remote, spawns `rclone serve s3` on a free localhost port with
//! freshly generated credentials, and waits for the port to accept
//! connections. The embedded [`S3Store`] then talks to
//! `http://127.0.0.1:<port>`. The supervisor owns the child process and the
//! config file; dropping the store (or calling [`RcloneStore::close`])
//! tears both down.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::net::{SocketAddr, TcpStream};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use rand::Rng;
use rand::distr::Alphanumeric;
use serde::Deserialize;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::encrypt::Encryptor;

use super::s3::{S3Options, S3Store, create_bucket};
use super::{BackendError, RemoteStore};

const SERVE_HOST: &str = "127.0.0.1";
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

fn default_rclone_binary() -> String {
    "rclone".to_owned()
}

fn default_startup_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct RcloneOptions {
    /// The rclone remote type ("drive", "dropbox", "sftp", ...).
    pub remote_type: String,
    /// Key/value configuration for the remote, written to the temporary
    /// rclone config verbatim.
    #[serde(default)]
    pub remote_config: BTreeMap<String, String>,
    /// Path within the remote; its first segment becomes the bucket.
    #[serde(default)]
    pub remote_path: String,
    #[serde(default = "default_rclone_binary")]
    pub rclone_binary: String,
    /// Port for `rclone serve s3`; picked automatically when absent.
    #[serde(default)]
    pub serve_port: Option<u16>,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default)]
    pub extra_rclone_flags: Vec<String>,
}

fn random_token(length: usize) -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Owns the `rclone serve s3` child process and its temporary config file.
///
/// Teardown happens exactly once, either through [`close`](Self::close) or
/// on drop; holding the supervisor inside the store ties the subprocess
/// lifetime to the backend that needs it.
struct RcloneSupervisor {
    child: Option<Child>,
    config_file: Option<NamedTempFile>,
    port: u16,
}

impl RcloneSupervisor {
    fn spawn(options: &RcloneOptions, access_key: &str, secret_key: &str) -> Result<Self, BackendError> {
        let mut config_file = tempfile::Builder::new()
            .prefix("rclone-firmament-")
            .suffix(".conf")
            .tempfile()
            .map_err(BackendError::Io)?;
        writeln!(config_file, "[firmament]")?;
        writeln!(config_file, "type = {}", options.remote_type)?;
        for (key, value) in &options.remote_config {
            writeln!(config_file, "{key} = {value}")?;
        }
        config_file.flush()?;

        let port = match options.serve_port {
            Some(port) => port,
            None => portpicker::pick_unused_port().ok_or_else(|| {
                BackendError::Storage("no free localhost port for rclone serve s3".to_owned())
            })?,
        };

        let remote_path = options.remote_path.trim_matches('/');
        let remote = format!("firmament:{remote_path}");
        let address = format!("{SERVE_HOST}:{port}");

        let mut command = Command::new(&options.rclone_binary);
        command
            .arg("serve")
            .arg("s3")
            .arg(&remote)
            .arg("--config")
            .arg(config_file.path())
            .arg("--addr")
            .arg(&address)
            .arg("--auth-key")
            .arg(format!("{access_key},{secret_key}"))
            .args(&options.extra_rclone_flags)
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = command.spawn().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                BackendError::Storage(format!(
                    "rclone binary not found at {:?}; install rclone or set rclone_binary",
                    options.rclone_binary
                ))
            } else {
                BackendError::Storage(format!("failed to start rclone serve s3: {err}"))
            }
        })?;
        debug!(port, remote = %remote, "rclone serve s3 spawned");

        let mut supervisor = Self {
            child: Some(child),
            config_file: Some(config_file),
            port,
        };
        supervisor.wait_until_ready(Duration::from_secs(options.startup_timeout_secs))?;
        info!(port, "rclone serve s3 ready");
        Ok(supervisor)
    }

    /// Poll the serve port until it accepts a TCP connection, the child
    /// dies, or the timeout passes. Failure tears the child down.
    fn wait_until_ready(&mut self, timeout: Duration) -> Result<(), BackendError> {
        let address = SocketAddr::from(([127, 0, 0, 1], self.port));
        let started = Instant::now();
        while started.elapsed() < timeout {
            if let Some(child) = self.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    self.close();
                    return Err(BackendError::Storage(format!(
                        "rclone serve s3 exited during startup with {status}"
                    )));
                }
            }
            if TcpStream::connect_timeout(&address, CONNECT_PROBE_TIMEOUT).is_ok() {
                return Ok(());
            }
            std::thread::sleep(READY_POLL_INTERVAL);
        }
        self.close();
        Err(BackendError::Storage(format!(
            "rclone serve s3 did not accept connections within {timeout:?}"
        )))
    }

    /// Idempotent teardown of the child process and config file.
    fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill() {
                warn!(error = %err, "failed to kill rclone serve s3");
            }
            let deadline = Instant::now() + SHUTDOWN_WAIT;
            loop {
                match child.try_wait() {
                    Ok(Some(_)) | Err(_) => break,
                    Ok(None) if Instant::now() >= deadline => {
                        warn!("rclone serve s3 did not exit after kill");
                        break;
                    }
                    Ok(None) => std::thread::sleep(READY_POLL_INTERVAL),
                }
            }
        }
        // Dropping the NamedTempFile removes the config from disk.
        self.config_file.take();
    }
}

impl Drop for RcloneSupervisor {
    fn drop(&mut self) {
        self.close();
    }
}

/// An [`S3Store`] aimed at a supervised local `rclone serve s3` process.
pub struct RcloneStore {
    inner: S3Store,
    supervisor: RcloneSupervisor,
    remote_display: String,
}

impl RcloneStore {
    pub fn new(options: &RcloneOptions, encryptor: Encryptor) -> Result<Self, BackendError> {
        let access_key = random_token(24);
        let secret_key = random_token(40);
        let supervisor = RcloneSupervisor::spawn(options, &access_key, &secret_key)?;

        // rclone serve s3 exposes top-level directories as buckets.
        let remote_path = options.remote_path.trim_matches('/');
        let (bucket, prefix) = match remote_path.split_once('/') {
            Some((bucket, rest)) => (bucket.to_owned(), rest.to_owned()),
            None if remote_path.is_empty() => ("data".to_owned(), String::new()),
            None => (remote_path.to_owned(), String::new()),
        };

        let s3_options = S3Options {
            bucket,
            prefix,
            region: None,
            endpoint_url: Some(format!("http://{SERVE_HOST}:{}", supervisor.port)),
            access_key_id: Some(access_key),
            secret_access_key: Some(secret_key),
            storage_class: None,
        };

        let inner = match S3Store::new(&s3_options, encryptor.clone()) {
            Ok(store) => store,
            Err(BackendError::BucketMissing { .. }) => {
                // Fresh remote: make the bucket and try again.
                create_bucket(&s3_options)?;
                S3Store::new(&s3_options, encryptor)?
            }
            Err(err) => return Err(err),
        };

        let remote_display = if remote_path.is_empty() {
            options.remote_type.clone()
        } else {
            format!("{}:{remote_path}", options.remote_type)
        };

        Ok(Self {
            inner,
            supervisor,
            remote_display,
        })
    }

    /// Tear down the rclone subprocess. Safe to call more than once; also
    /// happens on drop.
    pub fn close(&mut self) {
        self.supervisor.close();
    }
}

impl RemoteStore for RcloneStore {
    fn describe(&self) -> String {
        format!(
            "Rclone S3 ({} via localhost:{})",
            self.remote_display, self.supervisor.port
        )
    }

    fn content_rebuild_interval(&self) -> Duration {
        self.inner.content_rebuild_interval()
    }

    fn remote_read_io(
        &self,
        path: &str,
        sink: &mut dyn std::io::Write,
    ) -> Result<String, BackendError> {
        self.inner.remote_read_io(path, sink)
    }

    fn remote_write_io(
        &self,
        path: &str,
        source: &mut dyn std::io::Read,
        expected_version: Option<&str>,
        is_content: bool,
    ) -> Result<(), BackendError> {
        self.inner
            .remote_write_io(path, source, expected_version, is_content)
    }

    fn remote_exists(&self, path: &str) -> Result<bool, BackendError> {
        self.inner.remote_exists(path)
    }

    fn remote_delete(&self, path: &str) -> Result<(), BackendError> {
        self.inner.remote_delete(path)
    }

    fn remote_content_walk(&self) -> Result<Vec<String>, BackendError> {
        self.inner.remote_content_walk()
    }

    fn remote_content_path(&self, sha256: &str) -> Result<String, BackendError> {
        self.inner.remote_content_path(sha256)
    }
}

//! S3 (and S3-compatible) remote store.
//!
//! Objects live under an optional prefix inside one bucket. The ETag (with
//! surrounding quotes stripped) is the version token. Compare-and-set is
//! simulated with HEAD-then-PUT: a concurrent writer between the two calls
//! can slip through, which the metadata merge loop tolerates by re-reading
//! and re-merging on every attempt.
//!
//! The SDK is async; operators run on plain threads, so each store owns a
//! current-thread tokio runtime and drives individual calls with
//! `block_on`.

use std::io::{self, Read, Write};
use std::time::Duration;

use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::StorageClass;
use serde::Deserialize;
use tokio::runtime::Runtime;
use tracing::{debug, warn};

use crate::encrypt::Encryptor;

use super::{BackendError, RemoteStore, SHARD_PREFIX_LEN};

const CONTENT_REBUILD_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Constructor options, deserialized straight from the backend config.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Options {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    /// Storage class applied to content writes (not metadata files).
    #[serde(default)]
    pub storage_class: Option<String>,
}

pub struct S3Store {
    bucket: String,
    prefix: String,
    storage_class: Option<StorageClass>,
    encryptor: Encryptor,
    client: Client,
    runtime: Runtime,
}

fn storage_error<E>(context: &str, err: SdkError<E>) -> BackendError
where
    E: std::error::Error + Send + Sync + 'static,
{
    BackendError::Storage(format!("{context}: {}", DisplayErrorContext(err)))
}

fn build_client(options: &S3Options) -> Result<(Runtime, Client), BackendError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(BackendError::Io)?;

    let sdk_config = runtime.block_on(async {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &options.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &options.endpoint_url {
            loader = loader.endpoint_url(endpoint.clone());
        }
        if let (Some(id), Some(secret)) = (&options.access_key_id, &options.secret_access_key) {
            loader = loader
                .credentials_provider(Credentials::new(id, secret, None, None, "firmament-config"));
        }
        loader.load().await
    });

    let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
    if options.endpoint_url.is_some() {
        // Virtual-hosted addressing breaks against localhost endpoints.
        builder = builder.force_path_style(true);
    }
    Ok((runtime, Client::from_conf(builder.build())))
}

/// Create the bucket, tolerating "already exists" responses. Used by the
/// rclone bridge on first contact with a fresh remote.
pub fn create_bucket(options: &S3Options) -> Result<(), BackendError> {
    let (runtime, client) = build_client(options)?;
    match runtime.block_on(client.create_bucket().bucket(&options.bucket).send()) {
        Ok(_) => Ok(()),
        Err(err) => {
            let already_exists = err.as_service_error().is_some_and(|service| {
                service.is_bucket_already_owned_by_you() || service.is_bucket_already_exists()
            });
            if already_exists {
                Ok(())
            } else {
                Err(storage_error(
                    &format!("failed to create bucket {:?}", options.bucket),
                    err,
                ))
            }
        }
    }
}

impl S3Store {
    pub fn new(options: &S3Options, encryptor: Encryptor) -> Result<Self, BackendError> {
        let (runtime, client) = build_client(options)?;

        // Fail fast on a missing or inaccessible bucket.
        if let Err(err) = runtime.block_on(client.head_bucket().bucket(&options.bucket).send()) {
            if err.as_service_error().is_some_and(|e| e.is_not_found()) {
                return Err(BackendError::BucketMissing {
                    bucket: options.bucket.clone(),
                });
            }
            if err
                .raw_response()
                .is_some_and(|response| response.status().as_u16() == 403)
            {
                return Err(BackendError::AccessDenied {
                    bucket: options.bucket.clone(),
                });
            }
            return Err(storage_error(
                &format!("cannot access bucket {:?}", options.bucket),
                err,
            ));
        }

        Ok(Self {
            bucket: options.bucket.clone(),
            prefix: options.prefix.trim_matches('/').to_owned(),
            storage_class: options
                .storage_class
                .as_deref()
                .map(StorageClass::from),
            encryptor,
            client,
            runtime,
        })
    }

    fn full_key(&self, path: &str) -> String {
        if self.prefix.is_empty() {
            path.to_owned()
        } else {
            format!("{}/{}", self.prefix, path)
        }
    }

    /// HEAD the object and compare its ETag against the caller's token.
    fn check_version(&self, key: &str, expected: &str) -> Result<(), BackendError> {
        match self
            .runtime
            .block_on(self.client.head_object().bucket(&self.bucket).key(key).send())
        {
            Ok(head) => {
                let found = head.e_tag().unwrap_or_default().trim_matches('"').to_owned();
                if found == expected {
                    Ok(())
                } else {
                    Err(BackendError::Version {
                        expected: expected.to_owned(),
                        found,
                    })
                }
            }
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => {
                Err(BackendError::Version {
                    expected: expected.to_owned(),
                    found: "<missing>".to_owned(),
                })
            }
            Err(err) => Err(storage_error(
                &format!("failed to check version of {key}"),
                err,
            )),
        }
    }
}

impl RemoteStore for S3Store {
    fn describe(&self) -> String {
        if self.prefix.is_empty() {
            format!("S3 (bucket {})", self.bucket)
        } else {
            format!("S3 (bucket {}, prefix {})", self.bucket, self.prefix)
        }
    }

    fn content_rebuild_interval(&self) -> Duration {
        CONTENT_REBUILD_INTERVAL
    }

    fn remote_read_io(&self, path: &str, sink: &mut dyn Write) -> Result<String, BackendError> {
        let key = self.full_key(path);
        let response = self
            .runtime
            .block_on(
                self.client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .send(),
            )
            .map_err(|err| {
                if err.as_service_error().is_some_and(|e| e.is_no_such_key()) {
                    BackendError::NotFound {
                        path: path.to_owned(),
                    }
                } else {
                    storage_error(&format!("failed to read {key}"), err)
                }
            })?;

        let version = response
            .e_tag()
            .unwrap_or_default()
            .trim_matches('"')
            .to_owned();
        let body = self
            .runtime
            .block_on(response.body.collect())
            .map_err(|err| BackendError::Storage(format!("failed to read body of {key}: {err}")))?
            .into_bytes();

        let mut reader = self.encryptor.decrypting_reader(body.as_ref());
        io::copy(&mut reader, sink)?;
        Ok(version)
    }

    fn remote_write_io(
        &self,
        path: &str,
        source: &mut dyn Read,
        expected_version: Option<&str>,
        is_content: bool,
    ) -> Result<(), BackendError> {
        let key = self.full_key(path);

        // put_object needs the whole body, so encrypt up front.
        let mut encrypted = Vec::new();
        self.encryptor
            .encrypting_reader(source)
            .read_to_end(&mut encrypted)?;

        if let Some(expected) = expected_version {
            self.check_version(&key, expected)?;
        }

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(encrypted));
        if is_content {
            if let Some(class) = &self.storage_class {
                request = request.storage_class(class.clone());
            }
        }

        self.runtime
            .block_on(request.send())
            .map_err(|err| storage_error(&format!("failed to write {key}"), err))?;
        debug!(key = %key, "object written");
        Ok(())
    }

    fn remote_exists(&self, path: &str) -> Result<bool, BackendError> {
        let key = self.full_key(path);
        match self
            .runtime
            .block_on(
                self.client
                    .head_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .send(),
            ) {
            Ok(_) => Ok(true),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(false),
            Err(err) => Err(storage_error(
                &format!("failed to check existence of {key}"),
                err,
            )),
        }
    }

    fn remote_delete(&self, path: &str) -> Result<(), BackendError> {
        let key = self.full_key(path);
        self.runtime
            .block_on(
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .send(),
            )
            .map_err(|err| storage_error(&format!("failed to delete {key}"), err))?;
        Ok(())
    }

    fn remote_content_walk(&self) -> Result<Vec<String>, BackendError> {
        let content_prefix = self.full_key("content/");
        let mut hashes = Vec::new();

        self.runtime.block_on(async {
            let mut pages = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&content_prefix)
                .into_paginator()
                .send();
            while let Some(page) = pages.next().await {
                let page = page.map_err(|err| {
                    storage_error(&format!("failed to list {content_prefix}"), err)
                })?;
                for object in page.contents() {
                    let Some(key) = object.key() else { continue };
                    let name = key.rsplit('/').next().unwrap_or_default();
                    // Shard directories and strays are shorter than any
                    // encrypted identifier.
                    if name.len() <= 4 {
                        continue;
                    }
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
            }
            Ok::<(), BackendError>(())
        })?;

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

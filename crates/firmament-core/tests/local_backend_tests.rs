//! Round-trip, versioning, and integrity tests for the local backend.

use std::fs;

use firmament_core::backend::local::LocalStore;
use firmament_core::backend::{Backend, BackendError};
use firmament_core::encrypt::{AesEncryptor, Encryptor};
use firmament_core::hash::sha256_hex;
use tempfile::TempDir;
use walkdir::WalkDir;

fn plain_backend(root: &TempDir) -> Backend {
    let store = LocalStore::new(root.path().join("backend"), Encryptor::Null)
        .expect("failed to initialize backend root");
    Backend::new("test-backend", Box::new(store))
}

fn encrypted_backend(root: &TempDir) -> Backend {
    // Low iteration count and small chunks: we are exercising the stream
    // format, not the KDF.
    let encryptor = Encryptor::Aes(AesEncryptor::new("test-key", 100).with_chunk_size(1024));
    let store = LocalStore::new(root.path().join("backend"), encryptor)
        .expect("failed to initialize backend root");
    Backend::new("test-backend", Box::new(store))
}

#[test]
fn write_and_read_round_trip() {
    let root = TempDir::new().unwrap();
    let backend = plain_backend(&root);

    backend
        .remote_write_bytes("some-file", b"Hello, World!", None, false)
        .unwrap();
    let (content, version) = backend.remote_read_bytes("some-file").unwrap();
    assert_eq!(content, b"Hello, World!");
    // mtime-ns version tokens are decimal strings.
    assert!(version.chars().all(|c| c.is_ascii_digit()));
}

#[test]
fn write_creates_parent_directories() {
    let root = TempDir::new().unwrap();
    let backend = plain_backend(&root);

    backend
        .remote_write_bytes("deep/nested/path/file", b"nested content", None, false)
        .unwrap();
    let (content, _) = backend.remote_read_bytes("deep/nested/path/file").unwrap();
    assert_eq!(content, b"nested content");
}

#[test]
fn overwrite_truncates_previous_content() {
    let root = TempDir::new().unwrap();
    let backend = plain_backend(&root);

    backend
        .remote_write_bytes("some-file", b"this is longer content", None, false)
        .unwrap();
    backend
        .remote_write_bytes("some-file", b"short", None, false)
        .unwrap();
    let (content, _) = backend.remote_read_bytes("some-file").unwrap();
    assert_eq!(content, b"short");
}

#[test]
fn reading_missing_path_is_not_found() {
    let root = TempDir::new().unwrap();
    let backend = plain_backend(&root);

    assert!(matches!(
        backend.remote_read_bytes("nothing-here"),
        Err(BackendError::NotFound { .. })
    ));
    assert!(!backend.content_exists(&sha256_hex(b"absent")).unwrap());
}

#[test]
fn stale_version_write_is_refused() {
    let root = TempDir::new().unwrap();
    let backend = plain_backend(&root);

    backend
        .remote_write_bytes("some-file", b"first", None, false)
        .unwrap();
    let (_, version) = backend.remote_read_bytes("some-file").unwrap();

    // A write without assertion moves the version forward.
    std::thread::sleep(std::time::Duration::from_millis(20));
    backend
        .remote_write_bytes("some-file", b"second", None, false)
        .unwrap();

    let result = backend.remote_write_bytes("some-file", b"third", Some(&version), false);
    assert!(matches!(result, Err(BackendError::Version { .. })));
    let (content, _) = backend.remote_read_bytes("some-file").unwrap();
    assert_eq!(content, b"second");
}

#[test]
fn version_assertion_on_missing_file_is_refused() {
    let root = TempDir::new().unwrap();
    let backend = plain_backend(&root);

    let result = backend.remote_write_bytes("never-written", b"data", Some("12345"), false);
    assert!(matches!(result, Err(BackendError::Version { .. })));
}

#[test]
fn content_upload_download_and_list() {
    let root = TempDir::new().unwrap();
    let backend = plain_backend(&root);

    let body = b"content body";
    let hash = sha256_hex(body);
    let source = root.path().join("source");
    fs::write(&source, body).unwrap();

    backend.content_upload(&hash, &source).unwrap();
    assert!(backend.content_exists(&hash).unwrap());
    // Freshly uploaded hashes are visible before any index rebuild.
    assert!(backend.content_list().unwrap().contains(&hash));

    let target = root.path().join("target");
    backend.content_download(&hash, &target).unwrap();
    assert_eq!(fs::read(&target).unwrap(), body);

    backend.content_delete(&hash).unwrap();
    assert!(!backend.content_exists(&hash).unwrap());
}

#[test]
fn nonempty_directory_is_not_adopted_as_storage_root() {
    let root = TempDir::new().unwrap();
    let backend_root = root.path().join("backend");
    fs::create_dir_all(&backend_root).unwrap();
    fs::write(backend_root.join("stray"), b"not ours").unwrap();

    assert!(matches!(
        LocalStore::new(&backend_root, Encryptor::Null),
        Err(BackendError::Storage(_))
    ));
}

#[test]
fn encrypted_round_trip_is_opaque_at_rest() {
    let root = TempDir::new().unwrap();
    let backend = encrypted_backend(&root);

    let body = b"Secret data that must not appear on disk";
    backend
        .remote_write_bytes("secret-file", body, None, false)
        .unwrap();

    let raw = fs::read(root.path().join("backend/secret-file")).unwrap();
    assert_ne!(raw, body);
    assert!(!raw.windows(body.len()).any(|window| window == body));

    let (content, _) = backend.remote_read_bytes("secret-file").unwrap();
    assert_eq!(content, body);
}

#[test]
fn encrypted_content_survives_round_trip_and_detects_corruption() {
    let root = TempDir::new().unwrap();
    let backend = encrypted_backend(&root);

    // 2.5x the chunk size, so the stream has a partial final chunk.
    let body: Vec<u8> = (0..2560u32).map(|i| (i % 251) as u8).collect();
    let hash = sha256_hex(&body);
    let source = root.path().join("source");
    fs::write(&source, &body).unwrap();

    backend.content_upload(&hash, &source).unwrap();
    let target = root.path().join("target");
    backend.content_download(&hash, &target).unwrap();
    assert_eq!(fs::read(&target).unwrap(), body);

    // Flip one byte in the middle of the stored object.
    let object_path = WalkDir::new(root.path().join("backend/content"))
        .into_iter()
        .filter_map(Result::ok)
        .find(|entry| entry.file_type().is_file())
        .expect("stored object not found")
        .into_path();
    let mut raw = fs::read(&object_path).unwrap();
    let middle = raw.len() / 2;
    raw[middle] ^= 0x01;
    fs::write(&object_path, &raw).unwrap();

    let result = backend.content_download(&hash, &target);
    assert!(matches!(result, Err(BackendError::Integrity(_))));
}

#[test]
fn content_walk_recovers_hashes_through_encryption() {
    let root = TempDir::new().unwrap();
    let backend = encrypted_backend(&root);

    let mut expected = std::collections::HashSet::new();
    for body in [&b"one"[..], b"two", b"three"] {
        let hash = sha256_hex(body);
        let source = root.path().join("source");
        fs::write(&source, body).unwrap();
        backend.content_upload(&hash, &source).unwrap();
        expected.insert(hash);
    }

    // content_list rebuilds the index by walking and decrypting names.
    assert_eq!(backend.content_list().unwrap(), expected);
}

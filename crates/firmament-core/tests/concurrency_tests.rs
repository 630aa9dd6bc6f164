//! Concurrency tests for the optimistic-concurrency machinery.
//!
//! Focus areas:
//! - Racing compare-and-set writes admit exactly one winner.
//! - Concurrent metadata merges converge on the union of their inputs.

use std::sync::Barrier;
use std::thread;
use std::time::Duration;

use firmament_core::backend::local::LocalStore;
use firmament_core::backend::{Backend, BackendError};
use firmament_core::encrypt::Encryptor;
use firmament_core::types::{FileVersionMeta, FileVersionSet};
use tempfile::TempDir;

fn test_backend(root: &TempDir) -> Backend {
    let store = LocalStore::new(root.path().join("backend"), Encryptor::Null)
        .expect("failed to initialize backend root");
    Backend::new("test-backend", Box::new(store))
}

fn single_entry(path: &str, content_hash: &str, mtime: i64) -> FileVersionSet {
    let mut set = FileVersionSet::new();
    set.entry(path.to_owned())
        .or_default()
        .insert(content_hash.to_owned(), FileVersionMeta { mtime, size: 1 });
    set
}

#[test]
fn racing_cas_writes_have_exactly_one_winner() {
    let root = TempDir::new().unwrap();
    let backend = test_backend(&root);

    backend
        .remote_write_bytes("contested", b"initial", None, false)
        .unwrap();
    let (_, version) = backend.remote_read_bytes("contested").unwrap();
    // Keep the initial write's mtime clearly behind the racers'.
    thread::sleep(Duration::from_millis(20));

    let barrier = Barrier::new(2);
    let payloads: [&[u8]; 2] = [b"writer-a", b"writer-b"];
    let results: Vec<Result<(), BackendError>> = thread::scope(|scope| {
        let handles: Vec<_> = payloads
            .iter()
            .map(|&payload| {
                let backend = &backend;
                let barrier = &barrier;
                let version = version.as_str();
                scope.spawn(move || {
                    barrier.wait();
                    backend.remote_write_bytes("contested", payload, Some(version), false)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("writer thread panicked"))
            .collect()
    });

    let winners: Vec<usize> = results
        .iter()
        .enumerate()
        .filter_map(|(index, result)| result.is_ok().then_some(index))
        .collect();
    assert_eq!(winners.len(), 1, "exactly one writer must win: {results:?}");
    for result in &results {
        if let Err(err) = result {
            assert!(matches!(err, BackendError::Version { .. }), "loser saw {err}");
        }
    }

    // The stored bytes are the winner's, never a mix.
    let (content, _) = backend.remote_read_bytes("contested").unwrap();
    assert_eq!(content, payloads[winners[0]]);
}

#[test]
fn concurrent_merges_converge_on_the_union() {
    let root = TempDir::new().unwrap();
    let backend = test_backend(&root);

    // Start from an existing metadata file so both writers race over the
    // same version token.
    backend
        .file_version_upload(&single_entry("/seed", "seedhash", 1))
        .unwrap();

    let inputs = [
        single_entry("/from-a", "hash-a", 10),
        single_entry("/from-b", "hash-b", 20),
    ];
    let barrier = Barrier::new(2);
    thread::scope(|scope| {
        for input in &inputs {
            let backend = &backend;
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                backend.file_version_upload(input).unwrap();
            });
        }
    });

    let merged = backend.file_version_download().unwrap();
    assert!(merged.contains_key("/seed"));
    assert!(merged["/from-a"].contains_key("hash-a"));
    assert!(merged["/from-b"].contains_key("hash-b"));
}

#[test]
fn sequential_merges_accumulate_by_pair() {
    let root = TempDir::new().unwrap();
    let backend = test_backend(&root);

    backend
        .file_version_upload(&single_entry("/doc", "older", 10))
        .unwrap();
    backend
        .file_version_upload(&single_entry("/doc", "newer", 20))
        .unwrap();

    let merged = backend.file_version_download().unwrap();
    assert_eq!(merged["/doc"].len(), 2);
    assert!(merged["/doc"].contains_key("older"));
    assert!(merged["/doc"].contains_key("newer"));
}

#[test]
fn empty_remote_downloads_as_empty_set() {
    let root = TempDir::new().unwrap();
    let backend = test_backend(&root);
    assert!(backend.file_version_download().unwrap().is_empty());
}

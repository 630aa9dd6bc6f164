//! Property tests for the round-trip laws of the stream format, the
//! identifier encryption, and the datastore snapshot operations.

use std::collections::BTreeMap;
use std::io::Read;

use firmament_core::datastore::DiskStore;
use firmament_core::encrypt::{AesEncryptor, Encryptor};
use proptest::prelude::*;

fn test_encryptor() -> Encryptor {
    Encryptor::Aes(AesEncryptor::new("property passphrase", 10).with_chunk_size(256))
}

proptest! {
    #[test]
    fn stream_round_trip(plaintext in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let encryptor = test_encryptor();

        let mut crypttext = Vec::new();
        encryptor
            .encrypting_reader(plaintext.as_slice())
            .read_to_end(&mut crypttext)
            .unwrap();

        let mut recovered = Vec::new();
        encryptor
            .decrypting_reader(crypttext.as_slice())
            .read_to_end(&mut recovered)
            .unwrap();
        prop_assert_eq!(recovered, plaintext);
    }

    #[test]
    fn identifier_round_trip_and_determinism(identifier in "[a-f0-9]{1,64}") {
        let encryptor = test_encryptor();

        let encrypted = encryptor.encrypt_identifier(&identifier).unwrap();
        prop_assert_eq!(encryptor.encrypt_identifier(&identifier).unwrap(), encrypted.clone());
        prop_assert_eq!(encryptor.decrypt_identifier(&encrypted).unwrap(), identifier);
    }

    #[test]
    fn set_all_snapshot_identity(
        entries in proptest::collection::btree_map("/[a-z]{1,16}", any::<u64>(), 0..16)
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::<u64>::open(dir.path(), true).unwrap();
        let entries: BTreeMap<String, u64> = entries;

        store.set_all(&entries).unwrap();
        prop_assert_eq!(store.all().unwrap(), entries);
    }
}

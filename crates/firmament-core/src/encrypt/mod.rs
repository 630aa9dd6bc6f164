//! Client-side encryption for backend traffic.
//!
//! Two independent operations, both keyed from one user passphrase:
//!
//! - **Identifier encryption** (AES-SIV): deterministic, so the same content
//!   hash maps to the same remote object name across runs and across
//!   checkouts sharing the key.
//! - **Stream encryption** (AES-GCM): the plaintext is split into fixed-size
//!   chunks, each framed as `[u32 BE length][12-byte nonce][ciphertext‖tag]`.
//!   Each chunk authenticates independently; truncation anywhere inside a
//!   chunk is an authentication failure, never partial plaintext.

use std::io::{self, Read};

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use aes_siv::siv::Aes256Siv;
use base64::{Engine as _, engine::general_purpose::URL_SAFE};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

/// Plaintext bytes per encrypted chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// AES-GCM nonce size (96 bits).
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size.
pub const TAG_SIZE: usize = 16;

/// PBKDF2 rounds used when the config does not override them.
pub const DEFAULT_KEY_ITERATIONS: u32 = 100_000;

// Fixed KDF salt: determinism across checkouts matters more here than
// per-install salting, since every checkout must derive identical keys.
const KDF_SALT: &[u8] = b"NaCl";

#[derive(Error, Debug)]
pub enum EncryptError {
    /// A stream chunk failed authentication.
    #[error("chunk {chunk} failed authentication - tampered data or wrong key")]
    Authentication { chunk: u64 },

    /// The stream ended in the middle of a chunk.
    #[error("encrypted stream truncated inside chunk {chunk}")]
    Truncated { chunk: u64 },

    /// A chunk declared a length no valid writer produces.
    #[error("chunk {chunk} declares invalid length {length}")]
    InvalidChunkLength { length: u32, chunk: u64 },

    /// An encrypted identifier failed authentication.
    #[error("identifier failed authentication - tampered data or wrong key")]
    IdentifierAuthentication,

    /// An encrypted identifier was not valid URL-safe base64.
    #[error("identifier is not valid base64: {0}")]
    IdentifierEncoding(#[from] base64::DecodeError),

    /// A decrypted identifier was not valid UTF-8.
    #[error("decrypted identifier is not valid UTF-8")]
    IdentifierUtf8,

    /// AES encryption failed; does not happen with well-formed keys.
    #[error("encryption failed unexpectedly")]
    EncryptionFailed,
}

impl From<EncryptError> for io::Error {
    fn from(err: EncryptError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

/// Per-backend encryption, chosen at construction time.
#[derive(Clone)]
pub enum Encryptor {
    /// Identity on both identifiers and streams.
    Null,
    /// AES-SIV identifiers, chunked AES-GCM streams.
    Aes(AesEncryptor),
}

impl Encryptor {
    /// Build from an optional passphrase, as stored in the backend config.
    pub fn from_passphrase(passphrase: Option<&str>, iterations: u32) -> Self {
        match passphrase {
            Some(key) => Encryptor::Aes(AesEncryptor::new(key, iterations)),
            None => Encryptor::Null,
        }
    }

    /// Deterministically encrypt an identifier for use as a remote name.
    pub fn encrypt_identifier(&self, identifier: &str) -> Result<String, EncryptError> {
        match self {
            Encryptor::Null => Ok(identifier.to_owned()),
            Encryptor::Aes(aes) => aes.encrypt_identifier(identifier),
        }
    }

    pub fn decrypt_identifier(&self, crypttext: &str) -> Result<String, EncryptError> {
        match self {
            Encryptor::Null => Ok(crypttext.to_owned()),
            Encryptor::Aes(aes) => aes.decrypt_identifier(crypttext),
        }
    }

    /// Wrap a plaintext reader so that it yields the encrypted stream.
    pub fn encrypting_reader<'r>(&self, source: impl Read + 'r) -> Box<dyn Read + 'r> {
        match self {
            Encryptor::Null => Box::new(source),
            Encryptor::Aes(aes) => Box::new(EncryptingReader::new(source, aes)),
        }
    }

    /// Wrap an encrypted reader so that it yields authenticated plaintext.
    pub fn decrypting_reader<'r>(&self, source: impl Read + 'r) -> Box<dyn Read + 'r> {
        match self {
            Encryptor::Null => Box::new(source),
            Encryptor::Aes(aes) => Box::new(DecryptingReader::new(source, aes)),
        }
    }
}

impl std::fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Encryptor::Null => f.write_str("Encryptor::Null"),
            Encryptor::Aes(_) => f.write_str("Encryptor::Aes([REDACTED])"),
        }
    }
}

/// AES-SIV + AES-GCM encryptor with keys derived via PBKDF2-HMAC-SHA256.
#[derive(Clone)]
pub struct AesEncryptor {
    siv_key: Zeroizing<[u8; 64]>,
    gcm: Aes256Gcm,
    chunk_size: usize,
}

impl AesEncryptor {
    /// Derive both keys from the passphrase. The SIV and GCM keys come from
    /// independent PBKDF2 invocations so neither is a prefix of the other.
    pub fn new(passphrase: &str, iterations: u32) -> Self {
        let mut siv_key = Zeroizing::new([0u8; 64]);
        pbkdf2_hmac::<Sha256>(
            passphrase.as_bytes(),
            KDF_SALT,
            iterations,
            siv_key.as_mut(),
        );

        let mut gcm_key = Zeroizing::new([0u8; 32]);
        pbkdf2_hmac::<Sha256>(
            passphrase.as_bytes(),
            KDF_SALT,
            iterations,
            gcm_key.as_mut(),
        );
        let gcm = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(gcm_key.as_ref()));

        Self {
            siv_key,
            gcm,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Override the plaintext chunk size (mostly useful in tests).
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be non-zero");
        self.chunk_size = chunk_size;
        self
    }

    fn siv(&self) -> Result<Aes256Siv, EncryptError> {
        Aes256Siv::new_from_slice(self.siv_key.as_ref()).map_err(|_| EncryptError::EncryptionFailed)
    }

    fn encrypt_identifier(&self, identifier: &str) -> Result<String, EncryptError> {
        let headers: &[&[u8]] = &[];
        let ciphertext = self
            .siv()?
            .encrypt(headers, identifier.as_bytes())
            .map_err(|_| EncryptError::EncryptionFailed)?;
        Ok(URL_SAFE.encode(ciphertext))
    }

    fn decrypt_identifier(&self, crypttext: &str) -> Result<String, EncryptError> {
        let ciphertext = URL_SAFE.decode(crypttext)?;
        let headers: &[&[u8]] = &[];
        let plaintext = self
            .siv()?
            .decrypt(headers, &ciphertext)
            .map_err(|_| EncryptError::IdentifierAuthentication)?;
        String::from_utf8(plaintext).map_err(|_| EncryptError::IdentifierUtf8)
    }
}

/// Streaming encryptor: reads plaintext, yields framed AES-GCM chunks.
struct EncryptingReader<R> {
    source: R,
    cipher: Aes256Gcm,
    chunk_size: usize,
    buffer: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl<R: Read> EncryptingReader<R> {
    fn new(source: R, encryptor: &AesEncryptor) -> Self {
        Self {
            source,
            cipher: encryptor.gcm.clone(),
            chunk_size: encryptor.chunk_size,
            buffer: Vec::new(),
            pos: 0,
            eof: false,
        }
    }

    fn fill_next_chunk(&mut self) -> io::Result<()> {
        let mut plaintext = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < self.chunk_size {
            let read = self.source.read(&mut plaintext[filled..])?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        if filled == 0 {
            self.eof = true;
            return Ok(());
        }

        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), &plaintext[..filled])
            .map_err(|_| io::Error::from(EncryptError::EncryptionFailed))?;

        let framed_len = u32::try_from(NONCE_SIZE + ciphertext.len())
            .map_err(|_| io::Error::from(EncryptError::EncryptionFailed))?;
        self.buffer.clear();
        self.buffer.extend_from_slice(&framed_len.to_be_bytes());
        self.buffer.extend_from_slice(&nonce);
        self.buffer.extend_from_slice(&ciphertext);
        self.pos = 0;
        Ok(())
    }
}

impl<R: Read> Read for EncryptingReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.buffer.len() {
            if self.eof {
                return Ok(0);
            }
            self.fill_next_chunk()?;
        }
        let available = &self.buffer[self.pos..];
        let count = available.len().min(out.len());
        out[..count].copy_from_slice(&available[..count]);
        self.pos += count;
        Ok(count)
    }
}

/// Streaming decryptor: reads framed chunks, authenticates, yields plaintext.
struct DecryptingReader<R> {
    source: R,
    cipher: Aes256Gcm,
    chunk_size: usize,
    buffer: Vec<u8>,
    pos: usize,
    chunk_index: u64,
    eof: bool,
}

impl<R: Read> DecryptingReader<R> {
    fn new(source: R, encryptor: &AesEncryptor) -> Self {
        Self {
            source,
            cipher: encryptor.gcm.clone(),
            chunk_size: encryptor.chunk_size,
            buffer: Vec::new(),
            pos: 0,
            chunk_index: 0,
            eof: false,
        }
    }

    /// Read the next length prefix; `Ok(None)` is clean EOF at a boundary.
    fn read_length_prefix(&mut self) -> io::Result<Option<u32>> {
        let mut prefix = [0u8; 4];
        let mut filled = 0;
        while filled < prefix.len() {
            let read = self.source.read(&mut prefix[filled..])?;
            if read == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(EncryptError::Truncated {
                    chunk: self.chunk_index,
                }
                .into());
            }
            filled += read;
        }
        Ok(Some(u32::from_be_bytes(prefix)))
    }

    fn fill_next_chunk(&mut self) -> io::Result<()> {
        let Some(length) = self.read_length_prefix()? else {
            self.eof = true;
            return Ok(());
        };

        let min_len = NONCE_SIZE + TAG_SIZE;
        let max_len = self.chunk_size + NONCE_SIZE + TAG_SIZE;
        let length_usize = length as usize;
        if length_usize < min_len || length_usize > max_len {
            return Err(EncryptError::InvalidChunkLength {
                length,
                chunk: self.chunk_index,
            }
            .into());
        }

        let mut chunk = vec![0u8; length_usize];
        self.source.read_exact(&mut chunk).map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                EncryptError::Truncated {
                    chunk: self.chunk_index,
                }
                .into()
            } else {
                err
            }
        })?;

        let (nonce, ciphertext) = chunk.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                io::Error::from(EncryptError::Authentication {
                    chunk: self.chunk_index,
                })
            })?;

        self.buffer = plaintext;
        self.pos = 0;
        self.chunk_index += 1;
        Ok(())
    }
}

impl<R: Read> Read for DecryptingReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.buffer.len() {
            if self.eof {
                return Ok(0);
            }
            self.fill_next_chunk()?;
        }
        let available = &self.buffer[self.pos..];
        let count = available.len().min(out.len());
        out[..count].copy_from_slice(&available[..count]);
        self.pos += count;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Low iteration count: these exercise the stream format, not the KDF.
    fn test_encryptor(chunk_size: usize) -> AesEncryptor {
        AesEncryptor::new("test passphrase", 10).with_chunk_size(chunk_size)
    }

    fn encrypt_all(encryptor: &AesEncryptor, plaintext: &[u8]) -> Vec<u8> {
        let wrapped = Encryptor::Aes(encryptor.clone());
        let mut out = Vec::new();
        wrapped
            .encrypting_reader(plaintext)
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    fn decrypt_all(encryptor: &AesEncryptor, crypttext: &[u8]) -> io::Result<Vec<u8>> {
        let wrapped = Encryptor::Aes(encryptor.clone());
        let mut out = Vec::new();
        wrapped
            .decrypting_reader(crypttext)
            .read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn stream_round_trips_across_chunk_boundaries() {
        let encryptor = test_encryptor(64);
        for size in [0usize, 1, 63, 64, 65, 128, 160] {
            let plaintext: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let crypttext = encrypt_all(&encryptor, &plaintext);
            assert_eq!(decrypt_all(&encryptor, &crypttext).unwrap(), plaintext);
        }
    }

    #[test]
    fn empty_plaintext_is_empty_stream() {
        let encryptor = test_encryptor(64);
        assert!(encrypt_all(&encryptor, b"").is_empty());
        assert_eq!(decrypt_all(&encryptor, b"").unwrap(), b"");
    }

    #[test]
    fn each_chunk_carries_framing_overhead() {
        let encryptor = test_encryptor(64);
        let crypttext = encrypt_all(&encryptor, &[7u8; 160]);
        // Three chunks of 64 + 64 + 32 plaintext bytes.
        assert_eq!(crypttext.len(), 160 + 3 * (4 + NONCE_SIZE + TAG_SIZE));
    }

    #[test]
    fn flipped_byte_fails_authentication() {
        let encryptor = test_encryptor(64);
        let mut crypttext = encrypt_all(&encryptor, &[42u8; 100]);
        let middle = crypttext.len() / 2;
        crypttext[middle] ^= 0x01;
        let err = decrypt_all(&encryptor, &crypttext).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_stream_fails_not_partial() {
        let encryptor = test_encryptor(64);
        let crypttext = encrypt_all(&encryptor, &[9u8; 100]);
        // Cut inside the second chunk's body.
        let cut = crypttext.len() - 10;
        let err = decrypt_all(&encryptor, &crypttext[..cut]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        // And inside a length prefix.
        let err = decrypt_all(&encryptor, &crypttext[..2]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn identifier_encryption_is_deterministic() {
        let encryptor = Encryptor::Aes(test_encryptor(64));
        let first = encryptor.encrypt_identifier("abc123").unwrap();
        let second = encryptor.encrypt_identifier("abc123").unwrap();
        assert_eq!(first, second);
        assert_ne!(first, "abc123");
        assert_eq!(encryptor.decrypt_identifier(&first).unwrap(), "abc123");
    }

    #[test]
    fn identifier_decryption_rejects_tampering() {
        let encryptor = Encryptor::Aes(test_encryptor(64));
        let encrypted = encryptor.encrypt_identifier("abc123").unwrap();
        let mut raw = URL_SAFE.decode(&encrypted).unwrap();
        raw[0] ^= 0x01;
        let tampered = URL_SAFE.encode(raw);
        assert!(matches!(
            encryptor.decrypt_identifier(&tampered),
            Err(EncryptError::IdentifierAuthentication)
        ));
    }

    #[test]
    fn null_encryptor_is_identity() {
        let encryptor = Encryptor::Null;
        assert_eq!(encryptor.encrypt_identifier("abc").unwrap(), "abc");
        let mut out = Vec::new();
        encryptor
            .encrypting_reader(&b"plain"[..])
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"plain");
    }

    #[test]
    fn different_passphrases_cannot_decrypt() {
        let alpha = test_encryptor(64);
        let beta = AesEncryptor::new("other passphrase", 10).with_chunk_size(64);
        let crypttext = encrypt_all(&alpha, b"secret data");
        assert!(decrypt_all(&beta, &crypttext).is_err());
    }
}

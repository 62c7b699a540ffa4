// dbguardian/src/crypto.rs
//! Artifact encryption and checksums.
//!
//! Sealed artifacts are an AES-256-GCM STREAM (big-endian 32-bit counter): a 7 byte
//! random nonce prefix followed by segments, each `ciphertext || tag (16 bytes)` of
//! at most [`SEGMENT_LEN`] plaintext bytes. The final segment carries the last-block
//! flag, so a truncated artifact fails authentication like a tampered one.
//! Dumps are sealed and opened file to file without holding them in memory.

use aes_gcm::aead::KeyInit;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::stream::{DecryptorBE32, EncryptorBE32};
use aes_gcm::{Aes256Gcm, Key};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::config::EncryptionSettings;
use crate::errors::{AppError, Result};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 7;
pub const SEGMENT_LEN: usize = 64 * 1024;
const TAG_LEN: usize = 16;

const PASSWORD_SALT: &[u8] = b"dbguardian_backup_salt";
const PASSWORD_ROUNDS: u32 = 100_000;

/// Derives the artifact key from a passphrase with PBKDF2-HMAC-SHA256.
/// The salt is fixed, so the same passphrase always yields the same key.
pub fn derive_key(password: &str) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), PASSWORD_SALT, PASSWORD_ROUNDS, &mut key);
    key
}

/// Encrypts `plaintext` with a 256-bit key, returning `nonce || segments`.
pub fn encrypt(plaintext: &[u8], key: &[u8; KEY_LEN]) -> Result<Vec<u8>> {
    let mut sealed = Vec::with_capacity(NONCE_LEN + plaintext.len() + TAG_LEN);
    seal_stream(&cipher_for(key), &mut &plaintext[..], &mut sealed)?;
    Ok(sealed)
}

/// Reverses [`encrypt`]. Any tampering or truncation yields `DecryptionError`.
pub fn decrypt(sealed: &[u8], key: &[u8; KEY_LEN]) -> Result<Vec<u8>> {
    let mut plaintext = Vec::with_capacity(sealed.len());
    open_stream(&cipher_for(key), &mut &sealed[..], &mut plaintext)?;
    Ok(plaintext)
}

/// [`encrypt`] from the file at `source` into a new file at `dest`.
pub fn encrypt_file(source: &Path, dest: &Path, key: &[u8; KEY_LEN]) -> Result<()> {
    seal_file(&cipher_for(key), source, dest)
}

/// [`decrypt`] from the file at `source` into a new file at `dest`.
pub fn decrypt_file(source: &Path, dest: &Path, key: &[u8; KEY_LEN]) -> Result<()> {
    open_file(&cipher_for(key), source, dest)
}

fn cipher_for(key: &[u8; KEY_LEN]) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))
}

/// Fills `buf` unless the reader runs dry first. Returns how much was read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn seal_stream(cipher: &Aes256Gcm, reader: &mut impl Read, writer: &mut impl Write) -> Result<()> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    writer.write_all(&nonce)?;

    let mut encryptor = EncryptorBE32::from_aead(cipher.clone(), GenericArray::from_slice(&nonce));
    let mut current = vec![0u8; SEGMENT_LEN];
    let mut next = vec![0u8; SEGMENT_LEN];
    let mut current_len = read_full(reader, &mut current)?;

    // one segment of lookahead decides which segment is the last
    let last_len = loop {
        let next_len = read_full(reader, &mut next)?;
        if next_len == 0 {
            break current_len;
        }
        let segment = encryptor
            .encrypt_next(&current[..current_len])
            .map_err(|e| AppError::EncryptionFailed(e.to_string()))?;
        writer.write_all(&segment)?;
        std::mem::swap(&mut current, &mut next);
        current_len = next_len;
    };

    let segment = encryptor
        .encrypt_last(&current[..last_len])
        .map_err(|e| AppError::EncryptionFailed(e.to_string()))?;
    writer.write_all(&segment)?;
    Ok(())
}

fn open_stream(cipher: &Aes256Gcm, reader: &mut impl Read, writer: &mut impl Write) -> Result<()> {
    let mut nonce = [0u8; NONCE_LEN];
    if read_full(reader, &mut nonce)? < NONCE_LEN {
        return Err(AppError::DecryptionError(
            "sealed artifact is shorter than its nonce".to_string(),
        ));
    }

    let mut decryptor = DecryptorBE32::from_aead(cipher.clone(), GenericArray::from_slice(&nonce));
    let mut current = vec![0u8; SEGMENT_LEN + TAG_LEN];
    let mut next = vec![0u8; SEGMENT_LEN + TAG_LEN];
    let mut current_len = read_full(reader, &mut current)?;
    if current_len < TAG_LEN {
        return Err(AppError::DecryptionError(format!(
            "sealed artifact is {} bytes, shorter than nonce and tag",
            NONCE_LEN + current_len
        )));
    }

    let last_len = loop {
        let next_len = read_full(reader, &mut next)?;
        if next_len == 0 {
            break current_len;
        }
        let plaintext = decryptor
            .decrypt_next(&current[..current_len])
            .map_err(|_| AppError::DecryptionError("authentication tag mismatch".to_string()))?;
        writer.write_all(&plaintext)?;
        std::mem::swap(&mut current, &mut next);
        current_len = next_len;
    };

    let plaintext = decryptor
        .decrypt_last(&current[..last_len])
        .map_err(|_| {
            AppError::DecryptionError("authentication tag mismatch or truncated artifact".to_string())
        })?;
    writer.write_all(&plaintext)?;
    Ok(())
}

fn seal_file(cipher: &Aes256Gcm, source: &Path, dest: &Path) -> Result<()> {
    let mut reader = File::open(source)?;
    let mut writer = BufWriter::new(File::create(dest)?);
    seal_stream(cipher, &mut reader, &mut writer)?;
    finish(writer)
}

fn open_file(cipher: &Aes256Gcm, source: &Path, dest: &Path) -> Result<()> {
    let mut reader = File::open(source)?;
    let mut writer = BufWriter::new(File::create(dest)?);
    open_stream(cipher, &mut reader, &mut writer)?;
    finish(writer)
}

fn finish(writer: BufWriter<File>) -> Result<()> {
    let file = writer.into_inner().map_err(|e| AppError::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(())
}

/// Process-wide artifact cipher, built once from configuration.
#[derive(Clone)]
pub enum ArtifactCipher {
    Aes256Gcm(Aes256Gcm),
    Plaintext,
}

impl ArtifactCipher {
    /// Returns `None` when no key is configured and plaintext mode was not allowed.
    /// Jobs refuse admission in that state.
    pub fn from_settings(settings: &EncryptionSettings) -> Option<Self> {
        match (&settings.key, settings.allow_plaintext) {
            (Some(key), _) => Some(ArtifactCipher::Aes256Gcm(cipher_for(key))),
            (None, true) => Some(ArtifactCipher::Plaintext),
            (None, false) => None,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, ArtifactCipher::Aes256Gcm(_))
    }

    /// Returns the file to upload for the dump at `dump`. Sealed artifacts are
    /// written into `work_dir`; plaintext mode uploads the dump itself.
    pub fn seal_file(&self, dump: &Path, work_dir: &Path) -> Result<PathBuf> {
        match self {
            ArtifactCipher::Aes256Gcm(cipher) => {
                let sealed = work_dir.join("artifact.enc");
                seal_file(cipher, dump, &sealed)?;
                Ok(sealed)
            }
            ArtifactCipher::Plaintext => Ok(dump.to_path_buf()),
        }
    }

    /// Returns the dump recovered from the downloaded `artifact`.
    /// `encrypted` is the flag recorded with the artifact at backup time.
    pub fn open_file(&self, artifact: &Path, encrypted: bool, work_dir: &Path) -> Result<PathBuf> {
        match (self, encrypted) {
            (ArtifactCipher::Aes256Gcm(cipher), true) => {
                let dump = work_dir.join("database.dump");
                open_file(cipher, artifact, &dump)?;
                Ok(dump)
            }
            (_, false) => Ok(artifact.to_path_buf()),
            (ArtifactCipher::Plaintext, true) => Err(AppError::Configuration(
                "artifact is encrypted but no encryption key is configured".to_string(),
            )),
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// SHA-256 of a file, read in segments.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; SEGMENT_LEN];
    loop {
        let n = read_full(&mut file, &mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::debug;
use sha2::{Digest, Sha256, Sha384, Sha512};
use thiserror::Error;

const CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("not a regular file: {0}")]
    NotFound(PathBuf),
    #[error("hash computation failed for {path}: {message}")]
    HashComputationFailed { path: PathBuf, message: String },
    #[error("unsupported hash algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl FromStr for HashAlgorithm {
    type Err = IntegrityError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha384" => Ok(HashAlgorithm::Sha384),
            "sha512" => Ok(HashAlgorithm::Sha512),
            _ => Err(IntegrityError::UnsupportedAlgorithm(value.to_owned())),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        })
    }
}

/// Lowercase hex digest of `path`, read in 1 MiB chunks.
pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<String, IntegrityError> {
    if !path.is_file() {
        return Err(IntegrityError::NotFound(path.to_path_buf()));
    }
    match algorithm {
        HashAlgorithm::Sha256 => digest_file::<Sha256>(path),
        HashAlgorithm::Sha384 => digest_file::<Sha384>(path),
        HashAlgorithm::Sha512 => digest_file::<Sha512>(path),
    }
}

/// Hash `path` and compare against `expected` (case-insensitive hex).
pub fn verify_file(
    path: &Path,
    algorithm: HashAlgorithm,
    expected: &str,
) -> Result<String, IntegrityError> {
    let actual = hash_file(path, algorithm)?;
    let expected = expected.trim().to_ascii_lowercase();
    if actual != expected {
        return Err(IntegrityError::Mismatch { expected, actual });
    }
    debug!("integrity: {} matches {algorithm}", path.display());
    Ok(actual)
}

fn digest_file<D: Digest>(path: &Path) -> Result<String, IntegrityError> {
    let failed = |e: std::io::Error| IntegrityError::HashComputationFailed {
        path: path.to_path_buf(),
        message: e.to_string(),
    };
    let mut file = fs::File::open(path).map_err(failed)?;
    let mut hasher = D::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buf).map_err(failed)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex(&hasher.finalize()))
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::AppError;

const PREFIX: &str = "sha256:";

pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("{PREFIX}{:x}", Sha256::digest(bytes))
}

pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{PREFIX}{:x}", hasher.finalize()))
}

/// Hex part of a digest (`sha256:abcd` -> `abcd`).
pub fn hex_part(digest: &str) -> &str {
    digest.split_once(':').map(|(_, hex)| hex).unwrap_or(digest)
}

/// Check that `digest` has the `<algorithm>:<hex>` form used for blobs.
///
/// The algorithm is `[a-z0-9]+([+._-][a-z0-9]+)*` and the encoded part at
/// least 32 lowercase hex characters, which keeps digests safe to use as
/// file names and URL path segments.
pub fn validate_digest(digest: &str) -> Result<(), AppError> {
    let invalid = |reason: &str| AppError::InvalidDigest {
        digest: digest.to_string(),
        reason: reason.to_string(),
    };
    let (algorithm, hex) = digest.split_once(':').ok_or_else(|| invalid("missing ':'"))?;

    let components_ok = algorithm.split(['+', '.', '_', '-']).all(|part| {
        !part.is_empty() && part.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    });
    if !components_ok {
        return Err(invalid("malformed algorithm"));
    }
    if hex.len() < 32 || !hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
        return Err(invalid("encoded part must be at least 32 lowercase hex characters"));
    }
    Ok(())
}

/// First 12 hex characters, as printed next to layer progress.
pub fn short_id(digest: &str) -> &str {
    let hex = hex_part(digest);
    &hex[..hex.len().min(12)]
}

/// Writer adaptor that hashes everything passing through it.
pub struct DigestWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        DigestWriter { inner, hasher: Sha256::new(), written: 0 }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn finish(self) -> (W, String) {
        let digest = format!("{PREFIX}{:x}", self.hasher.finalize());
        (self.inner, digest)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

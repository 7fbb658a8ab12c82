use std::fs;
use std::io::{self, BufWriter, Read};
use std::path::{Path, PathBuf};

use dirs_next as dirs;
use tempfile::Builder;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::Settings;
use crate::digest::{DigestWriter, validate_digest};
use crate::error::AppError;

const SHA256_PREFIX: &str = "sha256:";
const TEMP_PREFIX: &str = ".tmp";

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub digest: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Content-addressed store of downloaded blobs, keyed by digest.
#[derive(Debug, Clone)]
pub struct LayerCache {
    root: PathBuf,
}

impl LayerCache {
    pub fn new(root: PathBuf) -> Self {
        LayerCache { root }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, AppError> {
        if let Some(dir) = settings.cache_dir()? {
            return Ok(LayerCache::new(dir));
        }
        let cache_root = std::env::var_os("XDG_CACHE_HOME")
            .map(PathBuf::from)
            .or_else(dirs::cache_dir)
            .ok_or_else(|| {
                AppError::config("Unable to determine cache directory for this platform")
            })?;
        Ok(LayerCache::new(cache_root.join("crpy").join("layers")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, digest: &str) -> Result<PathBuf, AppError> {
        validate_digest(digest)?;
        Ok(self.root.join(digest.replace(':', "_")))
    }

    pub fn lookup(&self, digest: &str) -> Option<PathBuf> {
        self.path_for(digest).ok().filter(|path| path.is_file())
    }

    /// Copy `reader` into the cache, checking the content against `digest`.
    ///
    /// The blob is written to a temporary file next to its final location and
    /// only renamed into place once the digest matches, so an interrupted or
    /// corrupted download never leaves a cache entry behind.
    pub fn store<R: Read>(&self, digest: &str, mut reader: R) -> Result<PathBuf, AppError> {
        let path = self.path_for(digest)?;
        if !digest.starts_with(SHA256_PREFIX) {
            return Err(AppError::InvalidDigest {
                digest: digest.to_string(),
                reason: "only sha256 blobs can be verified".to_string(),
            });
        }

        fs::create_dir_all(&self.root)?;
        let temp = Builder::new().prefix(TEMP_PREFIX).tempfile_in(&self.root)?;
        let mut writer = DigestWriter::new(BufWriter::new(temp));
        io::copy(&mut reader, &mut writer)?;
        let written = writer.written();
        let (buffered, actual) = writer.finish();
        let temp = buffered.into_inner().map_err(|err| err.into_error())?;

        if actual != digest {
            return Err(AppError::DigestMismatch { expected: digest.to_string(), actual });
        }

        temp.persist(&path).map_err(|err| err.error)?;
        debug!(digest, bytes = written, path = %path.display(), "stored blob in cache");
        Ok(path)
    }

    pub fn entries(&self) -> Result<Vec<CacheEntry>, AppError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, "skipping unreadable cache entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            let Some((algorithm, hex)) = name.split_once('_') else {
                continue;
            };
            entries.push(CacheEntry {
                digest: format!("{algorithm}:{hex}"),
                path: entry.path().to_path_buf(),
                size: entry.metadata().map(|m| m.len()).unwrap_or_default(),
            });
        }
        entries.sort_by(|a, b| a.digest.cmp(&b.digest));
        Ok(entries)
    }

    pub fn total_size(&self) -> Result<u64, AppError> {
        Ok(self.entries()?.iter().map(|entry| entry.size).sum())
    }

    /// Remove every cached blob, returning how many were removed and their size.
    ///
    /// Leftover temporary files from interrupted downloads are deleted too,
    /// but only real blobs are counted.
    pub fn clear(&self) -> Result<(usize, u64), AppError> {
        let mut removed = 0usize;
        let mut freed = 0u64;
        for entry in self.entries()? {
            if remove_if_present(&entry.path)? {
                removed += 1;
                freed = freed.saturating_add(entry.size);
            }
        }
        for path in self.stale_downloads()? {
            debug!(path = %path.display(), "removing interrupted download");
            remove_if_present(&path)?;
        }
        Ok((removed, freed))
    }

    fn stale_downloads(&self) -> Result<Vec<PathBuf>, AppError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let stale = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX))
            .map(|entry| entry.into_path())
            .collect();
        Ok(stale)
    }
}

fn remove_if_present(path: &Path) -> Result<bool, AppError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(AppError::Io(err)),
    }
}

//! Reading and writing `docker save` style image tarballs.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};

use tar::{Builder, EntryType, Header};
use tempfile::TempDir;

use crate::digest::{hex_part, validate_digest};
use crate::error::AppError;
use crate::model::ArchiveEntry;

const MANIFEST_FILE: &str = "manifest.json";

pub struct ImageArchiveWriter<W: Write> {
    builder: Builder<W>,
    config: Option<String>,
    layers: Vec<String>,
    written: HashSet<String>,
}

impl<W: Write> ImageArchiveWriter<W> {
    pub fn new(writer: W) -> Self {
        ImageArchiveWriter {
            builder: Builder::new(writer),
            config: None,
            layers: Vec::new(),
            written: HashSet::new(),
        }
    }

    pub fn add_config(&mut self, digest: &str, bytes: &[u8]) -> Result<(), AppError> {
        validate_digest(digest)?;
        let name = format!("{}.json", hex_part(digest));
        let mut header = file_header(bytes.len() as u64);
        self.builder.append_data(&mut header, &name, bytes)?;
        self.config = Some(name);
        Ok(())
    }

    /// Append the blob at `path` as `<hex>/layer.tar`.
    pub fn add_layer(&mut self, digest: &str, path: &Path) -> Result<(), AppError> {
        validate_digest(digest)?;
        let folder = hex_part(digest).to_string();
        let name = format!("{folder}/layer.tar");

        if self.written.insert(folder.clone()) {
            let mut dir = Header::new_gnu();
            dir.set_entry_type(EntryType::Directory);
            dir.set_size(0);
            dir.set_mode(0o755);
            dir.set_mtime(0);
            dir.set_cksum();
            self.builder.append_data(&mut dir, format!("{folder}/"), io::empty())?;

            let file = File::open(path)?;
            let mut header = file_header(file.metadata()?.len());
            self.builder.append_data(&mut header, &name, BufReader::new(file))?;
        }

        self.layers.push(name);
        Ok(())
    }

    /// Write `manifest.json` and close the tarball.
    pub fn finish(mut self, repo_tags: Vec<String>) -> Result<W, AppError> {
        let config = self
            .config
            .take()
            .ok_or_else(|| AppError::invalid_archive("image config was never added"))?;
        let entry = ArchiveEntry { config, repo_tags, layers: self.layers };
        let manifest = serde_json::to_vec(&[entry])?;

        let mut header = file_header(manifest.len() as u64);
        self.builder.append_data(&mut header, MANIFEST_FILE, manifest.as_slice())?;
        Ok(self.builder.into_inner()?)
    }
}

fn file_header(size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    header
}

/// An image tarball unpacked into a temporary directory.
pub struct ImageArchive {
    dir: TempDir,
    entry: ArchiveEntry,
}

impl ImageArchive {
    pub fn open(path: &Path) -> Result<Self, AppError> {
        let not_an_image = |detail: String| {
            AppError::invalid_archive(format!(
                "failed to load {} ({detail}). Is it a docker image?",
                path.display()
            ))
        };

        let file = File::open(path)?;
        let dir = tempfile::tempdir()?;
        tar::Archive::new(BufReader::new(file))
            .unpack(dir.path())
            .map_err(|err| not_an_image(err.to_string()))?;

        let manifest_path = dir.path().join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Err(not_an_image(format!("no {MANIFEST_FILE}")));
        }
        let entries: Vec<ArchiveEntry> = serde_json::from_str(&fs::read_to_string(&manifest_path)?)
            .map_err(|err| not_an_image(format!("unreadable {MANIFEST_FILE}: {err}")))?;
        let entry = entries
            .into_iter()
            .next_back()
            .ok_or_else(|| not_an_image(format!("empty {MANIFEST_FILE}")))?;

        let archive = ImageArchive { dir, entry };
        archive.config_path()?;
        archive.layer_paths()?;
        Ok(archive)
    }

    pub fn entry(&self) -> &ArchiveEntry {
        &self.entry
    }

    pub fn config_path(&self) -> Result<PathBuf, AppError> {
        self.member(&self.entry.config)
    }

    pub fn layer_paths(&self) -> Result<Vec<PathBuf>, AppError> {
        self.entry.layers.iter().map(|layer| self.member(layer)).collect()
    }

    fn member(&self, name: &str) -> Result<PathBuf, AppError> {
        let relative = Path::new(name);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(AppError::invalid_archive(format!("entry '{name}' escapes the archive")));
        }
        let path = self.dir.path().join(relative);
        if !path.is_file() {
            return Err(AppError::invalid_archive(format!("missing entry '{name}'")));
        }
        Ok(path)
    }
}

/// Whether the file starts with the gzip magic bytes.
pub fn is_gzip(path: &Path) -> io::Result<bool> {
    let mut magic = [0u8; 2];
    let mut file = File::open(path)?;
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == [0x1f, 0x8b]),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err),
    }
}

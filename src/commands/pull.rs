use std::io::BufWriter;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::archive::ImageArchiveWriter;
use crate::cache::LayerCache;
use crate::commands::resolve_platform;
use crate::config::Settings;
use crate::digest::short_id;
use crate::error::AppError;
use crate::model::Platform;
use crate::reference::{ImageReference, Reference};
use crate::registry::RegistryClient;
use crate::utils::layer_progress;

pub struct PullOptions {
    pub image: String,
    pub output: PathBuf,
    pub platform: Option<String>,
    pub proxy: Option<String>,
}

pub fn execute_pull(options: PullOptions) -> Result<(), AppError> {
    let settings = Settings::load()?;
    let reference = ImageReference::parse(&options.image)?;
    let platform = resolve_platform(options.platform.as_deref(), &settings)?;
    let cache = LayerCache::from_settings(&settings)?;
    let mut client = RegistryClient::connect(reference, &settings, options.proxy.as_deref())?;

    pull_image(&mut client, &cache, platform.as_ref(), settings.use_cache, &options.output)
}

/// Download an image into a `docker save` compatible tarball at `output`.
pub fn pull_image(
    client: &mut RegistryClient,
    cache: &LayerCache,
    platform: Option<&Platform>,
    use_cache: bool,
    output: &Path,
) -> Result<(), AppError> {
    let reference = client.reference().clone();
    println!("{}: Pulling from {}/{}", reference.tag(), reference.registry, reference.repository);

    let manifest = client.resolve_manifest(platform)?;
    let config = client.fetch_config(&manifest)?;

    // Without the cache, blobs still need a home until the tarball is written.
    let scratch = if use_cache { None } else { Some(tempfile::tempdir()?) };
    let store = match &scratch {
        Some(dir) => LayerCache::new(dir.path().to_path_buf()),
        None => cache.clone(),
    };

    let mut layer_files = Vec::with_capacity(manifest.layers.len());
    for layer in &manifest.layers {
        let id = short_id(&layer.digest);
        let cached = if use_cache { store.lookup(&layer.digest) } else { None };
        let path = match cached {
            Some(path) => {
                println!("Using cache for layer {id}");
                path
            }
            None => {
                let blob = client.open_blob(&layer.digest)?;
                let progress = layer_progress(id, blob.size.or(Some(layer.size)));
                let stored = store.store(&layer.digest, progress.wrap_read(blob));
                progress.finish_and_clear();
                let path = stored?;
                println!("{id}: Pull complete");
                path
            }
        };
        layer_files.push((layer.digest.clone(), path));
    }

    let parent = match output.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let temp = NamedTempFile::new_in(&parent)?;
    let mut writer = ImageArchiveWriter::new(BufWriter::new(temp));
    writer.add_config(&manifest.config.digest, &config)?;
    for (digest, path) in &layer_files {
        writer.add_layer(digest, path)?;
    }
    let repo_tags = match reference.reference {
        Reference::Tag(_) => vec![reference.to_string()],
        Reference::Digest(_) => Vec::new(),
    };
    let temp = writer.finish(repo_tags)?.into_inner().map_err(|err| err.into_error())?;
    temp.persist(output).map_err(|err| err.error)?;
    debug!(output = %output.display(), layers = layer_files.len(), "wrote image archive");

    println!("Downloaded image from {reference}");
    Ok(())
}

use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::info;

use crate::archive::{ImageArchive, is_gzip};
use crate::config::Settings;
use crate::digest::{sha256_file, short_id};
use crate::error::AppError;
use crate::model::{CONTAINER_CONFIG, Descriptor, ImageManifest, LAYER_TAR, LAYER_TAR_GZIP};
use crate::reference::{ImageReference, Reference};
use crate::registry::RegistryClient;

pub struct PushOptions {
    pub input: PathBuf,
    pub image: String,
    pub proxy: Option<String>,
}

pub fn execute_push(options: PushOptions) -> Result<String, AppError> {
    let settings = Settings::load()?;
    let reference = ImageReference::parse(&options.image)?;
    if let Reference::Digest(_) = reference.reference {
        return Err(AppError::invalid_reference(&options.image, "push needs a tag, not a digest"));
    }
    let mut client =
        RegistryClient::connect(reference, &settings, options.proxy.as_deref())?.for_push();

    push_image(&mut client, &options.input)
}

/// Upload a `docker save` tarball and tag it; returns the manifest digest.
pub fn push_image(client: &mut RegistryClient, input: &Path) -> Result<String, AppError> {
    let archive = ImageArchive::open(input)?;
    println!("The push refers to repository [{}]", client.reference());

    let config_path = archive.config_path()?;
    let layer_paths = archive.layer_paths()?;

    let mut blobs = Vec::with_capacity(layer_paths.len() + 1);
    blobs.push(config_path.clone());
    blobs.extend(layer_paths.iter().cloned());
    let described = blobs
        .par_iter()
        .map(|path| -> Result<(String, u64), AppError> {
            Ok((sha256_file(path)?, fs::metadata(path)?.len()))
        })
        .collect::<Result<Vec<_>, AppError>>()?;

    let (config_digest, config_size) = described[0].clone();
    ensure_blob(client, &config_path, &config_digest, config_size)?;
    let config = Descriptor::new(CONTAINER_CONFIG, config_size, config_digest);

    let mut layers = Vec::with_capacity(layer_paths.len());
    for (path, (digest, size)) in layer_paths.iter().zip(&described[1..]) {
        let existed = ensure_blob(client, path, digest, *size)?;
        if existed {
            println!("{}: Layer already exists", short_id(digest));
        } else {
            println!("{}: Pushed", short_id(digest));
        }
        let media_type = if is_gzip(path)? { LAYER_TAR_GZIP } else { LAYER_TAR };
        layers.push(Descriptor::new(media_type, *size, digest.clone()));
    }

    let manifest = ImageManifest::new(config, layers);
    let digest = client.push_manifest(&manifest)?;
    println!("Pushed {}: digest: {}", client.reference().tag(), digest);
    info!("Image available as {}", client.reference().with_digest(&digest));
    Ok(digest)
}

/// Upload the blob unless the registry already has it. Returns whether it existed.
fn ensure_blob(
    client: &mut RegistryClient,
    path: &Path,
    digest: &str,
    size: u64,
) -> Result<bool, AppError> {
    if client.blob_exists(digest)? {
        return Ok(true);
    }
    client.upload_blob(path, digest, size)?;
    Ok(false)
}

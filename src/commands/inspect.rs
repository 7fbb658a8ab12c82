use crate::commands::resolve_platform;
use crate::config::Settings;
use crate::error::AppError;
use crate::model::Descriptor;
use crate::reference::ImageReference;
use crate::registry::RegistryClient;
use crate::utils::format_bytes;

pub struct InspectOptions {
    pub image: String,
    pub platform: Option<String>,
    pub proxy: Option<String>,
}

fn connect(options: &InspectOptions) -> Result<(RegistryClient, Settings), AppError> {
    let settings = Settings::load()?;
    let reference = ImageReference::parse(&options.image)?;
    let client = RegistryClient::connect(reference, &settings, options.proxy.as_deref())?;
    Ok((client, settings))
}

/// Print the image manifest, or the raw manifest list when `list` is set.
pub fn execute_manifest(options: InspectOptions, list: bool) -> Result<(), AppError> {
    let (mut client, settings) = connect(&options)?;

    let document = if list {
        let reference = client.reference().tag().to_string();
        client.fetch_manifest(&reference, true)?.json()?
    } else {
        let platform = resolve_platform(options.platform.as_deref(), &settings)?;
        serde_json::to_value(client.resolve_manifest(platform.as_ref())?)?
    };

    println!("{}", serde_json::to_string_pretty(&document)?);
    Ok(())
}

/// Print the image configuration (entrypoint, env, history, ...).
pub fn execute_inspect(options: InspectOptions) -> Result<(), AppError> {
    let (mut client, settings) = connect(&options)?;
    let platform = resolve_platform(options.platform.as_deref(), &settings)?;
    let manifest = client.resolve_manifest(platform.as_ref())?;
    let config: serde_json::Value = serde_json::from_slice(&client.fetch_config(&manifest)?)?;

    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

pub fn execute_layers(options: InspectOptions) -> Result<Vec<Descriptor>, AppError> {
    let (mut client, settings) = connect(&options)?;
    let platform = resolve_platform(options.platform.as_deref(), &settings)?;
    let layers = client.layer_digests(platform.as_ref())?;

    for layer in &layers {
        println!("{:<72} {:>10}", layer.digest, format_bytes(layer.size));
    }
    let total: u64 = layers.iter().map(|layer| layer.size).sum();
    println!("{} layer(s), {} compressed", layers.len(), format_bytes(total));
    Ok(layers)
}

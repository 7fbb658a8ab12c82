use crate::cache::LayerCache;
use crate::config::Settings;
use crate::error::AppError;
use crate::utils::{display_path, format_bytes};

pub struct CacheOptions {
    pub show_path: bool,
    pub clear: bool,
}

pub fn execute_cache(options: CacheOptions) -> Result<(), AppError> {
    let settings = Settings::load()?;
    let cache = LayerCache::from_settings(&settings)?;

    if options.show_path {
        println!("Layer cache: {}", display_path(cache.root()));
        return Ok(());
    }

    if options.clear {
        let (removed, freed) = cache.clear()?;
        println!("Removed {} layer(s), freed {}.", removed, format_bytes(freed));
        return Ok(());
    }

    let entries = cache.entries()?;
    let total: u64 = entries.iter().map(|entry| entry.size).sum();
    println!("Layer cache: {}", display_path(cache.root()));
    println!("{} layer(s), {}", entries.len(), format_bytes(total));
    Ok(())
}

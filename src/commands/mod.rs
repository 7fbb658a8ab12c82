pub mod cache;
pub mod inspect;
pub mod login;
pub mod pull;
pub mod push;
pub mod settings;

pub use cache::execute_cache;
pub use inspect::{execute_inspect, execute_layers, execute_manifest};
pub use login::{execute_login, execute_logout};
pub use pull::execute_pull;
pub use push::execute_push;
pub use settings::execute_settings;

use crate::config::Settings;
use crate::error::AppError;
use crate::model::Platform;

/// Platform from the command line, falling back to the settings file.
pub fn resolve_platform(
    flag: Option<&str>,
    settings: &Settings,
) -> Result<Option<Platform>, AppError> {
    flag.or(settings.platform.as_deref())
        .map(|value| value.parse::<Platform>().map_err(AppError::config))
        .transpose()
}

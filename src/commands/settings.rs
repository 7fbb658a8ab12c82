use std::path::Path;
use std::process::Command;

use crate::config::{ensure_settings_file, settings_file_path};
use crate::error::AppError;
use crate::utils::display_path;

pub struct SettingsOptions {
    pub show_path: bool,
    pub edit: bool,
}

pub fn execute_settings(options: SettingsOptions) -> Result<(), AppError> {
    if options.edit {
        let path = ensure_settings_file()?;
        open_editor(&path)?;
    }

    if options.show_path || !options.edit {
        let path = settings_file_path()?;
        println!("Settings file: {}", display_path(&path));
    }

    Ok(())
}

fn open_editor(path: &Path) -> Result<(), AppError> {
    let editor = std::env::var("EDITOR")
        .or_else(|_| std::env::var("VISUAL"))
        .unwrap_or_else(|_| "nano".to_string());

    let status = Command::new(&editor)
        .arg(path)
        .status()
        .map_err(|err| AppError::Editor(err.to_string()))?;

    if status.success() {
        Ok(())
    } else {
        Err(AppError::Editor(format!("Editor exited with status {}", status)))
    }
}

use dialoguer::{Input, Password};

use crate::auth::Credentials;
use crate::config::Settings;
use crate::credentials::CredentialStore;
use crate::error::AppError;
use crate::reference::ImageReference;
use crate::registry::RegistryClient;

pub struct LoginOptions {
    pub registry: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub proxy: Option<String>,
}

pub struct LogoutOptions {
    pub registry: String,
}

pub fn execute_login(options: LoginOptions) -> Result<(), AppError> {
    let settings = Settings::load()?;
    let reference = ImageReference::registry_only(&options.registry)?;

    let username = match options.username {
        Some(username) => username,
        None => Input::<String>::new().with_prompt("Username").interact_text()?,
    };
    let password = match options.password {
        Some(password) => password,
        None => Password::new().with_prompt("Password").interact()?,
    };
    if username.is_empty() {
        return Err(AppError::Cancelled);
    }
    let credentials = Credentials::new(username, password);

    let registry = reference.registry.clone();
    let mut client = RegistryClient::new(reference, &settings, options.proxy.as_deref())?;
    client.authenticate(Some(credentials.clone()))?;

    let mut store = CredentialStore::load()?;
    store.insert(&registry, &credentials);
    store.save()?;
    println!("Login Succeeded");
    Ok(())
}

pub fn execute_logout(options: LogoutOptions) -> Result<bool, AppError> {
    let reference = ImageReference::registry_only(&options.registry)?;
    let mut store = CredentialStore::load()?;
    let removed = store.remove(&reference.registry);
    if removed {
        store.save()?;
        println!("Removing login credentials for {}", reference.registry);
    } else {
        println!("Not logged in to {}", reference.registry);
    }
    Ok(removed)
}

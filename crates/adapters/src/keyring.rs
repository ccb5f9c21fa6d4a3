use cypherdeck_core::connections::{ConnectionDescriptor, PasswordSource};

pub const PASSWORD_ENV_VAR: &str = "CYPHERDECK_DB_PASSWORD";
const DEFAULT_KEYRING_SERVICE: &str = "cypherdeck";

/// Password to present for `descriptor`, honouring its password source.
/// A keyring miss falls back to the environment and seeds the keyring.
#[must_use]
pub fn resolve_password(descriptor: &ConnectionDescriptor) -> Option<String> {
    match descriptor.password_source {
        PasswordSource::Inline => descriptor.password.clone(),
        PasswordSource::EnvVar => env_password(),
        PasswordSource::Keyring => {
            if let Some(password) = load_keyring_password(descriptor) {
                return Some(password);
            }

            if let Some(password) = env_password() {
                store_keyring_password(descriptor, &password);
                return Some(password);
            }

            None
        }
    }
}

fn env_password() -> Option<String> {
    std::env::var(PASSWORD_ENV_VAR)
        .ok()
        .filter(|password| !password.is_empty())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.and_then(|raw| {
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    })
}

fn keyring_service(descriptor: &ConnectionDescriptor) -> &str {
    non_empty(descriptor.keyring_service.as_deref()).unwrap_or(DEFAULT_KEYRING_SERVICE)
}

fn keyring_account(descriptor: &ConnectionDescriptor) -> String {
    if descriptor.username.is_empty() {
        descriptor.id.clone()
    } else {
        format!("{}@{}", descriptor.username, descriptor.id)
    }
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn load_keyring_password(descriptor: &ConnectionDescriptor) -> Option<String> {
    let entry = keyring_entry(descriptor)?;
    entry.get_password().ok().filter(|pw| !pw.is_empty())
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn load_keyring_password(_descriptor: &ConnectionDescriptor) -> Option<String> {
    None
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn store_keyring_password(descriptor: &ConnectionDescriptor, password: &str) {
    if password.is_empty() {
        return;
    }
    if let Some(entry) = keyring_entry(descriptor) {
        if let Err(error) = entry.set_password(password) {
            tracing::warn!(%error, id = %descriptor.id, "could not store password in keyring");
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn store_keyring_password(_descriptor: &ConnectionDescriptor, _password: &str) {}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn keyring_entry(descriptor: &ConnectionDescriptor) -> Option<::keyring::Entry> {
    ::keyring::Entry::new(keyring_service(descriptor), &keyring_account(descriptor)).ok()
}

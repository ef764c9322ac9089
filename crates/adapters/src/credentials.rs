use chq_core::connection::{ConnectionConfig, PasswordSource};

pub const KEYRING_SERVICE: &str = "chq";
pub const PASSWORD_ENV: &str = "CHQ_PASSWORD";

/// Password to send for `config`, following its password source.
///
/// Session-stored passwords win over the environment. Keyring-backed
/// connections fall back to `CHQ_PASSWORD` and remember it in the keyring.
#[must_use]
pub fn resolve_password(config: &ConnectionConfig) -> Option<String> {
    let env_password = std::env::var(PASSWORD_ENV)
        .ok()
        .filter(|pw| !pw.is_empty());

    match config.password_source {
        PasswordSource::Session => config
            .password
            .clone()
            .filter(|pw| !pw.is_empty())
            .or(env_password),
        PasswordSource::Keyring => {
            if let Some(password) = load_keyring_password(config) {
                return Some(password);
            }

            if let Some(password) = env_password {
                remember_password(config, &password);
                return Some(password);
            }

            None
        }
    }
}

/// Copy of `config` carrying the resolved password.
#[must_use]
pub fn with_resolved_password(config: &ConnectionConfig) -> ConnectionConfig {
    let mut resolved = config.clone();
    resolved.password = resolve_password(config);
    resolved
}

/// Stores `password` in the keyring; returns whether it was written.
#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
pub fn remember_password(config: &ConnectionConfig, password: &str) -> bool {
    if password.is_empty() {
        return false;
    }
    let Some(entry) = keyring_entry(config) else {
        return false;
    };
    match entry.set_password(password) {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(%error, "could not store password in keyring");
            false
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
pub fn remember_password(_config: &ConnectionConfig, _password: &str) -> bool {
    false
}

/// Removes the stored password, if any.
#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
pub fn forget_password(config: &ConnectionConfig) {
    if let Some(entry) = keyring_entry(config) {
        let _ = entry.delete_credential();
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
pub fn forget_password(_config: &ConnectionConfig) {}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn load_keyring_password(config: &ConnectionConfig) -> Option<String> {
    let entry = keyring_entry(config)?;
    entry.get_password().ok().filter(|pw| !pw.is_empty())
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn load_keyring_password(_config: &ConnectionConfig) -> Option<String> {
    None
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn keyring_entry(config: &ConnectionConfig) -> Option<keyring::Entry> {
    keyring::Entry::new(KEYRING_SERVICE, &config.credential_account()).ok()
}

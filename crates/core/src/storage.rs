use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub const CONFIG_DIR_ENV: &str = "CHQ_CONFIG_DIR";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("config directory is unavailable for this platform")]
    ConfigDirUnavailable,
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to create config directory at {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: toml::ser::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Resolves `<base>/chq`, where base is `$CHQ_CONFIG_DIR`, `%APPDATA%`,
/// `$XDG_CONFIG_HOME` or `$HOME/.config`, in that order.
pub fn default_config_dir() -> Result<PathBuf, StorageError> {
    let base_dir = if let Some(custom) = env::var_os(CONFIG_DIR_ENV) {
        PathBuf::from(custom)
    } else if cfg!(target_os = "windows") {
        env::var_os("APPDATA")
            .map(PathBuf::from)
            .ok_or(StorageError::ConfigDirUnavailable)?
    } else if let Some(xdg_config_home) = env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config_home)
    } else {
        let home = env::var_os("HOME").ok_or(StorageError::ConfigDirUnavailable)?;
        PathBuf::from(home).join(".config")
    };

    Ok(base_dir.join("chq"))
}

/// Missing and blank files both load as `T::default()`.
pub(crate) fn read_document<T>(path: &Path) -> Result<T, StorageError>
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        return Ok(T::default());
    }

    let raw = fs::read_to_string(path).map_err(|source| StorageError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    if raw.trim().is_empty() {
        return Ok(T::default());
    }

    toml::from_str(&raw).map_err(|source| StorageError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) fn write_document<T: Serialize>(
    path: &Path,
    document: &T,
    private: bool,
) -> Result<(), StorageError> {
    if let Some(parent_dir) = path.parent() {
        fs::create_dir_all(parent_dir).map_err(|source| StorageError::CreateDir {
            path: parent_dir.to_path_buf(),
            source,
        })?;
    }

    let rendered =
        toml::to_string_pretty(document).map_err(|source| StorageError::Serialize {
            path: path.to_path_buf(),
            source,
        })?;

    fs::write(path, rendered).map_err(|source| StorageError::Write {
        path: path.to_path_buf(),
        source,
    })?;

    if private {
        restrict_permissions(path)?;
    }
    tracing::debug!(path = %path.display(), "persisted document");
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), StorageError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|source| {
        StorageError::Write {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), StorageError> {
    Ok(())
}

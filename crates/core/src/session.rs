use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionConfig, PasswordSource};
use crate::storage::{default_config_dir, read_document, write_document, StorageError};

/// What the client restores at startup: the last connection, the selected
/// database and the last-edited query text.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    #[serde(default)]
    pub database_name: Option<String>,
    #[serde(default)]
    pub last_query: Option<String>,
    #[serde(default)]
    pub connection: Option<ConnectionConfig>,
}

#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
    session: Session,
}

impl FileSessionStore {
    pub fn load_default() -> Result<Self, StorageError> {
        Self::load_from_path(default_session_path()?)
    }

    pub fn load_from_path(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let session = read_document(&path)?;
        Ok(Self { path, session })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    #[must_use]
    pub fn connection(&self) -> Option<&ConnectionConfig> {
        self.session.connection.as_ref()
    }

    pub fn set_connection(&mut self, connection: ConnectionConfig) {
        self.session.connection = Some(connection);
    }

    pub fn clear_connection(&mut self) {
        self.session.connection = None;
    }

    #[must_use]
    pub fn database_name(&self) -> Option<&str> {
        self.session.database_name.as_deref()
    }

    pub fn set_database_name(&mut self, database_name: impl Into<String>) {
        self.session.database_name = Some(database_name.into());
    }

    #[must_use]
    pub fn last_query(&self) -> Option<&str> {
        self.session.last_query.as_deref()
    }

    pub fn set_last_query(&mut self, query: impl Into<String>) {
        self.session.last_query = Some(query.into());
    }

    /// Keyring-backed passwords are stripped before writing.
    pub fn persist(&self) -> Result<(), StorageError> {
        let mut rendered = self.session.clone();
        if let Some(connection) = rendered.connection.as_mut() {
            if connection.password_source == PasswordSource::Keyring {
                connection.password = None;
            }
        }
        write_document(&self.path, &rendered, true)
    }
}

pub fn default_session_path() -> Result<PathBuf, StorageError> {
    Ok(default_config_dir()?.join("session.toml"))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::FileSessionStore;
    use crate::connection::{ConnectionConfig, PasswordSource};

    #[test]
    fn missing_session_file_loads_empty_session() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let store = FileSessionStore::load_from_path(temp_dir.path().join("session.toml"))
            .expect("failed to load session");
        assert!(store.connection().is_none());
        assert!(store.last_query().is_none());
        assert!(store.database_name().is_none());
    }

    #[test]
    fn connection_and_last_query_restore_after_reload() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("session.toml");

        let mut store = FileSessionStore::load_from_path(&path).expect("failed to load session");
        let connection = ConnectionConfig::new("http://127.0.0.1:9090", "http://127.0.0.1:8123")
            .with_credentials(Some("default".to_string()), Some("secret".to_string()));
        store.set_connection(connection.clone());
        store.set_database_name("analytics");
        store.set_last_query("SELECT count() FROM hits");
        store.persist().expect("failed to persist session");

        let reloaded = FileSessionStore::load_from_path(&path).expect("failed to reload");
        assert_eq!(reloaded.connection(), Some(&connection));
        assert_eq!(reloaded.database_name(), Some("analytics"));
        assert_eq!(reloaded.last_query(), Some("SELECT count() FROM hits"));
    }

    #[test]
    fn keyring_passwords_are_not_written_to_disk() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("session.toml");

        let mut store = FileSessionStore::load_from_path(&path).expect("failed to load session");
        store.set_connection(
            ConnectionConfig::new("http://api", "http://ch")
                .with_credentials(Some("reader".to_string()), Some("hunter2".to_string()))
                .with_password_source(PasswordSource::Keyring),
        );
        store.persist().expect("failed to persist session");

        let raw = std::fs::read_to_string(&path).expect("failed to read session file");
        assert!(!raw.contains("hunter2"));

        let reloaded = FileSessionStore::load_from_path(&path).expect("failed to reload");
        let connection = reloaded.connection().expect("connection should persist");
        assert_eq!(connection.username.as_deref(), Some("reader"));
        assert!(connection.password.is_none());
        assert_eq!(connection.password_source, PasswordSource::Keyring);
    }

    #[test]
    fn clearing_connection_keeps_last_query() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("session.toml");

        let mut store = FileSessionStore::load_from_path(&path).expect("failed to load session");
        store.set_connection(ConnectionConfig::new("http://api", "http://ch"));
        store.set_last_query("SELECT 1");
        store.clear_connection();
        store.persist().expect("failed to persist session");

        let reloaded = FileSessionStore::load_from_path(&path).expect("failed to reload");
        assert!(reloaded.connection().is_none());
        assert_eq!(reloaded.last_query(), Some("SELECT 1"));
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::transport::TransportError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PasswordSource {
    /// Stored alongside the session.
    #[default]
    Session,
    /// Kept in the OS keyring; never written to the session file.
    Keyring,
}

/// Connection identity recorded by `connect`. No socket is opened eagerly.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub api_url: String,
    pub target_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub password_source: PasswordSource,
}

impl ConnectionConfig {
    #[must_use]
    pub fn new(api_url: impl Into<String>, target_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            target_url: target_url.into(),
            username: None,
            password: None,
            password_source: PasswordSource::Session,
        }
    }

    #[must_use]
    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username.filter(|value| !value.is_empty());
        self.password = password.filter(|value| !value.is_empty());
        self
    }

    #[must_use]
    pub fn with_password_source(mut self, source: PasswordSource) -> Self {
        self.password_source = source;
        self
    }

    /// Keyring account identifying these credentials.
    #[must_use]
    pub fn credential_account(&self) -> String {
        match &self.username {
            Some(username) => format!("{username}@{}", self.target_url),
            None => self.target_url.clone(),
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("api_url", &self.api_url)
            .field("target_url", &self.target_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("password_source", &self.password_source)
            .finish()
    }
}

/// One streamed query request, scoped by connection and database.
#[derive(Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub api_url: String,
    pub target_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub query: String,
    pub database: String,
    pub progress: bool,
}

impl StreamRequest {
    #[must_use]
    pub fn new(config: &ConnectionConfig, query: &str, database: &str, progress: bool) -> Self {
        Self {
            api_url: config.api_url.clone(),
            target_url: config.target_url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            query: query.to_string(),
            database: database.to_string(),
            progress,
        }
    }

    /// `{api_url}/query` with URL-encoded query parameters.
    pub fn url(&self) -> Result<Url, TransportError> {
        let mut base = Url::parse(&self.api_url).map_err(|error| {
            TransportError::new(format!("invalid api url `{}`: {error}", self.api_url))
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let mut url = base
            .join("query")
            .map_err(|error| TransportError::new(format!("invalid query url: {error}")))?;
        url.query_pairs_mut()
            .append_pair("query", &self.query)
            .append_pair("database", &self.database)
            .append_pair("target", &self.target_url)
            .append_pair("progress", if self.progress { "1" } else { "0" });
        Ok(url)
    }
}

impl fmt::Debug for StreamRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRequest")
            .field("api_url", &self.api_url)
            .field("target_url", &self.target_url)
            .field("username", &self.username)
            .field("query_len", &self.query.len())
            .field("database", &self.database)
            .field("progress", &self.progress)
            .finish_non_exhaustive()
    }
}

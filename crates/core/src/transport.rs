use std::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;

use crate::connection::StreamRequest;

/// Network or stream failure. Deliberately unstructured: callers only learn
/// that the execution could not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    message: String,
}

impl TransportError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEvent {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

impl ServerEvent {
    #[must_use]
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
            id: None,
        }
    }
}

#[async_trait]
pub trait EventStream: Send {
    /// `Ok(None)` once the server has closed the stream.
    async fn next_event(&mut self) -> Result<Option<ServerEvent>, TransportError>;

    async fn close(&mut self) {}
}

#[async_trait]
pub trait EventTransport: Debug + Send + Sync {
    async fn open(&self, request: &StreamRequest) -> Result<Box<dyn EventStream>, TransportError>;
}

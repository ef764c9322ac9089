use std::collections::VecDeque;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use chq_core::connection::StreamRequest;
use chq_core::transport::{EventStream, EventTransport, ServerEvent, TransportError};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};

use crate::event_stream::EventStreamDecoder;

const EVENT_STREAM_MIME: &str = "text/event-stream";

/// Opens query event streams over HTTP.
#[derive(Debug, Clone)]
pub struct HttpEventTransport {
    client: reqwest::Client,
}

impl HttpEventTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("chq/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(to_transport_error)?;
        Ok(Self { client })
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventTransport for HttpEventTransport {
    async fn open(&self, request: &StreamRequest) -> Result<Box<dyn EventStream>, TransportError> {
        let url = request.url()?;
        let mut builder = self
            .client
            .get(url)
            .header(ACCEPT, EVENT_STREAM_MIME)
            .header(CACHE_CONTROL, "no-cache");
        if let Some(username) = &request.username {
            builder = builder.basic_auth(username, request.password.as_deref());
        }

        let response = builder.send().await.map_err(to_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(%status, "query endpoint refused stream");
            return Err(TransportError::new(format!(
                "query endpoint returned {status}: {}",
                body.trim()
            )));
        }

        tracing::debug!(
            %status,
            database = %request.database,
            query_len = request.query.len(),
            "opened query event stream"
        );
        Ok(Box::new(HttpEventStream::new(
            response.bytes_stream().boxed(),
        )))
    }
}

/// Response body decoded into server events.
pub struct HttpEventStream {
    body: Option<BoxStream<'static, reqwest::Result<Bytes>>>,
    decoder: EventStreamDecoder,
    ready: VecDeque<ServerEvent>,
}

impl HttpEventStream {
    fn new(body: BoxStream<'static, reqwest::Result<Bytes>>) -> Self {
        Self {
            body: Some(body),
            decoder: EventStreamDecoder::new(),
            ready: VecDeque::new(),
        }
    }
}

#[async_trait]
impl EventStream for HttpEventStream {
    async fn next_event(&mut self) -> Result<Option<ServerEvent>, TransportError> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Ok(Some(event));
            }
            let Some(body) = self.body.as_mut() else {
                return Ok(None);
            };
            match body.next().await {
                Some(Ok(chunk)) => self.ready.extend(self.decoder.push(&chunk)),
                Some(Err(error)) => {
                    self.body = None;
                    return Err(to_transport_error(error));
                }
                None => self.body = None,
            }
        }
    }

    async fn close(&mut self) {
        self.body = None;
        self.ready.clear();
    }
}

impl fmt::Debug for HttpEventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpEventStream")
            .field("open", &self.body.is_some())
            .field("ready", &self.ready.len())
            .finish_non_exhaustive()
    }
}

fn to_transport_error(error: reqwest::Error) -> TransportError {
    TransportError::new(error.to_string())
}

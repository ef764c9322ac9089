use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::client::QueryClient;
use crate::connection::{ConnectionConfig, StreamRequest};
use crate::saved_queries::MemorySavedQueryStore;
use crate::transport::{EventStream, EventTransport, ServerEvent, TransportError};

type ScriptedItem = Result<ServerEvent, TransportError>;

/// In-process transport whose streams are fed by the test, keyed by query
/// text. Opening an unscripted query fails like a refused connection.
#[derive(Debug, Default)]
pub(crate) struct ScriptedTransport {
    pending: Mutex<HashMap<String, VecDeque<ScriptedStream>>>,
    opened: Mutex<Vec<StreamRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn script(&self, query: &str) -> StreamScript {
        let (sender, receiver) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        self.pending
            .lock()
            .expect("scripted transport poisoned")
            .entry(query.to_string())
            .or_default()
            .push_back(ScriptedStream {
                receiver,
                closed: Arc::clone(&closed),
            });
        StreamScript {
            sender: Some(sender),
            closed,
        }
    }

    pub(crate) fn opened(&self) -> Vec<StreamRequest> {
        self.opened
            .lock()
            .expect("scripted transport poisoned")
            .clone()
    }
}

#[async_trait]
impl EventTransport for ScriptedTransport {
    async fn open(&self, request: &StreamRequest) -> Result<Box<dyn EventStream>, TransportError> {
        self.opened
            .lock()
            .expect("scripted transport poisoned")
            .push(request.clone());
        let stream = self
            .pending
            .lock()
            .expect("scripted transport poisoned")
            .get_mut(&request.query)
            .and_then(VecDeque::pop_front);
        match stream {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(TransportError::new("connection refused")),
        }
    }
}

pub(crate) struct StreamScript {
    sender: Option<mpsc::UnboundedSender<ScriptedItem>>,
    closed: Arc<AtomicBool>,
}

impl StreamScript {
    pub(crate) fn raw(&self, event: &str, data: &str) {
        self.send(Ok(ServerEvent::new(event, data)));
    }

    pub(crate) fn progress(&self, rows: u64, total: u64) {
        self.raw(
            "progress",
            &format!(r#"{{"num_rows":{rows},"total_rows":{total}}}"#),
        );
    }

    pub(crate) fn result(&self, payload: &str) {
        self.raw("result", payload);
    }

    pub(crate) fn fail(&self, message: &str) {
        self.send(Err(TransportError::new(message)));
    }

    /// Ends the stream without a terminal event.
    pub(crate) fn close(mut self) {
        self.sender = None;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn send(&self, item: ScriptedItem) {
        if let Some(sender) = &self.sender {
            // The reader is gone once the stream was closed or cancelled.
            let _ = sender.send(item);
        }
    }
}

#[derive(Debug)]
struct ScriptedStream {
    receiver: mpsc::UnboundedReceiver<ScriptedItem>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl EventStream for ScriptedStream {
    async fn next_event(&mut self) -> Result<Option<ServerEvent>, TransportError> {
        match self.receiver.recv().await {
            Some(item) => item.map(Some),
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Drop for ScriptedStream {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub(crate) fn scripted_client(transport: &Arc<ScriptedTransport>) -> QueryClient {
    let transport: Arc<dyn EventTransport> = transport.clone();
    QueryClient::connect(
        ConnectionConfig::new("http://127.0.0.1:9090", "http://127.0.0.1:8123"),
        transport,
        Arc::new(MemorySavedQueryStore::new()),
    )
}

/// Yields to the runtime until `condition` holds.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition was not reached");
}

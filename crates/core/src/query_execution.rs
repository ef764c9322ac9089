use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::connection::StreamRequest;
use crate::protocol::{
    decode_progress, decode_result, QueryProgress, QueryResult, PROGRESS_EVENT, RESULT_EVENT,
};
use crate::transport::{EventTransport, TransportError};

pub type ProgressCallback = Box<dyn FnMut(QueryProgress) + Send>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("query transport failed: {0}")]
    Transport(#[source] TransportError),
    #[error("query execution was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionState {
    Pending,
    Resolved(Arc<QueryResult>),
    Rejected(TransportError),
    Cancelled,
}

impl ExecutionState {
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    fn outcome(&self) -> Option<Result<Arc<QueryResult>, ExecutionError>> {
        match self {
            Self::Pending => None,
            Self::Resolved(result) => Some(Ok(Arc::clone(result))),
            Self::Rejected(error) => Some(Err(ExecutionError::Transport(error.clone()))),
            Self::Cancelled => Some(Err(ExecutionError::Cancelled)),
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: watch::Sender<ExecutionState>,
}

impl Shared {
    /// Leaves `Pending` at most once; later transitions are dropped.
    fn transition(&self, next: ExecutionState) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_pending() {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    fn is_pending(&self) -> bool {
        self.state.borrow().is_pending()
    }
}

/// Rejects an execution whose driving task ends without reaching a terminal
/// state, e.g. on panic or runtime shutdown.
struct RejectOnDrop(Arc<Shared>);

impl Drop for RejectOnDrop {
    fn drop(&mut self) {
        if self.0.transition(ExecutionState::Rejected(TransportError::new(
            "query stream task ended without a result",
        ))) {
            tracing::warn!("query stream task ended without a result");
        }
    }
}

/// Handle to one streamed query.
///
/// The stream is driven by a spawned task, so progress keeps flowing whether
/// or not anyone is awaiting [`QueryExecution::get`].
#[derive(Debug)]
pub struct QueryExecution {
    shared: Arc<Shared>,
    state: watch::Receiver<ExecutionState>,
    task: AbortHandle,
}

impl QueryExecution {
    /// Must be called from within a Tokio runtime.
    pub(crate) fn start(
        transport: Arc<dyn EventTransport>,
        request: StreamRequest,
        on_progress: Option<ProgressCallback>,
    ) -> Self {
        let (sender, state) = watch::channel(ExecutionState::Pending);
        let shared = Arc::new(Shared { state: sender });
        let task = tokio::spawn(drive(
            transport,
            request,
            Arc::clone(&shared),
            on_progress,
        ))
        .abort_handle();

        Self {
            shared,
            state,
            task,
        }
    }

    #[must_use]
    pub fn state(&self) -> ExecutionState {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state.borrow().is_pending()
    }

    /// Waits for the terminal state. Every call observes the same value.
    pub async fn get(&self) -> Result<Arc<QueryResult>, ExecutionError> {
        let mut state = self.state.clone();
        let terminal = state.wait_for(|state| !state.is_pending()).await;
        match terminal {
            Ok(state) => state
                .outcome()
                .unwrap_or(Err(ExecutionError::Cancelled)),
            // Unreachable while `self.shared` keeps the sender alive.
            Err(_) => Err(ExecutionError::Transport(TransportError::new(
                "query execution state was dropped",
            ))),
        }
    }

    /// Closes the stream. A no-op once the execution is terminal.
    pub fn cancel(&self) {
        if self.shared.transition(ExecutionState::Cancelled) {
            self.task.abort();
            tracing::debug!("query execution cancelled");
        }
    }
}

async fn drive(
    transport: Arc<dyn EventTransport>,
    request: StreamRequest,
    shared: Arc<Shared>,
    mut on_progress: Option<ProgressCallback>,
) {
    let _guard = RejectOnDrop(Arc::clone(&shared));
    tracing::debug!(request = ?request, "opening query stream");

    let mut stream = match transport.open(&request).await {
        Ok(stream) => stream,
        Err(error) => {
            tracing::warn!(%error, "failed to open query stream");
            shared.transition(ExecutionState::Rejected(error));
            return;
        }
    };

    loop {
        let event = match stream.next_event().await {
            Ok(Some(event)) => event,
            Ok(None) => {
                shared.transition(ExecutionState::Rejected(TransportError::new(
                    "query stream closed before a result was received",
                )));
                break;
            }
            Err(error) => {
                tracing::warn!(%error, "query stream failed");
                shared.transition(ExecutionState::Rejected(error));
                break;
            }
        };

        match event.event.as_str() {
            PROGRESS_EVENT => {
                if !shared.is_pending() {
                    break;
                }
                match decode_progress(&event.data) {
                    Ok(progress) => {
                        if let Some(callback) = on_progress.as_mut() {
                            callback(progress);
                        }
                    }
                    Err(error) => tracing::warn!(%error, "skipping undecodable progress event"),
                }
            }
            RESULT_EVENT => {
                let next = match decode_result(&event.data) {
                    Ok(result) => {
                        tracing::debug!(
                            columns = result.columns.len(),
                            rows = result.rows.len(),
                            failed = result.is_error(),
                            "query stream resolved"
                        );
                        ExecutionState::Resolved(Arc::new(result))
                    }
                    Err(error) => {
                        tracing::warn!(%error, "rejecting undecodable result event");
                        ExecutionState::Rejected(TransportError::new(error.to_string()))
                    }
                };
                shared.transition(next);
                break;
            }
            other => tracing::trace!(event = other, "ignoring unknown stream event"),
        }
    }

    stream.close().await;
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::{ExecutionError, ExecutionState, ProgressCallback, QueryExecution};
    use crate::connection::{ConnectionConfig, StreamRequest};
    use crate::protocol::QueryProgress;
    use crate::test_support::{wait_until, ScriptedTransport};
    use crate::transport::EventTransport;

    fn request(query: &str) -> StreamRequest {
        let config = ConnectionConfig::new("http://127.0.0.1:9090", "http://127.0.0.1:8123");
        StreamRequest::new(&config, query, "default", true)
    }

    fn recording_callback() -> (ProgressCallback, Arc<Mutex<Vec<QueryProgress>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: ProgressCallback = Box::new(move |progress| {
            sink.lock().expect("progress sink poisoned").push(progress);
        });
        (callback, seen)
    }

    fn start(transport: &Arc<ScriptedTransport>, query: &str) -> QueryExecution {
        start_with(transport, query, None)
    }

    fn start_with(
        transport: &Arc<ScriptedTransport>,
        query: &str,
        on_progress: Option<ProgressCallback>,
    ) -> QueryExecution {
        let transport: Arc<dyn EventTransport> = transport.clone();
        QueryExecution::start(transport, request(query), on_progress)
    }

    #[tokio::test]
    async fn progress_is_delivered_in_order_then_result_resolves() {
        let transport = Arc::new(ScriptedTransport::default());
        let script = transport.script("SELECT 1");
        let (callback, seen) = recording_callback();
        let execution = start_with(&transport, "SELECT 1", Some(callback));

        script.progress(0, 10);
        script.progress(10, 10);
        script.result(r#"{"columns":[{"name":"1","type":"UInt8"}],"rows":[[1]]}"#);

        let result = execution.get().await.expect("execution should resolve");
        assert_eq!(result.rows, vec![vec![json!(1)]]);
        assert_eq!(
            *seen.lock().expect("progress sink poisoned"),
            vec![QueryProgress::new(0, 10), QueryProgress::new(10, 10)]
        );
        wait_until(|| script.is_closed()).await;
    }

    #[tokio::test]
    async fn repeated_get_observes_the_same_result() {
        let transport = Arc::new(ScriptedTransport::default());
        let script = transport.script("SELECT 2");
        let execution = start(&transport, "SELECT 2");
        script.result(r#"{"columns":[{"name":"2","type":"UInt8"}],"rows":[[2]]}"#);

        let first = execution.get().await.expect("first get");
        let second = execution.get().await.expect("second get");
        let (third, fourth) = tokio::join!(execution.get(), execution.get());

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(third.expect("third get"), first);
        assert_eq!(fourth.expect("fourth get"), first);
        assert!(matches!(execution.state(), ExecutionState::Resolved(_)));
    }

    #[tokio::test]
    async fn events_after_the_result_are_ignored() {
        let transport = Arc::new(ScriptedTransport::default());
        let script = transport.script("SELECT 3");
        let (callback, seen) = recording_callback();
        let execution = start_with(&transport, "SELECT 3", Some(callback));

        script.result(r#"{"columns":[],"rows":[]}"#);
        script.progress(5, 5);
        script.result(r#"{"columns":[{"name":"x","type":"UInt8"}],"rows":[[9]]}"#);

        let result = execution.get().await.expect("execution should resolve");
        assert!(result.rows.is_empty());
        assert!(seen.lock().expect("progress sink poisoned").is_empty());
    }

    #[tokio::test]
    async fn transport_failure_rejects_without_partial_result() {
        let transport = Arc::new(ScriptedTransport::default());
        let script = transport.script("SELECT 4");
        let execution = start(&transport, "SELECT 4");

        script.progress(1, 2);
        script.fail("connection reset by peer");

        let err = execution.get().await.expect_err("execution should reject");
        assert!(matches!(err, ExecutionError::Transport(ref inner) if inner.message() == "connection reset by peer"));
        assert_eq!(execution.get().await.expect_err("still rejected"), err);
    }

    #[tokio::test]
    async fn early_close_rejects_execution() {
        let transport = Arc::new(ScriptedTransport::default());
        let script = transport.script("SELECT 5");
        let execution = start(&transport, "SELECT 5");

        script.progress(1, 2);
        script.close();

        let err = execution.get().await.expect_err("execution should reject");
        assert!(matches!(err, ExecutionError::Transport(_)));
    }

    #[tokio::test]
    async fn open_failure_rejects_execution() {
        let transport = Arc::new(ScriptedTransport::default());
        let execution = start(&transport, "SELECT unscripted");

        let err = execution.get().await.expect_err("execution should reject");
        assert!(matches!(err, ExecutionError::Transport(_)));
    }

    #[tokio::test]
    async fn undecodable_result_rejects_execution() {
        let transport = Arc::new(ScriptedTransport::default());
        let script = transport.script("SELECT 6");
        let execution = start(&transport, "SELECT 6");

        script.result("{\"columns\": [");

        let err = execution.get().await.expect_err("execution should reject");
        assert!(matches!(err, ExecutionError::Transport(_)));
    }

    #[tokio::test]
    async fn undecodable_progress_is_skipped() {
        let transport = Arc::new(ScriptedTransport::default());
        let script = transport.script("SELECT 7");
        let (callback, seen) = recording_callback();
        let execution = start_with(&transport, "SELECT 7", Some(callback));

        script.raw("progress", "not json");
        script.progress(3, 4);
        script.raw("heartbeat", "{}");
        script.result(r#"{"rows":[]}"#);

        execution.get().await.expect("execution should resolve");
        assert_eq!(
            *seen.lock().expect("progress sink poisoned"),
            vec![QueryProgress::new(3, 4)]
        );
    }

    #[tokio::test]
    async fn cancel_closes_stream_and_discards_later_progress() {
        let transport = Arc::new(ScriptedTransport::default());
        let script = transport.script("SELECT sleep(3)");
        let (callback, seen) = recording_callback();
        let execution = start_with(&transport, "SELECT sleep(3)", Some(callback));

        script.progress(1, 3);
        wait_until(|| seen.lock().expect("progress sink poisoned").len() == 1).await;

        execution.cancel();
        assert_eq!(execution.state(), ExecutionState::Cancelled);
        wait_until(|| script.is_closed()).await;

        script.progress(2, 3);
        script.result(r#"{"rows":[]}"#);
        tokio::task::yield_now().await;

        assert_eq!(seen.lock().expect("progress sink poisoned").len(), 1);
        assert_eq!(execution.get().await, Err(ExecutionError::Cancelled));
    }

    #[tokio::test]
    async fn cancel_after_terminal_state_is_a_no_op() {
        let transport = Arc::new(ScriptedTransport::default());
        let script = transport.script("SELECT 8");
        let execution = start(&transport, "SELECT 8");
        script.result(r#"{"columns":[{"name":"8","type":"UInt8"}],"rows":[[8]]}"#);

        let result = execution.get().await.expect("execution should resolve");
        execution.cancel();

        assert_eq!(execution.state(), ExecutionState::Resolved(result));
    }
}

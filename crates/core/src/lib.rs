pub mod client;
pub mod connection;
pub mod protocol;
pub mod query_execution;
pub mod reactive_store;
pub mod saved_queries;
pub mod session;
pub mod storage;
pub mod tab;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use client::{ClientError, ColumnInfo, PartitionInfo, QueryClient, TableInfo, TableStats};
pub use connection::{ConnectionConfig, PasswordSource, StreamRequest};
pub use protocol::{ColumnSpec, QueryError, QueryProgress, QueryResult, QueryStats};
pub use query_execution::{ExecutionError, ExecutionState, ProgressCallback, QueryExecution};
pub use reactive_store::{
    ReactiveStore, StateMirror, StoreField, StoreObserver, StorePatch, StoreState, SubscriptionId,
};
pub use saved_queries::{FileSavedQueryStore, MemorySavedQueryStore, SavedQuery, SavedQueryStore};
pub use session::{FileSessionStore, Session};
pub use storage::StorageError;
pub use tab::{ExecuteOutcome, SkipReason, Tab, TabError, TabHandle, TabId, TabTable, TabUpdate};
pub use transport::{EventStream, EventTransport, ServerEvent, TransportError};

mod logging;

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chq_adapters::credentials;
use chq_adapters::http::HttpEventTransport;
use chq_core::client::{ClientError, QueryClient};
use chq_core::connection::{ConnectionConfig, PasswordSource};
use chq_core::protocol::QueryError;
use chq_core::query_execution::ExecutionError;
use chq_core::reactive_store::{ReactiveStore, StoreField, StorePatch, StoreState};
use chq_core::saved_queries::{
    default_saved_queries_path, FileSavedQueryStore, SavedQuery, SavedQueryStore,
};
use chq_core::session::{default_session_path, FileSessionStore};
use chq_core::storage::StorageError;
use chq_core::tab::{ExecuteOutcome, SkipReason, TabError, TabHandle};
use chq_core::transport::EventTransport;
use clap::{Parser, Subcommand};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(name = "chq", version, about = "Streaming query client for ClickHouse")]
struct Cli {
    /// Directory holding session.toml and saved_queries.toml.
    #[arg(long, global = true, value_name = "DIR")]
    config_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Records the connection used by later commands.
    Connect {
        api_url: String,
        target_url: String,
        #[arg(long, short)]
        user: Option<String>,
        #[arg(long)]
        password: Option<String>,
        /// Keep the password in the OS keyring instead of the session file.
        #[arg(long)]
        keyring: bool,
    },
    Disconnect,
    /// Selects the database queries run against.
    Use { database: String },
    /// Runs a query and prints the result as JSON.
    Run {
        /// Defaults to the last query run.
        query: Option<String>,
        #[arg(long, conflicts_with = "query")]
        saved: Option<String>,
        #[arg(long)]
        database: Option<String>,
    },
    Saved {
        #[command(subcommand)]
        command: SavedCommand,
    },
    Databases,
    Tables {
        database: Option<String>,
        /// Leave out Distributed tables.
        #[arg(long)]
        local_only: bool,
    },
    Stats {
        table: String,
        #[arg(long)]
        database: Option<String>,
    },
    Columns {
        table: String,
        #[arg(long)]
        database: Option<String>,
    },
    Partitions {
        table: String,
        #[arg(long)]
        database: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum SavedCommand {
    List,
    Save { name: String, query: String },
    Delete { name: String },
    Rename { from: String, to: String },
}

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Tab(#[from] TabError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("server rejected query: {0}")]
    Query(QueryError),
    #[error("not connected; run `chq connect` first")]
    NotConnected,
    #[error("no saved query named `{0}`")]
    UnknownSavedQuery(String),
    #[error("no query given and no previous query to rerun")]
    MissingQuery,
    #[error("query was not run: {0:?}")]
    Skipped(SkipReason),
    #[error("could not write output: {0}")]
    Output(#[from] io::Error),
    #[error("could not render output: {0}")]
    Render(#[from] serde_json::Error),
}

struct Paths {
    session: PathBuf,
    saved_queries: PathBuf,
}

impl Paths {
    fn resolve(config_dir: Option<&Path>) -> Result<Self, StorageError> {
        match config_dir {
            Some(dir) => Ok(Self {
                session: dir.join("session.toml"),
                saved_queries: dir.join("saved_queries.toml"),
            }),
            None => Ok(Self {
                session: default_session_path()?,
                saved_queries: default_saved_queries_path()?,
            }),
        }
    }
}

struct App {
    session: FileSessionStore,
    saved_queries: Arc<FileSavedQueryStore>,
    transport: Arc<dyn EventTransport>,
}

impl App {
    fn load(paths: &Paths, transport: Arc<dyn EventTransport>) -> Result<Self, StorageError> {
        Ok(Self {
            session: FileSessionStore::load_from_path(&paths.session)?,
            saved_queries: Arc::new(FileSavedQueryStore::load_from_path(&paths.saved_queries)?),
            transport,
        })
    }

    fn client(&self) -> Result<QueryClient, AppError> {
        let config = self.session.connection().ok_or(AppError::NotConnected)?;
        let saved_queries: Arc<dyn SavedQueryStore> = self.saved_queries.clone();
        Ok(QueryClient::connect(
            credentials::with_resolved_password(config),
            Arc::clone(&self.transport),
            saved_queries,
        ))
    }

    fn database(&self, explicit: Option<String>) -> String {
        explicit
            .or_else(|| self.session.database_name().map(str::to_string))
            .unwrap_or_else(|| chq_core::reactive_store::DEFAULT_DATABASE.to_string())
    }
}

fn print_json<T: Serialize + ?Sized>(out: &mut dyn Write, value: &T) -> Result<(), AppError> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

async fn run_app(
    cli: Cli,
    transport: Arc<dyn EventTransport>,
    out: &mut dyn Write,
) -> Result<(), AppError> {
    let paths = Paths::resolve(cli.config_dir.as_deref())?;
    let mut app = App::load(&paths, transport)?;

    match cli.command {
        Command::Connect {
            api_url,
            target_url,
            user,
            password,
            keyring,
        } => {
            let source = if keyring {
                PasswordSource::Keyring
            } else {
                PasswordSource::Session
            };
            let config = ConnectionConfig::new(api_url, target_url)
                .with_credentials(user, password)
                .with_password_source(source);
            if let (PasswordSource::Keyring, Some(password)) = (source, &config.password) {
                if !credentials::remember_password(&config, password) {
                    tracing::warn!("password not stored; set CHQ_PASSWORD for later commands");
                }
            }
            let target_url = config.target_url.clone();
            app.session.set_connection(config);
            app.session.persist()?;
            writeln!(out, "connected to {target_url}")?;
        }
        Command::Disconnect => {
            if let Some(config) = app.session.connection() {
                if config.password_source == PasswordSource::Keyring {
                    credentials::forget_password(config);
                }
            }
            app.session.clear_connection();
            app.session.persist()?;
            writeln!(out, "disconnected")?;
        }
        Command::Use { database } => {
            app.session.set_database_name(database.as_str());
            app.session.persist()?;
            writeln!(out, "using database {database}")?;
        }
        Command::Run {
            query,
            saved,
            database,
        } => run_query(&mut app, query, saved, database, out).await?,
        Command::Saved { command } => run_saved(&app, command, out)?,
        Command::Databases => {
            let databases = app.client()?.databases().await?;
            print_json(out, &databases)?;
        }
        Command::Tables {
            database,
            local_only,
        } => {
            let database = app.database(database);
            let tables = app.client()?.tables(&database, local_only).await?;
            print_json(out, &tables)?;
        }
        Command::Stats { table, database } => {
            let database = app.database(database);
            let stats = app.client()?.table_stats(&database, &table).await?;
            print_json(out, &stats)?;
        }
        Command::Columns { table, database } => {
            let database = app.database(database);
            let columns = app.client()?.table_columns(&database, &table).await?;
            print_json(out, &columns)?;
        }
        Command::Partitions { table, database } => {
            let database = app.database(database);
            let partitions = app.client()?.table_partitions(&database, &table).await?;
            print_json(out, &partitions)?;
        }
    }
    Ok(())
}

async fn run_query(
    app: &mut App,
    query: Option<String>,
    saved: Option<String>,
    database: Option<String>,
    out: &mut dyn Write,
) -> Result<(), AppError> {
    let client = Arc::new(app.client()?);
    let store = ReactiveStore::new();
    store.initialize(
        StorePatch::new()
            .client(Some(Arc::clone(&client)))
            .database_name(app.database(database)),
    );

    let tab = match (saved, query) {
        (Some(name), _) => {
            let saved = client
                .saved_queries()?
                .into_iter()
                .find(|saved| saved.name == name)
                .ok_or(AppError::UnknownSavedQuery(name))?;
            TabHandle::open_saved(&store, &saved)?
        }
        (None, query) => {
            let text = query
                .or_else(|| app.session.last_query().map(str::to_string))
                .ok_or(AppError::MissingQuery)?;
            let tab = TabHandle::open_new(&store, &client)?;
            tab.set_contents(&text)?;
            tab
        }
    };
    tab.select()?;

    store.connect_component_state(
        Arc::new(|state: &Arc<StoreState>, _: &[StoreField]| {
            let Some(progress) = state.current().and_then(|tab| tab.query_progress) else {
                return;
            };
            if progress.total_rows > 0 {
                tracing::info!(
                    rows = progress.rows_processed,
                    total = progress.total_rows,
                    "query progress"
                );
            }
        }),
        &[StoreField::CurrentTab],
    );

    let state = store.get();
    let outcome = tab
        .execute(state.client().map(|client| &**client), state.database_name())
        .await?;

    let contents = tab.get()?.query_contents.clone();
    app.session.set_last_query(contents);
    app.session.persist()?;

    match outcome {
        ExecuteOutcome::Completed(result) => {
            print_json(out, &*result)?;
            match &result.error {
                Some(error) => Err(AppError::Query(error.clone())),
                None => Ok(()),
            }
        }
        ExecuteOutcome::Skipped(reason) => Err(AppError::Skipped(reason)),
    }
}

fn run_saved(app: &App, command: SavedCommand, out: &mut dyn Write) -> Result<(), AppError> {
    let store = app.saved_queries.as_ref();
    match command {
        SavedCommand::List => print_json(out, &store.list()?)?,
        SavedCommand::Save { name, query } => {
            store.save(&name, &query)?;
            writeln!(out, "saved {name}")?;
        }
        SavedCommand::Delete { name } => {
            if !store.delete(&name)? {
                return Err(AppError::UnknownSavedQuery(name));
            }
            writeln!(out, "deleted {name}")?;
        }
        SavedCommand::Rename { from, to } => {
            let existing: SavedQuery = store
                .list()?
                .into_iter()
                .find(|saved| saved.name == from)
                .ok_or_else(|| AppError::UnknownSavedQuery(from.clone()))?;
            store.save(&to, &existing.contents)?;
            if from != to {
                store.delete(&from)?;
            }
            writeln!(out, "renamed {from} to {to}")?;
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    if let Err(error) = logging::init() {
        eprintln!("warning: {error}");
    }

    let transport: Arc<dyn EventTransport> = Arc::new(HttpEventTransport::new()?);
    let mut stdout = io::stdout().lock();
    if let Err(error) = run_app(cli, transport, &mut stdout).await {
        tracing::debug!(?error, "command failed");
        return Err(error.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chq_core::connection::StreamRequest;
    use chq_core::session::FileSessionStore;
    use chq_core::transport::{EventStream, EventTransport, ServerEvent, TransportError};
    use clap::{CommandFactory, Parser};
    use tempfile::TempDir;

    use super::{run_app, AppError, Cli};

    const ONE_ROW: &str = r#"{"columns":[{"name":"1","type":"UInt8"}],"rows":[[1]]}"#;

    #[derive(Debug)]
    struct FixedTransport {
        payload: String,
        queries: Mutex<Vec<String>>,
    }

    impl FixedTransport {
        fn new(payload: &str) -> Arc<Self> {
            Arc::new(Self {
                payload: payload.to_string(),
                queries: Mutex::new(Vec::new()),
            })
        }

        fn queries(&self) -> Vec<String> {
            self.queries.lock().expect("queries poisoned").clone()
        }
    }

    struct FixedStream(VecDeque<ServerEvent>);

    #[async_trait]
    impl EventStream for FixedStream {
        async fn next_event(&mut self) -> Result<Option<ServerEvent>, TransportError> {
            Ok(self.0.pop_front())
        }
    }

    #[async_trait]
    impl EventTransport for FixedTransport {
        async fn open(
            &self,
            request: &StreamRequest,
        ) -> Result<Box<dyn EventStream>, TransportError> {
            self.queries
                .lock()
                .expect("queries poisoned")
                .push(request.query.clone());
            Ok(Box::new(FixedStream(VecDeque::from([
                ServerEvent::new("progress", r#"{"num_rows":1,"total_rows":1}"#),
                ServerEvent::new("result", self.payload.as_str()),
            ]))))
        }
    }

    async fn run(
        dir: &TempDir,
        transport: &Arc<FixedTransport>,
        args: &[&str],
    ) -> Result<String, AppError> {
        let mut argv = vec!["chq", "--config-dir"];
        let config_dir = dir.path().to_str().expect("temp dir is utf-8");
        argv.push(config_dir);
        argv.extend_from_slice(args);
        let cli = Cli::try_parse_from(argv).expect("arguments should parse");

        let mut out = Vec::new();
        let transport: Arc<dyn EventTransport> = transport.clone();
        run_app(cli, transport, &mut out).await?;
        Ok(String::from_utf8(out).expect("output is utf-8"))
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_rejects_query_and_saved_together() {
        let parsed = Cli::try_parse_from(["chq", "run", "SELECT 1", "--saved", "daily"]);
        assert!(parsed.is_err());
    }

    #[tokio::test]
    async fn run_requires_a_connection() {
        let dir = TempDir::new().expect("temp dir");
        let transport = FixedTransport::new(ONE_ROW);

        let err = run(&dir, &transport, &["run", "SELECT 1"])
            .await
            .expect_err("run should fail");

        assert!(matches!(err, AppError::NotConnected));
        assert!(transport.queries().is_empty());
    }

    #[tokio::test]
    async fn run_prints_result_and_remembers_query() {
        let dir = TempDir::new().expect("temp dir");
        let transport = FixedTransport::new(ONE_ROW);
        run(&dir, &transport, &["connect", "http://127.0.0.1:9090", "http://127.0.0.1:8123"])
            .await
            .expect("connect should succeed");

        let output = run(&dir, &transport, &["run", "SELECT 1"])
            .await
            .expect("run should succeed");

        let printed: serde_json::Value = serde_json::from_str(&output).expect("output is json");
        assert_eq!(printed["rows"], serde_json::json!([[1]]));
        assert_eq!(transport.queries(), vec!["SELECT 1".to_string()]);

        let session = FileSessionStore::load_from_path(dir.path().join("session.toml"))
            .expect("session should load");
        assert_eq!(session.last_query(), Some("SELECT 1"));

        run(&dir, &transport, &["run"])
            .await
            .expect("rerun should succeed");
        assert_eq!(transport.queries().len(), 2);
    }

    #[tokio::test]
    async fn run_saved_uses_saved_contents() {
        let dir = TempDir::new().expect("temp dir");
        let transport = FixedTransport::new(ONE_ROW);
        run(&dir, &transport, &["connect", "http://127.0.0.1:9090", "http://127.0.0.1:8123"])
            .await
            .expect("connect should succeed");
        run(&dir, &transport, &["saved", "save", "daily", "SELECT 42"])
            .await
            .expect("save should succeed");

        run(&dir, &transport, &["run", "--saved", "daily"])
            .await
            .expect("run should succeed");

        assert_eq!(transport.queries(), vec!["SELECT 42".to_string()]);
        let err = run(&dir, &transport, &["run", "--saved", "missing"])
            .await
            .expect_err("unknown saved query");
        assert!(matches!(err, AppError::UnknownSavedQuery(name) if name == "missing"));
    }

    #[tokio::test]
    async fn server_errors_fail_the_run() {
        let dir = TempDir::new().expect("temp dir");
        let transport = FixedTransport::new(r#"{"error":{"code":60,"message":"Unknown table"}}"#);
        run(&dir, &transport, &["connect", "http://127.0.0.1:9090", "http://127.0.0.1:8123"])
            .await
            .expect("connect should succeed");

        let err = run(&dir, &transport, &["run", "SELECT * FROM nope"])
            .await
            .expect_err("run should fail");

        assert!(matches!(err, AppError::Query(error) if error.code == 60));
    }

    #[tokio::test]
    async fn saved_rename_moves_the_entry() {
        let dir = TempDir::new().expect("temp dir");
        let transport = FixedTransport::new(ONE_ROW);
        run(&dir, &transport, &["saved", "save", "a", "SELECT 1"])
            .await
            .expect("save should succeed");

        run(&dir, &transport, &["saved", "rename", "a", "b"])
            .await
            .expect("rename should succeed");

        let listed = run(&dir, &transport, &["saved", "list"])
            .await
            .expect("list should succeed");
        let listed: serde_json::Value = serde_json::from_str(&listed).expect("output is json");
        assert_eq!(
            listed,
            serde_json::json!([{"name": "b", "contents": "SELECT 1"}])
        );
    }

    #[tokio::test]
    async fn use_and_disconnect_update_the_session() {
        let dir = TempDir::new().expect("temp dir");
        let transport = FixedTransport::new(ONE_ROW);
        run(&dir, &transport, &["connect", "http://127.0.0.1:9090", "http://127.0.0.1:8123"])
            .await
            .expect("connect should succeed");
        run(&dir, &transport, &["use", "analytics"])
            .await
            .expect("use should succeed");
        run(&dir, &transport, &["disconnect"])
            .await
            .expect("disconnect should succeed");

        let session = FileSessionStore::load_from_path(dir.path().join("session.toml"))
            .expect("session should load");
        assert_eq!(session.database_name(), Some("analytics"));
        assert!(session.connection().is_none());
    }
}

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::storage::{default_config_dir, read_document, write_document, StorageError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SavedQuery {
    pub name: String,
    #[serde(default)]
    pub contents: String,
}

impl SavedQuery {
    #[must_use]
    pub fn new(name: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contents: contents.into(),
        }
    }
}

/// Durable, name-keyed storage for saved queries.
///
/// Single-user and non-transactional: every write persists the whole set,
/// and concurrent writers from other processes are not coordinated.
pub trait SavedQueryStore: Debug + Send + Sync {
    fn list(&self) -> Result<Vec<SavedQuery>, StorageError>;

    /// Inserts or overwrites the query stored under `name`.
    fn save(&self, name: &str, contents: &str) -> Result<(), StorageError>;

    /// Returns whether a query was removed.
    fn delete(&self, name: &str) -> Result<bool, StorageError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SavedQueriesDocument {
    #[serde(default)]
    queries: Vec<SavedQuery>,
}

impl SavedQueriesDocument {
    fn normalize(&mut self) {
        let mut by_name = BTreeMap::new();
        for query in self.queries.drain(..) {
            by_name.insert(query.name.clone(), query);
        }
        self.queries = by_name.into_values().collect();
    }
}

fn upsert(queries: &mut Vec<SavedQuery>, name: &str, contents: &str) {
    if let Some(existing) = queries.iter_mut().find(|existing| existing.name == name) {
        contents.clone_into(&mut existing.contents);
    } else {
        queries.push(SavedQuery::new(name, contents));
        queries.sort_unstable_by(|a, b| a.name.cmp(&b.name));
    }
}

fn remove(queries: &mut Vec<SavedQuery>, name: &str) -> bool {
    let original_len = queries.len();
    queries.retain(|query| query.name != name);
    queries.len() != original_len
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// TOML-file backed store; each mutation is written through immediately.
#[derive(Debug)]
pub struct FileSavedQueryStore {
    path: PathBuf,
    queries: Mutex<Vec<SavedQuery>>,
}

impl FileSavedQueryStore {
    pub fn load_default() -> Result<Self, StorageError> {
        Self::load_from_path(default_saved_queries_path()?)
    }

    pub fn load_from_path(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let mut doc: SavedQueriesDocument = read_document(&path)?;
        doc.normalize();

        Ok(Self {
            path,
            queries: Mutex::new(doc.queries),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, queries: &[SavedQuery]) -> Result<(), StorageError> {
        let doc = SavedQueriesDocument {
            queries: queries.to_vec(),
        };
        write_document(&self.path, &doc, false)
    }
}

impl SavedQueryStore for FileSavedQueryStore {
    fn list(&self) -> Result<Vec<SavedQuery>, StorageError> {
        Ok(lock(&self.queries).clone())
    }

    fn save(&self, name: &str, contents: &str) -> Result<(), StorageError> {
        let mut queries = lock(&self.queries);
        let mut next = queries.clone();
        upsert(&mut next, name, contents);
        self.persist(&next)?;
        *queries = next;
        tracing::debug!(name, "saved query");
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<bool, StorageError> {
        let mut queries = lock(&self.queries);
        let mut next = queries.clone();
        if !remove(&mut next, name) {
            return Ok(false);
        }
        self.persist(&next)?;
        *queries = next;
        tracing::debug!(name, "deleted saved query");
        Ok(true)
    }
}

/// Process-local store, used when no durable location is wanted.
#[derive(Debug, Default)]
pub struct MemorySavedQueryStore {
    queries: Mutex<Vec<SavedQuery>>,
}

impl MemorySavedQueryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SavedQueryStore for MemorySavedQueryStore {
    fn list(&self) -> Result<Vec<SavedQuery>, StorageError> {
        Ok(lock(&self.queries).clone())
    }

    fn save(&self, name: &str, contents: &str) -> Result<(), StorageError> {
        upsert(&mut lock(&self.queries), name, contents);
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<bool, StorageError> {
        Ok(remove(&mut lock(&self.queries), name))
    }
}

pub fn default_saved_queries_path() -> Result<PathBuf, StorageError> {
    Ok(default_config_dir()?.join("saved_queries.toml"))
}

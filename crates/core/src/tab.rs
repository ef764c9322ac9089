use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::client::QueryClient;
use crate::protocol::{QueryProgress, QueryResult};
use crate::query_execution::ExecutionError;
use crate::reactive_store::{NameReservation, ReactiveStore, StorePatch, StoreState};
use crate::saved_queries::SavedQuery;
use crate::storage::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TabId(u64);

impl TabId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum TabError {
    #[error("tab is no longer open")]
    Closed,
    #[error("a tab named `{0}` is already open")]
    NameTaken(String),
    #[error("a saved query named `{0}` already exists")]
    NameSaved(String),
    #[error("tab name cannot be empty")]
    EmptyName,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Committed state of one query tab. Values are never mutated in place;
/// [`Tab::with`] derives the next value.
#[derive(Debug, Clone, PartialEq)]
pub struct Tab {
    id: TabId,
    pub name: String,
    pub saved: bool,
    pub dirty: bool,
    pub query_contents: String,
    pub query_progress: Option<QueryProgress>,
    pub query_result: Option<Arc<QueryResult>>,
}

impl Tab {
    fn new(id: TabId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            saved: false,
            dirty: false,
            query_contents: String::new(),
            query_progress: None,
            query_result: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> TabId {
        self.id
    }

    #[must_use]
    pub fn query_executing(&self) -> bool {
        self.query_progress.is_some()
    }

    #[must_use]
    pub fn with(&self, update: &TabUpdate) -> Self {
        let mut next = self.clone();
        if let Some(name) = &update.name {
            next.name.clone_from(name);
        }
        if let Some(saved) = update.saved {
            next.saved = saved;
        }
        if let Some(dirty) = update.dirty {
            next.dirty = dirty;
        }
        if let Some(contents) = &update.query_contents {
            next.query_contents.clone_from(contents);
        }
        if let Some(progress) = update.query_progress {
            next.query_progress = progress;
        }
        if let Some(result) = &update.query_result {
            next.query_result.clone_from(result);
        }
        next
    }
}

/// Partial set of tab fields; unset fields keep their committed value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TabUpdate {
    name: Option<String>,
    saved: Option<bool>,
    dirty: Option<bool>,
    query_contents: Option<String>,
    query_progress: Option<Option<QueryProgress>>,
    query_result: Option<Option<Arc<QueryResult>>>,
}

impl TabUpdate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn saved(mut self, saved: bool) -> Self {
        self.saved = Some(saved);
        self
    }

    #[must_use]
    pub fn dirty(mut self, dirty: bool) -> Self {
        self.dirty = Some(dirty);
        self
    }

    #[must_use]
    pub fn query_contents(mut self, contents: impl Into<String>) -> Self {
        self.query_contents = Some(contents.into());
        self
    }

    #[must_use]
    pub fn query_progress(mut self, progress: Option<QueryProgress>) -> Self {
        self.query_progress = Some(progress);
        self
    }

    #[must_use]
    pub fn query_result(mut self, result: Option<Arc<QueryResult>>) -> Self {
        self.query_result = Some(result);
        self
    }
}

/// Open tabs indexed by id and by name. Names are unique across the table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TabTable {
    by_id: BTreeMap<TabId, Arc<Tab>>,
    by_name: BTreeMap<String, TabId>,
}

impl TabTable {
    #[must_use]
    pub fn get(&self, id: TabId) -> Option<&Arc<Tab>> {
        self.by_id.get(&id)
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Arc<Tab>> {
        self.by_name.get(name).and_then(|id| self.by_id.get(id))
    }

    /// Tabs in the order they were opened.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Tab>> {
        self.by_id.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn insert(&mut self, tab: Tab) -> Result<(), TabError> {
        if self.by_name.contains_key(&tab.name) {
            return Err(TabError::NameTaken(tab.name));
        }
        self.by_name.insert(tab.name.clone(), tab.id);
        self.by_id.insert(tab.id, Arc::new(tab));
        Ok(())
    }

    /// Repoints the slot for `tab.id()` and re-keys the name index.
    pub fn replace(&mut self, tab: Tab) -> Result<(), TabError> {
        let previous_name = match self.by_id.get(&tab.id) {
            Some(previous) => previous.name.clone(),
            None => return Err(TabError::Closed),
        };
        if previous_name != tab.name {
            if self.by_name.contains_key(&tab.name) {
                return Err(TabError::NameTaken(tab.name));
            }
            self.by_name.remove(&previous_name);
            self.by_name.insert(tab.name.clone(), tab.id);
        }
        self.by_id.insert(tab.id, Arc::new(tab));
        Ok(())
    }

    pub fn remove(&mut self, id: TabId) -> Option<Arc<Tab>> {
        let removed = self.by_id.remove(&id)?;
        self.by_name.remove(&removed.name);
        Some(removed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyExecuting,
    NoClient,
    NoDatabase,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteOutcome {
    Skipped(SkipReason),
    Completed(Arc<QueryResult>),
}

/// Stable reference to a tab committed in a [`ReactiveStore`].
///
/// Reads always go through the store, so a handle never observes a stale
/// value.
#[derive(Debug, Clone)]
pub struct TabHandle {
    id: TabId,
    store: ReactiveStore,
}

impl TabHandle {
    /// Opens an empty tab. Names held by an open tab or a saved query are
    /// refused.
    pub fn open_blank(
        store: &ReactiveStore,
        client: &QueryClient,
        name: &str,
    ) -> Result<Self, TabError> {
        validate_name(name)?;
        if has_saved_query(client, name)? {
            return Err(TabError::NameSaved(name.to_string()));
        }
        let reservation = claim_name(store, None, name)?;
        let tab = Tab::new(store.next_tab_id(), name);
        Ok(Self::register(store, reservation, tab))
    }

    /// Opens an unsaved tab under the first `Query N` name that neither an
    /// open tab nor a saved query uses.
    pub fn open_new(store: &ReactiveStore, client: &QueryClient) -> Result<Self, TabError> {
        let saved = client.saved_queries()?;
        let mut index = 0_u64;
        loop {
            index += 1;
            let name = format!("Query {index}");
            if saved.iter().any(|query| query.name == name) {
                continue;
            }
            match claim_name(store, None, &name) {
                Ok(reservation) => {
                    let tab = Tab::new(store.next_tab_id(), name);
                    return Ok(Self::register(store, reservation, tab));
                }
                Err(TabError::NameTaken(_)) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Returns the already open tab when one carries the saved query's name.
    pub fn open_saved(store: &ReactiveStore, saved: &SavedQuery) -> Result<Self, TabError> {
        validate_name(&saved.name)?;
        if let Some(existing) = store.get().tabs().find(&saved.name) {
            return Ok(Self {
                id: existing.id(),
                store: store.clone(),
            });
        }
        let reservation = claim_name(store, None, &saved.name)?;
        let mut tab = Tab::new(store.next_tab_id(), saved.name.as_str());
        tab.saved = true;
        tab.query_contents.clone_from(&saved.contents);
        Ok(Self::register(store, reservation, tab))
    }

    /// Opens a tab for every persisted saved query.
    pub fn restore_saved(
        store: &ReactiveStore,
        client: &QueryClient,
    ) -> Result<Vec<Self>, TabError> {
        client
            .saved_queries()?
            .iter()
            .map(|saved| Self::open_saved(store, saved))
            .collect()
    }

    #[must_use]
    pub fn by_name(store: &ReactiveStore, name: &str) -> Option<Self> {
        store.get().tabs().find(name).map(|tab| Self {
            id: tab.id(),
            store: store.clone(),
        })
    }

    #[must_use]
    pub fn current(store: &ReactiveStore) -> Option<Self> {
        store.get().current().map(|tab| Self {
            id: tab.id(),
            store: store.clone(),
        })
    }

    fn register(store: &ReactiveStore, reservation: Option<NameReservation>, tab: Tab) -> Self {
        let id = tab.id();
        store.update_reserved(reservation, move |state| {
            let mut tabs = state.tabs().clone();
            match tabs.insert(tab) {
                Ok(()) => Some(StorePatch::new().tabs(tabs)),
                Err(err) => {
                    tracing::warn!(tab = %id, error = %err, "dropped tab open");
                    None
                }
            }
        });
        tracing::debug!(tab = %id, "opened tab");
        Self {
            id,
            store: store.clone(),
        }
    }

    #[must_use]
    pub fn id(&self) -> TabId {
        self.id
    }

    /// Latest committed value.
    pub fn get(&self) -> Result<Arc<Tab>, TabError> {
        self.store
            .get()
            .tabs()
            .get(self.id)
            .cloned()
            .ok_or(TabError::Closed)
    }

    pub fn select(&self) -> Result<(), TabError> {
        self.get()?;
        self.store.set(StorePatch::new().current_tab(Some(self.id)));
        Ok(())
    }

    /// Merges `update` into whatever value is committed when the store
    /// applies it.
    pub fn update(&self, update: TabUpdate) -> Result<(), TabError> {
        self.get()?;
        let reservation = match &update.name {
            Some(name) => claim_name(&self.store, Some(self.id), name)?,
            None => None,
        };
        self.queue(reservation, update);
        Ok(())
    }

    /// Commits `tab` into this handle's slot.
    pub fn replace(&self, tab: Tab) -> Result<(), TabError> {
        self.get()?;
        let reservation = claim_name(&self.store, Some(self.id), &tab.name)?;
        let tab = Tab { id: self.id, ..tab };
        self.store.update_reserved(reservation, move |state| replace_patch(state, tab));
        Ok(())
    }

    /// Runs the tab's query, committing progress and the terminal result.
    ///
    /// Skips without side effects when the tab is already executing or when
    /// there is no client or database to run against. A rejection only
    /// clears progress; the previous result stays visible.
    pub async fn execute(
        &self,
        client: Option<&QueryClient>,
        database_name: &str,
    ) -> Result<ExecuteOutcome, ExecutionError> {
        let Ok(tab) = self.get() else {
            return Ok(ExecuteOutcome::Skipped(SkipReason::Closed));
        };
        if tab.query_executing() {
            return Ok(ExecuteOutcome::Skipped(SkipReason::AlreadyExecuting));
        }
        let Some(client) = client else {
            return Ok(ExecuteOutcome::Skipped(SkipReason::NoClient));
        };
        if database_name.is_empty() {
            return Ok(ExecuteOutcome::Skipped(SkipReason::NoDatabase));
        }

        self.commit(TabUpdate::new().query_progress(Some(QueryProgress::default())));
        tracing::debug!(
            tab = %self.id,
            database = database_name,
            query_len = tab.query_contents.len(),
            "executing tab query"
        );

        let progress_tab = self.clone();
        let execution = client.execute_query(
            &tab.query_contents,
            database_name,
            Some(Box::new(move |progress: QueryProgress| {
                progress_tab.commit(TabUpdate::new().query_progress(Some(progress)));
            })),
        );

        match execution.get().await {
            Ok(result) => {
                self.commit(
                    TabUpdate::new()
                        .query_progress(None)
                        .query_result(Some(Arc::clone(&result))),
                );
                Ok(ExecuteOutcome::Completed(result))
            }
            Err(err) => {
                self.commit(TabUpdate::new().query_progress(None));
                tracing::debug!(tab = %self.id, error = %err, "tab query failed");
                Err(err)
            }
        }
    }

    /// Persists the contents under `name`, defaulting to the tab's own name.
    ///
    /// Saving under another name renames the tab and refuses names that
    /// already have a saved query.
    pub fn save(&self, client: &QueryClient, name: Option<&str>) -> Result<(), TabError> {
        let tab = self.get()?;
        let target = name.unwrap_or(&tab.name);
        let reservation = claim_name(&self.store, Some(self.id), target)?;
        let mut update = TabUpdate::new().saved(true).dirty(false);
        if target != tab.name {
            if has_saved_query(client, target)? {
                return Err(TabError::NameSaved(target.to_string()));
            }
            update = update.name(target);
        }

        client.save_saved_query(target, &tab.query_contents)?;
        self.queue(reservation, update);
        Ok(())
    }

    /// Closes the tab, removing its saved query when it has one.
    pub fn delete(&self, client: &QueryClient) -> Result<(), TabError> {
        let tab = self.get()?;
        if tab.saved {
            client.delete_saved_query(&tab.name)?;
        }

        let id = self.id;
        self.store.update(move |state| {
            let mut tabs = state.tabs().clone();
            tabs.remove(id)?;
            let mut patch = StorePatch::new().tabs(tabs);
            if state.current_tab() == Some(id) {
                patch = patch.current_tab(None);
            }
            Some(patch)
        });
        tracing::debug!(tab = %id, "closed tab");
        Ok(())
    }

    pub fn set_contents(&self, contents: &str) -> Result<(), TabError> {
        self.update(TabUpdate::new().query_contents(contents).dirty(true))
    }

    /// Persists under `new_name`, then drops the old persisted entry. When the
    /// old entry cannot be dropped, the new one is removed again and the tab
    /// keeps its old name.
    pub fn set_name(&self, client: &QueryClient, new_name: &str) -> Result<(), TabError> {
        let tab = self.get()?;
        let reservation = claim_name(&self.store, Some(self.id), new_name)?;
        let renamed = tab.name != new_name;
        if renamed && has_saved_query(client, new_name)? {
            return Err(TabError::NameSaved(new_name.to_string()));
        }

        client.save_saved_query(new_name, &tab.query_contents)?;
        if renamed {
            if let Err(err) = client.delete_saved_query(&tab.name) {
                if let Err(undo) = client.delete_saved_query(new_name) {
                    tracing::warn!(
                        tab = %self.id,
                        name = new_name,
                        error = %undo,
                        "left saved query behind after failed rename"
                    );
                }
                return Err(err.into());
            }
        }
        self.queue(reservation, TabUpdate::new().name(new_name).saved(true).dirty(false));
        Ok(())
    }

    fn queue(&self, reservation: Option<NameReservation>, update: TabUpdate) {
        let id = self.id;
        self.store.update_reserved(reservation, move |state| {
            let current = state.tabs().get(id)?;
            replace_patch(state, current.with(&update))
        });
    }

    fn commit(&self, update: TabUpdate) {
        if let Err(err) = self.update(update) {
            tracing::debug!(tab = %self.id, error = %err, "skipped tab commit");
        }
    }
}

fn validate_name(name: &str) -> Result<(), TabError> {
    if name.trim().is_empty() {
        return Err(TabError::EmptyName);
    }
    Ok(())
}

fn has_saved_query(client: &QueryClient, name: &str) -> Result<bool, TabError> {
    Ok(client
        .saved_queries()?
        .iter()
        .any(|saved| saved.name == name))
}

/// Validates `name` for the tab `owner` (or a new tab) and reserves it until
/// the commit that uses it is applied. Returns `None` when `owner` already
/// carries the name.
fn claim_name(
    store: &ReactiveStore,
    owner: Option<TabId>,
    name: &str,
) -> Result<Option<NameReservation>, TabError> {
    validate_name(name)?;
    let taken = || TabError::NameTaken(name.to_string());
    match store.get().tabs().find(name) {
        Some(tab) if Some(tab.id()) == owner => return Ok(None),
        Some(_) => return Err(taken()),
        None => {}
    }
    let reservation = store.reserve_tab_name(name).ok_or_else(taken)?;
    if store.get().tabs().find(name).is_some() {
        return Err(taken());
    }
    Ok(Some(reservation))
}

/// One store patch that swaps the tab in, touching `current_tab` as well when
/// the tab is the current one.
fn replace_patch(state: &StoreState, tab: Tab) -> Option<StorePatch> {
    let id = tab.id();
    let mut tabs = state.tabs().clone();
    if let Err(err) = tabs.replace(tab) {
        tracing::warn!(tab = %id, error = %err, "dropped tab commit");
        return None;
    }
    let mut patch = StorePatch::new().tabs(tabs);
    if state.current_tab() == Some(id) {
        patch = patch.current_tab(Some(id));
    }
    Some(patch)
}

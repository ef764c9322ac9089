use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::client::QueryClient;
use crate::tab::{Tab, TabId, TabTable};

pub const DEFAULT_DATABASE: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreField {
    Tabs,
    CurrentTab,
    Client,
    DatabaseName,
    TableName,
}

/// Immutable snapshot of application state.
#[derive(Debug, Clone)]
pub struct StoreState {
    tabs: TabTable,
    current_tab: Option<TabId>,
    client: Option<Arc<QueryClient>>,
    database_name: String,
    table_name: Option<String>,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            tabs: TabTable::default(),
            current_tab: None,
            client: None,
            database_name: DEFAULT_DATABASE.to_string(),
            table_name: None,
        }
    }
}

impl StoreState {
    #[must_use]
    pub fn tabs(&self) -> &TabTable {
        &self.tabs
    }

    #[must_use]
    pub fn current_tab(&self) -> Option<TabId> {
        self.current_tab
    }

    /// Committed value of the current tab.
    #[must_use]
    pub fn current(&self) -> Option<&Arc<Tab>> {
        self.current_tab.and_then(|id| self.tabs.get(id))
    }

    #[must_use]
    pub fn client(&self) -> Option<&Arc<QueryClient>> {
        self.client.as_ref()
    }

    #[must_use]
    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    #[must_use]
    pub fn table_name(&self) -> Option<&str> {
        self.table_name.as_deref()
    }

    fn apply(&mut self, patch: StorePatch) {
        if let Some(tabs) = patch.tabs {
            self.tabs = tabs;
        }
        if let Some(current_tab) = patch.current_tab {
            self.current_tab = current_tab;
        }
        if let Some(client) = patch.client {
            self.client = client;
        }
        if let Some(database_name) = patch.database_name {
            self.database_name = database_name;
        }
        if let Some(table_name) = patch.table_name {
            self.table_name = table_name;
        }
    }
}

/// Shallow set of store fields. Every field present in the patch counts as
/// changed, even when the new value equals the old one.
#[derive(Debug, Clone, Default)]
pub struct StorePatch {
    tabs: Option<TabTable>,
    current_tab: Option<Option<TabId>>,
    client: Option<Option<Arc<QueryClient>>>,
    database_name: Option<String>,
    table_name: Option<Option<String>>,
}

impl StorePatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn tabs(mut self, tabs: TabTable) -> Self {
        self.tabs = Some(tabs);
        self
    }

    #[must_use]
    pub fn current_tab(mut self, current_tab: Option<TabId>) -> Self {
        self.current_tab = Some(current_tab);
        self
    }

    #[must_use]
    pub fn client(mut self, client: Option<Arc<QueryClient>>) -> Self {
        self.client = Some(client);
        self
    }

    #[must_use]
    pub fn database_name(mut self, database_name: impl Into<String>) -> Self {
        self.database_name = Some(database_name.into());
        self
    }

    #[must_use]
    pub fn table_name(mut self, table_name: Option<String>) -> Self {
        self.table_name = Some(table_name);
        self
    }

    #[must_use]
    pub fn fields(&self) -> Vec<StoreField> {
        let mut fields = Vec::new();
        if self.tabs.is_some() {
            fields.push(StoreField::Tabs);
        }
        if self.current_tab.is_some() {
            fields.push(StoreField::CurrentTab);
        }
        if self.client.is_some() {
            fields.push(StoreField::Client);
        }
        if self.database_name.is_some() {
            fields.push(StoreField::DatabaseName);
        }
        if self.table_name.is_some() {
            fields.push(StoreField::TableName);
        }
        fields
    }
}

pub trait StoreObserver: Send + Sync {
    /// Called after a commit that touched at least one watched field.
    fn state_changed(&self, state: &Arc<StoreState>, changed: &[StoreField]);
}

impl<F> StoreObserver for F
where
    F: Fn(&Arc<StoreState>, &[StoreField]) + Send + Sync,
{
    fn state_changed(&self, state: &Arc<StoreState>, changed: &[StoreField]) {
        self(state, changed);
    }
}

/// Observer that keeps the latest snapshot and counts the commits it saw.
pub struct StateMirror {
    snapshot: Mutex<Arc<StoreState>>,
    revision: AtomicU64,
}

impl StateMirror {
    #[must_use]
    pub fn new(initial: Arc<StoreState>) -> Self {
        Self {
            snapshot: Mutex::new(initial),
            revision: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<StoreState> {
        Arc::clone(&lock(&self.snapshot))
    }

    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }
}

impl StoreObserver for StateMirror {
    fn state_changed(&self, state: &Arc<StoreState>, _changed: &[StoreField]) {
        *lock(&self.snapshot) = Arc::clone(state);
        self.revision.fetch_add(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for StateMirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMirror")
            .field("revision", &self.revision())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type UpdateFn = Box<dyn FnOnce(&StoreState) -> Option<StorePatch> + Send>;

struct PendingUpdate {
    apply: UpdateFn,
    reservation: Option<NameReservation>,
}

/// Claim on a tab name, held from validation until the commit that uses it
/// has been applied.
#[derive(Debug)]
pub(crate) struct NameReservation {
    names: Arc<Mutex<BTreeSet<String>>>,
    name: String,
}

impl Drop for NameReservation {
    fn drop(&mut self) {
        lock(&self.names).remove(&self.name);
    }
}

struct Subscriber {
    id: SubscriptionId,
    fields: Vec<StoreField>,
    observer: Arc<dyn StoreObserver>,
}

impl Subscriber {
    fn watches(&self, changed: &[StoreField]) -> bool {
        self.fields.iter().any(|field| changed.contains(field))
    }
}

struct Inner {
    state: Mutex<Arc<StoreState>>,
    subscribers: Mutex<Vec<Subscriber>>,
    pending: Mutex<VecDeque<PendingUpdate>>,
    dispatching: AtomicBool,
    next_subscription: AtomicU64,
    next_tab_id: AtomicU64,
    reserved_names: Arc<Mutex<BTreeSet<String>>>,
}

struct DispatchGuard<'a>(&'a AtomicBool);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-wide observable state.
///
/// Commits are applied one at a time. Subscribers are notified
/// synchronously, in registration order, after each commit. A `set` or
/// `update` issued while a commit is being dispatched (from an observer, or
/// from another thread) is queued and applied after the current one.
#[derive(Clone)]
pub struct ReactiveStore {
    inner: Arc<Inner>,
}

impl Default for ReactiveStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReactiveStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(Arc::new(StoreState::default())),
                subscribers: Mutex::new(Vec::new()),
                pending: Mutex::new(VecDeque::new()),
                dispatching: AtomicBool::new(false),
                next_subscription: AtomicU64::new(1),
                next_tab_id: AtomicU64::new(1),
                reserved_names: Arc::new(Mutex::new(BTreeSet::new())),
            }),
        }
    }

    /// Resets the state to its defaults overlaid with `fields`, without
    /// notifying anyone. Meant for process start, before any subscription.
    pub fn initialize(&self, fields: StorePatch) {
        let mut state = StoreState::default();
        state.apply(fields);
        *lock(&self.inner.state) = Arc::new(state);
        tracing::debug!("initialized store");
    }

    #[must_use]
    pub fn get(&self) -> Arc<StoreState> {
        Arc::clone(&lock(&self.inner.state))
    }

    pub fn set(&self, patch: StorePatch) {
        self.update(move |_| Some(patch));
    }

    /// Commits the patch computed from the state current at apply time.
    /// Returning `None` skips the commit.
    pub fn update<F>(&self, update: F)
    where
        F: FnOnce(&StoreState) -> Option<StorePatch> + Send + 'static,
    {
        self.update_reserved(None, update);
    }

    /// Like [`ReactiveStore::update`], releasing `reservation` once the
    /// commit has been applied or skipped.
    pub(crate) fn update_reserved<F>(&self, reservation: Option<NameReservation>, update: F)
    where
        F: FnOnce(&StoreState) -> Option<StorePatch> + Send + 'static,
    {
        lock(&self.inner.pending).push_back(PendingUpdate {
            apply: Box::new(update),
            reservation,
        });
        self.dispatch();
    }

    pub fn connect_component_state(
        &self,
        observer: Arc<dyn StoreObserver>,
        fields: &[StoreField],
    ) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        lock(&self.inner.subscribers).push(Subscriber {
            id,
            fields: fields.to_vec(),
            observer,
        });
        id
    }

    /// Returns whether the subscription existed.
    pub fn disconnect(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.inner.subscribers);
        let original_len = subscribers.len();
        subscribers.retain(|subscriber| subscriber.id != id);
        subscribers.len() != original_len
    }

    /// Subscribes a [`StateMirror`] seeded with the current snapshot.
    pub fn mirror(&self, fields: &[StoreField]) -> (Arc<StateMirror>, SubscriptionId) {
        let mirror = Arc::new(StateMirror::new(self.get()));
        let observer: Arc<dyn StoreObserver> = mirror.clone();
        let id = self.connect_component_state(observer, fields);
        (mirror, id)
    }

    pub(crate) fn next_tab_id(&self) -> TabId {
        TabId::new(self.inner.next_tab_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns `None` while another pending commit holds `name`.
    pub(crate) fn reserve_tab_name(&self, name: &str) -> Option<NameReservation> {
        if !lock(&self.inner.reserved_names).insert(name.to_string()) {
            return None;
        }
        Some(NameReservation {
            names: Arc::clone(&self.inner.reserved_names),
            name: name.to_string(),
        })
    }

    fn dispatch(&self) {
        loop {
            if self.inner.dispatching.swap(true, Ordering::AcqRel) {
                tracing::trace!("deferred store update behind active dispatch");
                return;
            }
            {
                let _guard = DispatchGuard(&self.inner.dispatching);
                self.drain();
            }
            // An update queued between the last drain and the guard release
            // would otherwise wait for the next commit.
            if lock(&self.inner.pending).is_empty() {
                return;
            }
        }
    }

    fn drain(&self) {
        loop {
            let Some(PendingUpdate { apply, reservation }) = lock(&self.inner.pending).pop_front()
            else {
                return;
            };
            let Some(patch) = apply(self.get().as_ref()) else {
                continue;
            };
            let changed = patch.fields();
            if changed.is_empty() {
                continue;
            }

            let snapshot = {
                let mut state = lock(&self.inner.state);
                let mut next = StoreState::clone(&state);
                next.apply(patch);
                *state = Arc::new(next);
                Arc::clone(&state)
            };
            drop(reservation);

            let observers: Vec<Arc<dyn StoreObserver>> = lock(&self.inner.subscribers)
                .iter()
                .filter(|subscriber| subscriber.watches(&changed))
                .map(|subscriber| Arc::clone(&subscriber.observer))
                .collect();
            for observer in observers {
                let notified = panic::catch_unwind(AssertUnwindSafe(|| {
                    observer.state_changed(&snapshot, &changed);
                }));
                if notified.is_err() {
                    tracing::warn!(fields = ?changed, "store observer panicked");
                }
            }
        }
    }
}

impl fmt::Debug for ReactiveStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveStore")
            .field("subscribers", &lock(&self.inner.subscribers).len())
            .field("dispatching", &self.inner.dispatching.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

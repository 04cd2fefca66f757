//! Cache of server-computed, denormalized read models.
//!
//! Entries are keyed by `(slot, parent)`; the slot is the logical screen the
//! view feeds ("folders", "notebook-notes", ...). Only one request per slot
//! is live at a time: a load for a different key in the same slot aborts the
//! older one, and identical loads share a single fetch. The cache is never
//! authoritative for mutation.

use crate::model::{Entity, EntityId};
use futures::future::{AbortHandle, Abortable, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

#[cfg(test)]
mod tests;

/// Well-known view slots served by the backend.
pub mod slots {
    /// Every accessible collection with notebook and note counts.
    pub const FOLDERS: &str = "folders";
    /// Groups of one collection (parent = collection id) with note counts.
    pub const FOLDER_NOTEBOOKS: &str = "folder-notebooks";
    /// Searchable, sortable, paginated items of one group (parent = group id).
    pub const NOTEBOOK_NOTES: &str = "notebook-notes";
    /// One item (parent = item id).
    pub const NOTE: &str = "note";
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Recent,
    Oldest,
    Title,
    Manual,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Recent => "recent",
            SortOrder::Oldest => "oldest",
            SortOrder::Title => "title",
            SortOrder::Manual => "manual",
        }
    }
}

/// Parameters that change what a view contains. A change here replaces the
/// cached rows wholesale.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortOrder>,
    #[serde(default)]
    pub include_archived: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub offset: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewKey {
    pub slot: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(flatten)]
    pub query: ViewQuery,
    #[serde(flatten)]
    pub page: Page,
}

impl ViewKey {
    pub fn new(slot: impl Into<String>) -> Self {
        Self {
            slot: slot.into(),
            parent: None,
            query: ViewQuery::default(),
            page: Page::default(),
        }
    }

    pub fn with_parent(mut self, parent: impl ToString) -> Self {
        self.parent = Some(parent.to_string());
        self
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        let search = search.into();
        self.query.search = if search.trim().is_empty() { None } else { Some(search) };
        self
    }

    pub fn with_sort(mut self, sort: SortOrder) -> Self {
        self.query.sort = Some(sort);
        self
    }

    pub fn including_archived(mut self) -> Self {
        self.query.include_archived = true;
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.page = Page {
            offset,
            limit: Some(limit),
        };
        self
    }

    /// `slot` or `slot/parent`; the string invalidation prefixes match on.
    pub fn path(&self) -> String {
        path_of(&self.slot, self.parent.as_deref())
    }

    fn entry_key(&self) -> EntryKey {
        (self.slot.clone(), self.parent.clone())
    }

    pub fn params(&self) -> ViewParams {
        ViewParams {
            parent: self.parent.clone(),
            search: self.query.search.clone(),
            sort: self.query.sort,
            include_archived: self.query.include_archived,
            offset: self.page.offset,
            limit: self.page.limit,
        }
    }

    pub fn from_params(slot: impl Into<String>, params: ViewParams) -> Self {
        Self {
            slot: slot.into(),
            parent: params.parent,
            query: ViewQuery {
                search: params.search.filter(|s| !s.trim().is_empty()),
                sort: params.sort,
                include_archived: params.include_archived,
            },
            page: Page {
                offset: params.offset,
                limit: params.limit,
            },
        }
    }
}

/// Query-string form of a [`ViewKey`] minus the slot, which travels in the
/// path.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortOrder>,
    #[serde(default)]
    pub include_archived: bool,
    #[serde(default)]
    pub offset: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

fn path_of(slot: &str, parent: Option<&str>) -> String {
    match parent {
        Some(parent) => format!("{slot}/{parent}"),
        None => slot.to_string(),
    }
}

fn prefix_matches(path: &str, prefix: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/') || prefix.ends_with('/'))
}

/// One page of rows as returned by the backend.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewPage {
    pub rows: Vec<serde_json::Value>,
    /// Row count of the whole view, across pages.
    pub total: usize,
}

/// Cached rows of a view as handed to the UI.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSnapshot {
    pub path: String,
    pub query: ViewQuery,
    pub rows: Vec<serde_json::Value>,
    pub total: usize,
    pub stale: bool,
}

impl ViewSnapshot {
    pub fn has_more(&self) -> bool {
        self.rows.len() < self.total
    }

    pub fn rows_as<T: DeserializeOwned>(&self) -> anyhow::Result<Vec<T>> {
        self.rows
            .iter()
            .map(|row| serde_json::from_value(row.clone()).map_err(anyhow::Error::from))
            .collect()
    }
}

/// Result of [`ViewCache::load`].
#[derive(Clone, Debug, PartialEq)]
pub enum ViewLoad {
    Ready(ViewSnapshot),
    /// Expired copy; a refresh is running in the background.
    Stale(ViewSnapshot),
    /// A newer load for the same slot replaced this one. Not an error.
    Superseded,
}

impl ViewLoad {
    pub fn snapshot(&self) -> Option<&ViewSnapshot> {
        match self {
            ViewLoad::Ready(s) | ViewLoad::Stale(s) => Some(s),
            ViewLoad::Superseded => None,
        }
    }

    pub fn into_snapshot(self) -> Option<ViewSnapshot> {
        match self {
            ViewLoad::Ready(s) | ViewLoad::Stale(s) => Some(s),
            ViewLoad::Superseded => None,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ViewError {
    #[error("VIEW_FETCH: {0}")]
    Fetch(Arc<anyhow::Error>),
}

#[derive(Clone, Debug)]
enum LoadFailure {
    Superseded,
    Fetch(Arc<anyhow::Error>),
}

type EntryKey = (String, Option<String>);
type SharedLoad = Shared<BoxFuture<'static, Result<ViewSnapshot, LoadFailure>>>;

struct CachedView {
    query: ViewQuery,
    rows: Vec<serde_json::Value>,
    total: usize,
    fetched_at: Instant,
}

impl CachedView {
    fn covers(&self, key: &ViewKey) -> bool {
        if self.query != key.query {
            return false;
        }
        if self.rows.len() >= self.total {
            return true;
        }
        match key.page.limit {
            Some(limit) => key.page.offset + limit <= self.rows.len(),
            None => false,
        }
    }

    fn snapshot(&self, path: String, stale: bool) -> ViewSnapshot {
        ViewSnapshot {
            path,
            query: self.query.clone(),
            rows: self.rows.clone(),
            total: self.total,
            stale,
        }
    }
}

struct InFlight {
    key: ViewKey,
    generation: u64,
    future: SharedLoad,
    abort: AbortHandle,
    invalidated: bool,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<EntryKey, CachedView>,
    slots: HashMap<String, InFlight>,
    generation: u64,
}

impl CacheInner {
    /// Abort the slot's in-flight load if it is for a different key.
    fn supersede(&mut self, key: &ViewKey) {
        if self.slots.get(&key.slot).is_some_and(|flight| flight.key != *key) {
            if let Some(flight) = self.slots.remove(&key.slot) {
                debug!(old = %flight.key.path(), new = %key.path(), "superseding in-flight view");
                flight.abort.abort();
            }
        }
    }

    fn is_current(&self, slot: &str, generation: u64) -> bool {
        self.slots.get(slot).is_some_and(|f| f.generation == generation)
    }

    fn finish(&mut self, slot: &str, generation: u64) {
        if self.is_current(slot, generation) {
            self.slots.remove(slot);
        }
    }

    fn commit(&mut self, key: &ViewKey, generation: u64, page: ViewPage) -> Result<ViewSnapshot, LoadFailure> {
        if !self.is_current(&key.slot, generation) {
            debug!(path = %key.path(), "discarding superseded view response");
            return Err(LoadFailure::Superseded);
        }
        let invalidated = self
            .slots
            .remove(&key.slot)
            .is_some_and(|flight| flight.invalidated);
        if invalidated {
            return Ok(ViewSnapshot {
                path: key.path(),
                query: key.query.clone(),
                rows: page.rows,
                total: page.total,
                stale: true,
            });
        }
        let entry_key = key.entry_key();
        if key.page.offset > 0 {
            let contiguous = self.entries.get(&entry_key).is_some_and(|entry| {
                entry.query == key.query && key.page.offset <= entry.rows.len()
            });
            // A later page with nothing before it cannot stand in for the view.
            if !contiguous {
                debug!(path = %key.path(), offset = key.page.offset, "detached page not cached");
                return Ok(ViewSnapshot {
                    path: key.path(),
                    query: key.query.clone(),
                    rows: page.rows,
                    total: page.total,
                    stale: false,
                });
            }
        }
        if key.page.offset > 0 {
            if let Some(entry) = self.entries.get_mut(&entry_key) {
                entry.rows.truncate(key.page.offset.min(entry.rows.len()));
                entry.rows.extend(page.rows);
                entry.total = page.total;
                entry.fetched_at = Instant::now();
            }
        } else {
            self.entries.insert(
                entry_key.clone(),
                CachedView {
                    query: key.query.clone(),
                    rows: page.rows,
                    total: page.total,
                    fetched_at: Instant::now(),
                },
            );
        }
        Ok(self.entries[&entry_key].snapshot(key.path(), false))
    }
}

/// Per-session cache of read models.
pub struct ViewCache {
    inner: Arc<Mutex<CacheInner>>,
    ttl: Duration,
}

impl ViewCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner::default())),
            ttl,
        }
    }

    /// Serve `key` from cache or fetch it.
    ///
    /// `fetcher` is called at most once, only when a request has to be
    /// issued, and must not touch this cache before returning its future.
    pub async fn load<F, Fut>(&self, key: ViewKey, fetcher: F) -> Result<ViewLoad, ViewError>
    where
        F: FnOnce(ViewKey) -> Fut,
        Fut: Future<Output = anyhow::Result<ViewPage>> + Send + 'static,
    {
        let (future, stale) = {
            let mut inner = self.inner.lock();
            let mut stale = None;
            if let Some(entry) = inner.entries.get(&key.entry_key()) {
                if entry.covers(&key) {
                    let expired = entry.fetched_at.elapsed() >= self.ttl;
                    let snapshot = entry.snapshot(key.path(), expired);
                    if !expired {
                        inner.supersede(&key);
                        debug!(path = %key.path(), "view cache hit");
                        return Ok(ViewLoad::Ready(snapshot));
                    }
                    stale = Some(snapshot);
                }
            }
            let joined = match inner.slots.get(&key.slot) {
                Some(flight) if flight.key == key => Some(flight.future.clone()),
                Some(flight) => {
                    debug!(old = %flight.key.path(), new = %key.path(), "superseding in-flight view");
                    flight.abort.abort();
                    None
                }
                None => None,
            };
            let future = match joined {
                Some(future) => future,
                None => self.start(&mut inner, key.clone(), fetcher),
            };
            (future, stale)
        };

        if let Some(snapshot) = stale {
            tokio::spawn(future.map(|_| ()));
            return Ok(ViewLoad::Stale(snapshot));
        }
        match future.await {
            Ok(snapshot) => Ok(ViewLoad::Ready(snapshot)),
            Err(LoadFailure::Superseded) => Ok(ViewLoad::Superseded),
            Err(LoadFailure::Fetch(e)) => Err(ViewError::Fetch(e)),
        }
    }

    fn start<F, Fut>(&self, inner: &mut CacheInner, key: ViewKey, fetcher: F) -> SharedLoad
    where
        F: FnOnce(ViewKey) -> Fut,
        Fut: Future<Output = anyhow::Result<ViewPage>> + Send + 'static,
    {
        inner.generation += 1;
        let generation = inner.generation;
        let (abort, registration) = AbortHandle::new_pair();
        let request = Abortable::new(fetcher(key.clone()), registration);
        let cache = Arc::clone(&self.inner);
        let flight_key = key.clone();
        let future = async move {
            match request.await {
                Err(_aborted) => Err(LoadFailure::Superseded),
                Ok(Err(e)) => {
                    cache.lock().finish(&flight_key.slot, generation);
                    Err(LoadFailure::Fetch(Arc::new(e)))
                }
                Ok(Ok(page)) => cache.lock().commit(&flight_key, generation, page),
            }
        }
        .boxed()
        .shared();
        debug!(path = %key.path(), generation, "view fetch started");
        inner.slots.insert(
            key.slot.clone(),
            InFlight {
                key,
                generation,
                future: future.clone(),
                abort,
                invalidated: false,
            },
        );
        future
    }

    /// Drop every entry whose path is `prefix` or lies under it. In-flight
    /// requests for matching paths still answer their callers but are not
    /// cached.
    pub fn invalidate(&self, prefix: &str) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|(slot, parent), _| !prefix_matches(&path_of(slot, parent.as_deref()), prefix));
        for flight in inner.slots.values_mut() {
            if prefix_matches(&flight.key.path(), prefix) {
                flight.invalidated = true;
            }
        }
        let dropped = before - inner.entries.len();
        if dropped > 0 {
            debug!(prefix, dropped, "view cache invalidated");
        }
        dropped
    }

    /// Drop every view whose parent is `parent`, whatever its slot.
    pub fn invalidate_parent(&self, parent: &str) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|(_, p), _| p.as_deref() != Some(parent));
        for flight in inner.slots.values_mut() {
            if flight.key.parent.as_deref() == Some(parent) {
                flight.invalidated = true;
            }
        }
        before - inner.entries.len()
    }

    /// Invalidate every view an entity change can affect.
    pub fn invalidate_entity(&self, entity: &Entity) {
        for path in affected_paths(entity) {
            self.invalidate(&path);
        }
    }

    pub fn contains(&self, key: &ViewKey) -> bool {
        self.inner.lock().entries.contains_key(&key.entry_key())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget everything and abort every in-flight request.
    pub fn clear_all(&self) {
        let mut inner = self.inner.lock();
        for (_, flight) in inner.slots.drain() {
            flight.abort.abort();
        }
        inner.entries.clear();
    }
}

/// View paths whose contents depend on `entity`: the folder summary, the
/// parent list view, and the detail views of the entity and its parent.
pub fn affected_paths(entity: &Entity) -> Vec<String> {
    let id = |id: EntityId| id.to_string();
    match entity {
        Entity::Collection(c) => vec![
            slots::FOLDERS.to_string(),
            path_of(slots::FOLDER_NOTEBOOKS, Some(&id(c.id))),
        ],
        Entity::Group(g) => vec![
            slots::FOLDERS.to_string(),
            path_of(slots::FOLDER_NOTEBOOKS, Some(&id(g.collection_id))),
            path_of(slots::NOTEBOOK_NOTES, Some(&id(g.id))),
        ],
        Entity::Item(i) => vec![
            slots::FOLDERS.to_string(),
            path_of(slots::FOLDER_NOTEBOOKS, Some(&id(i.collection_id))),
            path_of(slots::NOTEBOOK_NOTES, Some(&id(i.group_id))),
            path_of(slots::NOTE, Some(&id(i.id))),
        ],
    }
}

//! Normalized in-memory cache of collections, groups and items.
//!
//! Entities live in flat per-kind maps addressed by [`EntityId`]. The only
//! graph structure is a pair of parent → children id sets, kept consistent
//! with the maps by every operation. All operations are synchronous and
//! never hold the lock across an await point.

use crate::model::{Collection, Entity, EntityId, EntityKind, EntityPatch, Group, Item};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;


/// Full copy of the store contents, comparable for equality.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoreSnapshot {
    collections: HashMap<EntityId, Entity>,
    groups: HashMap<EntityId, Entity>,
    items: HashMap<EntityId, Entity>,
    groups_by_collection: HashMap<EntityId, HashSet<EntityId>>,
    items_by_group: HashMap<EntityId, HashSet<EntityId>>,
}

type StoreInner = StoreSnapshot;

impl StoreInner {
    fn map(&self, kind: EntityKind) -> &HashMap<EntityId, Entity> {
        match kind {
            EntityKind::Collection => &self.collections,
            EntityKind::Group => &self.groups,
            EntityKind::Item => &self.items,
        }
    }

    fn map_mut(&mut self, kind: EntityKind) -> &mut HashMap<EntityId, Entity> {
        match kind {
            EntityKind::Collection => &mut self.collections,
            EntityKind::Group => &mut self.groups,
            EntityKind::Item => &mut self.items,
        }
    }

    /// Index holding entities of `child` kind keyed by their parent.
    fn index(&self, child: EntityKind) -> Option<&HashMap<EntityId, HashSet<EntityId>>> {
        match child {
            EntityKind::Collection => None,
            EntityKind::Group => Some(&self.groups_by_collection),
            EntityKind::Item => Some(&self.items_by_group),
        }
    }

    fn index_mut(&mut self, child: EntityKind) -> Option<&mut HashMap<EntityId, HashSet<EntityId>>> {
        match child {
            EntityKind::Collection => None,
            EntityKind::Group => Some(&mut self.groups_by_collection),
            EntityKind::Item => Some(&mut self.items_by_group),
        }
    }

    fn link(&mut self, kind: EntityKind, id: EntityId, parent: EntityId) {
        if let Some(index) = self.index_mut(kind) {
            index.entry(parent).or_default().insert(id);
        }
    }

    fn unlink(&mut self, kind: EntityKind, id: EntityId, parent: EntityId) {
        if let Some(index) = self.index_mut(kind) {
            if let Some(bucket) = index.get_mut(&parent) {
                bucket.remove(&id);
                if bucket.is_empty() {
                    index.remove(&parent);
                }
            }
        }
    }

    fn child_ids(&self, parent_kind: EntityKind, parent: EntityId) -> Vec<EntityId> {
        parent_kind
            .child()
            .and_then(|child| self.index(child))
            .and_then(|index| index.get(&parent))
            .map(|bucket| bucket.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Insert or overwrite, moving the id between index buckets when its
    /// parent changed.
    fn insert(&mut self, mut entity: Entity) {
        let kind = entity.kind();
        let id = entity.id();
        if let Entity::Item(item) = &mut entity {
            if let Some(Entity::Group(group)) = self.groups.get(&item.group_id) {
                item.collection_id = group.collection_id;
            }
        }
        let new_parent = entity.parent_id();
        let old_parent = self.map(kind).get(&id).and_then(|e| e.parent_id());
        if old_parent != new_parent {
            if let Some(old) = old_parent {
                self.unlink(kind, id, old);
            }
        }
        self.map_mut(kind).insert(id, entity);
        if let Some(parent) = new_parent {
            self.link(kind, id, parent);
        }
    }

    /// Ids of the entity and all its descendants, parents first.
    fn subtree_ids(&self, kind: EntityKind, id: EntityId) -> Vec<(EntityKind, EntityId)> {
        let mut out = Vec::new();
        if !self.map(kind).contains_key(&id) {
            return out;
        }
        out.push((kind, id));
        let mut cursor = 0;
        while cursor < out.len() {
            let (k, parent) = out[cursor];
            if let Some(child_kind) = k.child() {
                let mut children = self.child_ids(k, parent);
                children.sort();
                out.extend(children.into_iter().map(|c| (child_kind, c)));
            }
            cursor += 1;
        }
        out
    }

    fn subtree(&self, kind: EntityKind, id: EntityId) -> Vec<Entity> {
        self.subtree_ids(kind, id)
            .into_iter()
            .filter_map(|(k, i)| self.map(k).get(&i).cloned())
            .collect()
    }

    fn remove_cascade(&mut self, kind: EntityKind, id: EntityId) -> Vec<Entity> {
        let ids = self.subtree_ids(kind, id);
        let mut removed = Vec::with_capacity(ids.len());
        for (k, i) in ids {
            if let Some(entity) = self.map_mut(k).remove(&i) {
                if let Some(parent) = entity.parent_id() {
                    self.unlink(k, i, parent);
                }
                removed.push(entity);
            }
        }
        removed
    }

    fn rebuild_indexes(&mut self) {
        self.groups_by_collection.clear();
        self.items_by_group.clear();
        let links: Vec<(EntityKind, EntityId, EntityId)> = self
            .groups
            .values()
            .chain(self.items.values())
            .filter_map(|e| e.parent_id().map(|p| (e.kind(), e.id(), p)))
            .collect();
        for (kind, id, parent) in links {
            self.link(kind, id, parent);
        }
    }
}

/// Read access handed to getters and observer selectors.
#[derive(Clone, Copy)]
pub struct StoreView<'a> {
    inner: &'a StoreInner,
}

impl<'a> StoreView<'a> {
    pub fn get(&self, kind: EntityKind, id: EntityId) -> Option<&'a Entity> {
        self.inner.map(kind).get(&id)
    }

    pub fn contains(&self, kind: EntityKind, id: EntityId) -> bool {
        self.inner.map(kind).contains_key(&id)
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        self.inner.map(kind).len()
    }

    /// Children of a parent, ordered for display: groups by `sort_order`
    /// then name, items by `position`.
    pub fn children_of(&self, parent_kind: EntityKind, parent: EntityId) -> Vec<&'a Entity> {
        let Some(child_kind) = parent_kind.child() else {
            return Vec::new();
        };
        let inner = self.inner;
        let mut children: Vec<&Entity> = inner
            .child_ids(parent_kind, parent)
            .into_iter()
            .filter_map(|id| inner.map(child_kind).get(&id))
            .collect();
        children.sort_by(|a, b| match (a, b) {
            (Entity::Group(x), Entity::Group(y)) => {
                x.sort_order.cmp(&y.sort_order).then_with(|| x.name.cmp(&y.name))
            }
            (Entity::Item(x), Entity::Item(y)) => x
                .position
                .total_cmp(&y.position)
                .then_with(|| x.created_at.cmp(&y.created_at)),
            _ => a.id().cmp(&b.id()),
        });
        children
    }

    pub fn child_count(&self, parent_kind: EntityKind, parent: EntityId) -> usize {
        parent_kind
            .child()
            .and_then(|child| self.inner.index(child))
            .and_then(|index| index.get(&parent))
            .map_or(0, |bucket| bucket.len())
    }

    pub fn collections(&self) -> Vec<&'a Collection> {
        let mut out: Vec<&Collection> = self
            .inner
            .collections
            .values()
            .filter_map(Entity::as_collection)
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub fn groups_in(&self, collection: EntityId) -> Vec<&'a Group> {
        self.children_of(EntityKind::Collection, collection)
            .into_iter()
            .filter_map(Entity::as_group)
            .collect()
    }

    pub fn items_in(&self, group: EntityId) -> Vec<&'a Item> {
        self.children_of(EntityKind::Group, group)
            .into_iter()
            .filter_map(Entity::as_item)
            .collect()
    }
}

/// Handle returned by [`EntityStore::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Box<dyn FnMut(&StoreView<'_>) + Send>;

/// The normalized entity cache. One per signed-in session.
pub struct EntityStore {
    inner: RwLock<StoreInner>,
    observers: Mutex<Vec<(ObserverId, Observer)>>,
    next_observer: AtomicU64,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(0),
        }
    }

    /// Run `f` against a consistent read view.
    pub fn read<R>(&self, f: impl FnOnce(&StoreView<'_>) -> R) -> R {
        let guard = self.inner.read();
        f(&StoreView { inner: &guard })
    }

    fn write<R>(&self, f: impl FnOnce(&mut StoreInner) -> R) -> R {
        let out = {
            let mut guard = self.inner.write();
            f(&mut guard)
        };
        self.notify();
        out
    }

    fn notify(&self) {
        let guard = self.inner.read();
        let view = StoreView { inner: &guard };
        let mut observers = self.observers.lock();
        for (_, observer) in observers.iter_mut() {
            observer(&view);
        }
    }

    /// Replace every entity of `kind` and rebuild both indexes.
    pub fn set_all(&self, kind: EntityKind, entities: Vec<Entity>) {
        let count = entities.len();
        self.write(|inner| {
            let map = inner.map_mut(kind);
            map.clear();
            for entity in entities.into_iter().filter(|e| e.kind() == kind) {
                map.insert(entity.id(), entity);
            }
            inner.rebuild_indexes();
        });
        debug!(%kind, count, "store bulk replace");
    }

    /// Insert an entity, overwriting any existing copy with the same id.
    pub fn add(&self, entity: Entity) {
        self.write(|inner| inner.insert(entity));
    }

    /// Full overwrite with an authoritative copy. Same as [`EntityStore::add`]
    /// except that groups moved to another collection carry their items along.
    pub fn replace(&self, entity: Entity) {
        self.write(|inner| {
            if let Entity::Group(group) = &entity {
                for item_id in inner.child_ids(EntityKind::Group, group.id) {
                    if let Some(Entity::Item(item)) = inner.items.get_mut(&item_id) {
                        item.collection_id = group.collection_id;
                    }
                }
            }
            inner.insert(entity);
        });
    }

    /// Shallow merge of `patch` into the entity. Missing ids and patches of
    /// another kind are ignored. Returns the merged entity.
    pub fn update(&self, kind: EntityKind, id: EntityId, patch: &EntityPatch) -> Option<Entity> {
        if patch.kind() != kind {
            return None;
        }
        self.write(|inner| {
            let mut entity = inner.map(kind).get(&id)?.clone();
            entity.apply(patch);
            match &mut entity {
                Entity::Group(group) => {
                    for item_id in inner.child_ids(EntityKind::Group, id) {
                        if let Some(Entity::Item(item)) = inner.items.get_mut(&item_id) {
                            item.collection_id = group.collection_id;
                        }
                    }
                }
                Entity::Item(_) | Entity::Collection(_) => {}
            }
            inner.insert(entity);
            inner.map(kind).get(&id).cloned()
        })
    }

    /// Remove an entity and every descendant. Returns what was removed,
    /// parents first; empty when the id was not present.
    pub fn remove(&self, kind: EntityKind, id: EntityId) -> Vec<Entity> {
        let removed = self.write(|inner| inner.remove_cascade(kind, id));
        if !removed.is_empty() {
            debug!(%kind, %id, count = removed.len(), "store cascade remove");
        }
        removed
    }

    /// Replace the entity stored under `old_id` by `entity` in one step,
    /// re-pointing children of the old id at the new one.
    pub fn swap(&self, kind: EntityKind, old_id: EntityId, entity: Entity) {
        self.write(|inner| {
            let new_id = entity.id();
            let children = inner.child_ids(kind, old_id);
            if let Some(old) = inner.map_mut(kind).remove(&old_id) {
                if let Some(parent) = old.parent_id() {
                    inner.unlink(kind, old_id, parent);
                }
            }
            inner.insert(entity);
            if let Some(child_kind) = kind.child() {
                for child_id in children {
                    if let Some(mut child) = inner.map(child_kind).get(&child_id).cloned() {
                        match &mut child {
                            Entity::Group(g) => g.collection_id = new_id,
                            Entity::Item(i) => i.group_id = new_id,
                            Entity::Collection(_) => {}
                        }
                        inner.insert(child);
                    }
                }
            }
        });
    }

    /// Capture an entity and all its descendants, parents first.
    pub fn snapshot_subtree(&self, kind: EntityKind, id: EntityId) -> Vec<Entity> {
        self.inner.read().subtree(kind, id)
    }

    /// Re-insert a captured subtree exactly as it was.
    pub fn restore(&self, entities: Vec<Entity>) {
        self.write(|inner| {
            for entity in entities {
                inner.insert(entity);
            }
        });
    }

    pub fn get(&self, kind: EntityKind, id: EntityId) -> Option<Entity> {
        self.inner.read().map(kind).get(&id).cloned()
    }

    pub fn children_of(&self, parent_kind: EntityKind, parent: EntityId) -> Vec<Entity> {
        self.read(|view| view.children_of(parent_kind, parent).into_iter().cloned().collect())
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        self.inner.read().map(kind).len()
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.read();
        EntityKind::ALL.iter().all(|k| inner.map(*k).is_empty())
    }

    pub fn clear_all(&self) {
        self.write(|inner| *inner = StoreInner::default());
        debug!("store cleared");
    }

    /// Copy of the full contents, for equality checks across a rollback.
    pub fn snapshot(&self) -> StoreSnapshot {
        self.inner.read().clone()
    }

    /// Register `callback` to run whenever the value picked by `selector`
    /// changes. Callbacks run under a read lock and must not write to the
    /// store or register observers.
    pub fn subscribe<T, S, F>(&self, selector: S, mut callback: F) -> ObserverId
    where
        T: PartialEq + Send + 'static,
        S: Fn(&StoreView<'_>) -> T + Send + 'static,
        F: FnMut(&T) + Send + 'static,
    {
        let mut last = self.read(|view| selector(view));
        let observer: Observer = Box::new(move |view| {
            let next = selector(view);
            if next != last {
                callback(&next);
                last = next;
            }
        });
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((id, observer));
        id
    }

    pub fn unsubscribe(&self, id: ObserverId) {
        self.observers.lock().retain(|(oid, _)| *oid != id);
    }

    /// Verify that maps and indexes agree: every grouped or itemized entity
    /// sits in exactly its parent's bucket and every bucket entry exists.
    pub fn check_invariants(&self) -> Result<(), String> {
        let inner = self.inner.read();
        for child in [EntityKind::Group, EntityKind::Item] {
            let Some(index) = inner.index(child) else {
                continue;
            };
            for (id, entity) in inner.map(child) {
                let Some(parent) = entity.parent_id() else {
                    continue;
                };
                for (bucket_parent, bucket) in index {
                    let listed = bucket.contains(id);
                    if listed != (*bucket_parent == parent) {
                        return Err(format!(
                            "{child} {id} listed={listed} under {bucket_parent}, parent is {parent}"
                        ));
                    }
                }
                if !index.get(&parent).is_some_and(|b| b.contains(id)) {
                    return Err(format!("{child} {id} missing from bucket {parent}"));
                }
            }
            for (parent, bucket) in index {
                if bucket.is_empty() {
                    return Err(format!("empty {child} bucket under {parent}"));
                }
                for id in bucket {
                    if !inner.map(child).contains_key(id) {
                        return Err(format!("dangling {child} {id} under {parent}"));
                    }
                }
            }
        }
        for (id, entity) in &inner.items {
            if let Entity::Item(item) = entity {
                if let Some(Entity::Group(group)) = inner.groups.get(&item.group_id) {
                    if item.collection_id != group.collection_id {
                        return Err(format!("item {id} collection differs from its group"));
                    }
                }
            }
        }
        Ok(())
    }
}

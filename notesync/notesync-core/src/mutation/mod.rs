//! Optimistic writes.
//!
//! Every create, update and delete is applied to the [`EntityStore`] first,
//! then sent to the backend. A confirmed write replaces the local copy with
//! the server's; a failed one puts the store back exactly as it was and
//! returns [`SyncError::DurableWrite`] carrying the attempted data.

use crate::backend::{Backend, Filter};
use crate::error::{MutationOp, SyncError, SyncResult};
use crate::model::{
    Collection, CollectionPatch, Entity, EntityId, EntityKind, EntityPatch, Group, GroupPatch,
    Item, ItemPatch, UserContext, DEFAULT_COLOR,
};
use crate::position::{fits_between, next_position, position_between, rebalance};
use crate::store::EntityStore;
use crate::view::ViewCache;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

#[cfg(test)]
mod tests;

type EntityKey = (EntityKind, EntityId);

/// Marks an id as having a write in flight until dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<EntityKey>>,
    key: EntityKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

fn validation(message: impl Into<String>) -> SyncError {
    SyncError::Validation(message.into())
}

fn require_text(field: &str, value: &str) -> SyncResult<()> {
    if value.trim().is_empty() {
        return Err(validation(format!("{field} must not be empty")));
    }
    Ok(())
}

fn durable_id(kind: EntityKind, id: EntityId) -> SyncResult<Uuid> {
    id.durable()
        .ok_or_else(|| validation(format!("{kind} {id} is not confirmed yet")))
}

pub struct MutationManager {
    store: Arc<EntityStore>,
    views: Arc<ViewCache>,
    backend: Arc<dyn Backend>,
    user: UserContext,
    serialize_same_entity: bool,
    next_temp: AtomicU64,
    in_flight: Mutex<HashSet<EntityKey>>,
}

impl MutationManager {
    pub fn new(
        store: Arc<EntityStore>,
        views: Arc<ViewCache>,
        backend: Arc<dyn Backend>,
        user: UserContext,
    ) -> Self {
        Self {
            store,
            views,
            backend,
            user,
            serialize_same_entity: false,
            next_temp: AtomicU64::new(1),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Reject a mutation on an id that already has one in flight.
    pub fn serialize_same_entity(mut self, enabled: bool) -> Self {
        self.serialize_same_entity = enabled;
        self
    }

    pub fn user(&self) -> &UserContext {
        &self.user
    }

    fn temp_id(&self) -> EntityId {
        EntityId::Temp(self.next_temp.fetch_add(1, Ordering::Relaxed))
    }

    fn begin(&self, kind: EntityKind, id: EntityId) -> SyncResult<Option<InFlight<'_>>> {
        if !self.serialize_same_entity {
            return Ok(None);
        }
        if !self.in_flight.lock().insert((kind, id)) {
            return Err(SyncError::MutationInFlight { kind, id });
        }
        Ok(Some(InFlight {
            set: &self.in_flight,
            key: (kind, id),
        }))
    }

    fn invalidate(&self, entities: &[&Entity]) {
        for entity in entities {
            self.views.invalidate_entity(entity);
        }
    }

    fn require_parent(&self, kind: EntityKind, parent: EntityId) -> SyncResult<Entity> {
        durable_id(kind, parent)?;
        self.store
            .get(kind, parent)
            .ok_or_else(|| validation(format!("{kind} {parent} does not exist")))
    }

    /// Fill in local defaults and check the candidate before anything is
    /// applied.
    fn prepare(&self, mut candidate: Entity, id: EntityId) -> SyncResult<Entity> {
        let now = Utc::now();
        match &mut candidate {
            Entity::Collection(c) => {
                require_text("collection name", &c.name)?;
                if c.color.is_empty() {
                    c.color = DEFAULT_COLOR.into();
                }
                c.created_at = now;
            }
            Entity::Group(g) => {
                require_text("group name", &g.name)?;
                self.require_parent(EntityKind::Collection, g.collection_id)?;
                if g.color.is_empty() {
                    g.color = DEFAULT_COLOR.into();
                }
                g.created_at = now;
            }
            Entity::Item(i) => {
                require_text("item title", &i.title)?;
                if !i.position.is_finite() {
                    return Err(validation("item position must be finite"));
                }
                let group = self.require_parent(EntityKind::Group, i.group_id)?;
                i.collection_id = group.collection_id();
                i.created_at = now;
            }
        }
        candidate.set_id(id);
        candidate.set_owner_id(&self.user.id);
        candidate.touch(now);
        Ok(candidate)
    }

    fn check_patch(&self, kind: EntityKind, patch: &EntityPatch) -> SyncResult<()> {
        if patch.kind() != kind {
            return Err(validation(format!("{} patch sent for {kind}", patch.kind())));
        }
        match patch {
            EntityPatch::Collection(p) => {
                if let Some(name) = &p.name {
                    require_text("collection name", name)?;
                }
            }
            EntityPatch::Group(p) => {
                if let Some(name) = &p.name {
                    require_text("group name", name)?;
                }
            }
            EntityPatch::Item(p) => {
                if let Some(title) = &p.title {
                    require_text("item title", title)?;
                }
                if p.position.is_some_and(|pos| !pos.is_finite()) {
                    return Err(validation("item position must be finite"));
                }
            }
        }
        if let (Some(parent), Some(parent_kind)) = (patch.new_parent(), kind.parent()) {
            self.require_parent(parent_kind, parent)?;
        }
        for referenced in patch.referenced_ids() {
            if referenced.is_temp() {
                return Err(validation(format!("{referenced} is not confirmed yet")));
            }
        }
        Ok(())
    }

    /// Optimistic create. The store shows the candidate under a temp id
    /// until the backend answers.
    pub async fn create(&self, candidate: Entity) -> SyncResult<Entity> {
        let kind = candidate.kind();
        let temp = self.temp_id();
        let candidate = self.prepare(candidate, temp)?;

        self.store.add(candidate.clone());
        debug!(%kind, id = %temp, "optimistic create applied");

        match self.backend.create(&candidate).await {
            Ok(stored) => {
                self.store.swap(kind, temp, stored.clone());
                self.invalidate(&[&stored]);
                debug!(%kind, temp = %temp, id = %stored.id(), "create confirmed");
                Ok(stored)
            }
            Err(source) => {
                self.store.remove(kind, temp);
                warn!(%kind, id = %temp, error = %source, "create failed, rolled back");
                Err(SyncError::DurableWrite {
                    op: MutationOp::Create,
                    kind,
                    attempted: serde_json::to_value(&candidate).unwrap_or_default(),
                    source,
                })
            }
        }
    }

    /// Optimistic shallow merge. `Ok(None)` when the entity is not in the
    /// store.
    pub async fn update(
        &self,
        kind: EntityKind,
        id: EntityId,
        patch: EntityPatch,
    ) -> SyncResult<Option<Entity>> {
        self.check_patch(kind, &patch)?;
        let Some(previous) = self.store.get(kind, id) else {
            debug!(%kind, %id, "update of missing entity ignored");
            return Ok(None);
        };
        let durable = durable_id(kind, id)?;
        let _guard = self.begin(kind, id)?;

        // A group carries its items' collection_id, so its rollback covers them too.
        let snapshot = match kind {
            EntityKind::Group => self.store.snapshot_subtree(kind, id),
            _ => vec![previous.clone()],
        };
        self.store.update(kind, id, &patch);
        debug!(%kind, %id, "optimistic update applied");

        match self.backend.update(kind, durable, &patch).await {
            Ok(stored) => {
                self.store.replace(stored.clone());
                self.invalidate(&[&stored, &previous]);
                Ok(Some(stored))
            }
            Err(source) => {
                self.store.restore(snapshot);
                warn!(%kind, %id, error = %source, "update failed, rolled back");
                Err(SyncError::DurableWrite {
                    op: MutationOp::Update,
                    kind,
                    attempted: serde_json::to_value(&patch).unwrap_or_default(),
                    source,
                })
            }
        }
    }

    /// Optimistic cascading delete. The durable side deletes children by
    /// filter before the root; a failure at any step restores the whole
    /// subtree captured up front.
    pub async fn delete(&self, kind: EntityKind, id: EntityId) -> SyncResult<()> {
        let durable = durable_id(kind, id)?;
        let snapshot = self.store.snapshot_subtree(kind, id);
        let Some(root) = snapshot.first().cloned() else {
            debug!(%kind, %id, "delete of missing entity ignored");
            return Ok(());
        };
        let _guard = self.begin(kind, id)?;

        self.store.remove(kind, id);
        debug!(%kind, %id, count = snapshot.len(), "optimistic delete applied");

        match self.delete_durable(kind, durable).await {
            Ok(()) => {
                self.invalidate(&[&root]);
                Ok(())
            }
            Err(source) => {
                let count = snapshot.len();
                let attempted = serde_json::to_value(&root).unwrap_or_default();
                self.store.restore(snapshot);
                warn!(%kind, %id, count, error = %source, "delete failed, rolled back");
                Err(SyncError::DurableWrite {
                    op: MutationOp::Delete,
                    kind,
                    attempted,
                    source,
                })
            }
        }
    }

    async fn delete_durable(&self, kind: EntityKind, id: Uuid) -> anyhow::Result<()> {
        match kind {
            EntityKind::Collection => {
                let by_collection = Filter::all().eq("collection_id", id);
                self.backend
                    .delete_where(EntityKind::Item, &by_collection)
                    .await?;
                self.backend
                    .delete_where(EntityKind::Group, &by_collection)
                    .await?;
            }
            EntityKind::Group => {
                self.backend
                    .delete_where(EntityKind::Item, &Filter::all().eq("group_id", id))
                    .await?;
            }
            EntityKind::Item => {}
        }
        self.backend.delete(kind, id).await
    }

    pub async fn create_collection(&self, name: &str, color: Option<&str>) -> SyncResult<Entity> {
        let now = Utc::now();
        self.create(Entity::Collection(Collection {
            id: EntityId::Temp(0),
            owner_id: self.user.id.clone(),
            name: name.trim().to_string(),
            color: color.unwrap_or(DEFAULT_COLOR).to_string(),
            created_at: now,
            updated_at: now,
        }))
        .await
    }

    /// New group at the end of its collection.
    pub async fn create_group(&self, collection_id: EntityId, name: &str) -> SyncResult<Entity> {
        let now = Utc::now();
        let sort_order = self.store.read(|view| {
            view.groups_in(collection_id)
                .iter()
                .map(|g| g.sort_order + 1)
                .max()
                .unwrap_or(0)
        });
        self.create(Entity::Group(Group {
            id: EntityId::Temp(0),
            owner_id: self.user.id.clone(),
            collection_id,
            name: name.trim().to_string(),
            color: DEFAULT_COLOR.into(),
            archived: false,
            archived_at: None,
            sort_order,
            created_at: now,
            updated_at: now,
        }))
        .await
    }

    /// New item appended after its last sibling.
    pub async fn create_item(
        &self,
        group_id: EntityId,
        title: &str,
        content: &str,
    ) -> SyncResult<Entity> {
        let now = Utc::now();
        let position = self.store.read(|view| {
            next_position(view.items_in(group_id).iter().map(|i| i.position))
        });
        self.create(Entity::Item(Item {
            id: EntityId::Temp(0),
            owner_id: self.user.id.clone(),
            group_id,
            collection_id: group_id,
            title: title.trim().to_string(),
            content: content.to_string(),
            position,
            created_at: now,
            updated_at: now,
        }))
        .await
    }

    /// Rename a collection or group, or retitle an item.
    pub async fn rename(
        &self,
        kind: EntityKind,
        id: EntityId,
        name: &str,
    ) -> SyncResult<Option<Entity>> {
        let name = Some(name.trim().to_string());
        let patch = match kind {
            EntityKind::Collection => EntityPatch::Collection(CollectionPatch {
                name,
                ..Default::default()
            }),
            EntityKind::Group => EntityPatch::Group(GroupPatch {
                name,
                ..Default::default()
            }),
            EntityKind::Item => EntityPatch::Item(ItemPatch {
                title: name,
                ..Default::default()
            }),
        };
        self.update(kind, id, patch).await
    }

    /// Re-parent a group; its items follow to the new collection.
    pub async fn move_group(&self, id: EntityId, collection_id: EntityId) -> SyncResult<Option<Entity>> {
        self.update(
            EntityKind::Group,
            id,
            EntityPatch::Group(GroupPatch {
                collection_id: Some(collection_id),
                ..Default::default()
            }),
        )
        .await
    }

    /// Move an item to the end of another group.
    pub async fn move_item(&self, id: EntityId, group_id: EntityId) -> SyncResult<Option<Entity>> {
        let group = self.require_parent(EntityKind::Group, group_id)?;
        let position = self.store.read(|view| {
            next_position(
                view.items_in(group_id)
                    .iter()
                    .filter(|i| i.id != id)
                    .map(|i| i.position),
            )
        });
        self.update(
            EntityKind::Item,
            id,
            EntityPatch::Item(ItemPatch {
                group_id: Some(group_id),
                collection_id: Some(group.collection_id()),
                position: Some(position),
                ..Default::default()
            }),
        )
        .await
    }

    /// Place an item between two siblings of its group; `None` on either
    /// side means the list edge, and `None` on both moves it to the front.
    /// Respaces the whole group when the midpoint no longer fits.
    pub async fn reorder_item(
        &self,
        id: EntityId,
        after: Option<EntityId>,
        before: Option<EntityId>,
    ) -> SyncResult<Option<Entity>> {
        let Some(Entity::Item(item)) = self.store.get(EntityKind::Item, id) else {
            return Ok(None);
        };
        let siblings: Vec<Item> = self.store.read(|view| {
            view.items_in(item.group_id)
                .into_iter()
                .filter(|i| i.id != id)
                .cloned()
                .collect()
        });
        let neighbour = |other: Option<EntityId>| -> SyncResult<Option<f64>> {
            match other {
                None => Ok(None),
                Some(other) => siblings
                    .iter()
                    .find(|i| i.id == other)
                    .map(|i| Some(i.position))
                    .ok_or_else(|| validation(format!("{other} is not a sibling of {id}"))),
            }
        };
        let prev = neighbour(after)?;
        let next = match (after, before) {
            (None, None) => siblings.first().map(|i| i.position),
            _ => neighbour(before)?,
        };

        let mut position = position_between(prev, next);
        if !fits_between(position, prev, next) {
            position = self.respace(&siblings, id, after).await?;
        }
        self.update(
            EntityKind::Item,
            id,
            EntityPatch::Item(ItemPatch {
                position: Some(position),
                ..Default::default()
            }),
        )
        .await
    }

    /// Give every sibling a fresh evenly spaced position, leaving a slot for
    /// `moving` right after `after`. Returns that slot.
    async fn respace(&self, siblings: &[Item], moving: EntityId, after: Option<EntityId>) -> SyncResult<f64> {
        let mut order: Vec<Option<EntityId>> = siblings.iter().map(|i| Some(i.id)).collect();
        let slot = match after {
            None => 0,
            Some(after) => order
                .iter()
                .position(|i| *i == Some(after))
                .map_or(order.len(), |p| p + 1),
        };
        order.insert(slot, None);
        let positions = rebalance(order.len());
        debug!(item = %moving, count = order.len(), "respacing group positions");
        for (entry, position) in order.iter().zip(&positions) {
            let Some(sibling) = entry else {
                continue;
            };
            self.update(
                EntityKind::Item,
                *sibling,
                EntityPatch::Item(ItemPatch {
                    position: Some(*position),
                    ..Default::default()
                }),
            )
            .await?;
        }
        Ok(positions[slot])
    }

    pub async fn archive_group(&self, id: EntityId) -> SyncResult<Option<Entity>> {
        self.update(
            EntityKind::Group,
            id,
            EntityPatch::Group(GroupPatch {
                archived: Some(true),
                archived_at: Some(Utc::now()),
                ..Default::default()
            }),
        )
        .await
    }

    pub async fn unarchive_group(&self, id: EntityId) -> SyncResult<Option<Entity>> {
        self.update(
            EntityKind::Group,
            id,
            EntityPatch::Group(GroupPatch {
                archived: Some(false),
                ..Default::default()
            }),
        )
        .await
    }
}

//! In-process durable store with the server's rules.
//!
//! [`MemoryBackend`] holds the shared tables and the change bus;
//! [`MemoryBackend::connect`] hands out a [`MemoryClient`] bound to one user
//! that enforces access on every call. The reference server wraps the same
//! type, so tests and the HTTP surface share one set of rules.

use super::{Backend, Filter};
use crate::acl::{
    AcceptPlan, AcceptedInvitation, AccessControl, AclState, NewInvitation, NewPermission,
    PermissionFilter,
};
use crate::error::BackendError;
use crate::events::{ChangeEvent, ChangeType, EventBus};
use crate::model::{
    AccessLevel, Collection, Entity, EntityId, EntityKind, EntityPatch, Group, Invitation, Item,
    Permission, PermissionLevel, ResourceRef, UserContext, DEFAULT_COLOR,
};
use crate::projection;
use crate::realtime::{ChangeFeed, FeedMessage, Subscription, SubscriptionHandle, SubscriptionScope};
use crate::view::{slots, ViewKey, ViewPage};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

const SUBSCRIPTION_BUFFER: usize = 128;

/// Operations a test can make fail once with [`MemoryBackend::fail_next`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOp {
    List,
    Get,
    Create,
    Update,
    Delete,
    DeleteWhere,
    View,
    Subscribe,
}

#[derive(Debug)]
struct Fault {
    op: FaultOp,
    kind: Option<EntityKind>,
}

fn uuid_of(id: EntityId) -> Uuid {
    id.durable().unwrap_or_default()
}

fn durable_ref(id: EntityId, what: &str) -> Result<Uuid, BackendError> {
    id.durable()
        .ok_or_else(|| BackendError::Invalid(format!("{what} references unconfirmed id {id}")))
}

#[derive(Default)]
struct Tables {
    rows: HashMap<EntityKind, BTreeMap<Uuid, Entity>>,
    acl: AclState,
}

impl Tables {
    fn table(&self, kind: EntityKind) -> impl Iterator<Item = &Entity> {
        self.rows.get(&kind).into_iter().flat_map(|t| t.values())
    }

    fn get(&self, kind: EntityKind, id: Uuid) -> Option<&Entity> {
        self.rows.get(&kind)?.get(&id)
    }

    fn put(&mut self, entity: Entity) {
        self.rows
            .entry(entity.kind())
            .or_default()
            .insert(uuid_of(entity.id()), entity);
    }

    fn access(&self, user_id: &str, entity: &Entity) -> AccessLevel {
        match entity {
            Entity::Collection(c) => self.acl.resolve(user_id, &c.owner_id, uuid_of(c.id), None),
            Entity::Group(g) => self.acl.resolve(
                user_id,
                &g.owner_id,
                uuid_of(g.collection_id),
                Some(uuid_of(g.id)),
            ),
            Entity::Item(i) => self.acl.resolve(
                user_id,
                &i.owner_id,
                uuid_of(i.collection_id),
                Some(uuid_of(i.group_id)),
            ),
        }
    }

    fn resource(&self, resource: ResourceRef) -> Result<&Entity, BackendError> {
        self.get(resource.resource_type.entity_kind(), resource.resource_id)
            .ok_or_else(|| {
                BackendError::NotFound(format!(
                    "{} {} not found",
                    resource.resource_type.as_str(),
                    resource.resource_id
                ))
            })
    }

    fn require(&self, user_id: &str, entity: &Entity, level: AccessLevel) -> Result<(), BackendError> {
        if self.access(user_id, entity) >= level {
            Ok(())
        } else {
            Err(BackendError::Forbidden(format!(
                "{:?} access required on {} {}",
                level,
                entity.kind(),
                entity.id()
            )))
        }
    }

    fn children(&self, kind: EntityKind, id: Uuid) -> Vec<Entity> {
        let Some(child_kind) = kind.child() else {
            return Vec::new();
        };
        let id = EntityId::Durable(id);
        self.table(child_kind)
            .filter(|e| e.parent_id() == Some(id))
            .cloned()
            .collect()
    }

    /// Remove a row with everything under it, children before parents.
    fn remove_cascade(&mut self, kind: EntityKind, id: Uuid, events: &mut Vec<ChangeEvent>) -> usize {
        let mut removed = 0;
        for child in self.children(kind, id) {
            removed += self.remove_cascade(child.kind(), uuid_of(child.id()), events);
        }
        let Some(entity) = self.rows.get_mut(&kind).and_then(|t| t.remove(&id)) else {
            return removed;
        };
        let resource = match kind {
            EntityKind::Collection => Some(ResourceRef::collection(id)),
            EntityKind::Group => Some(ResourceRef::group(id)),
            EntityKind::Item => None,
        };
        if let Some(resource) = resource {
            for permission in self.acl.forget_resource(resource) {
                events.push(ChangeEvent::permission(ChangeType::Delete, None, Some(&permission)));
            }
        }
        events.push(ChangeEvent::entity(ChangeType::Delete, None, Some(&entity)));
        removed + 1
    }

    /// Point a collection and everything under it at a new owner.
    fn reassign_owner(&mut self, collection: Uuid, owner: &str, events: &mut Vec<ChangeEvent>) {
        let now = Utc::now();
        let collection_id = EntityId::Durable(collection);
        for kind in EntityKind::ALL {
            let Some(table) = self.rows.get_mut(&kind) else {
                continue;
            };
            for entity in table.values_mut() {
                if entity.collection_id() != collection_id || entity.owner_id() == owner {
                    continue;
                }
                let old = entity.clone();
                entity.set_owner_id(owner);
                entity.touch(now);
                events.push(ChangeEvent::entity(ChangeType::Update, Some(&*entity), Some(&old)));
            }
        }
    }
}

struct Shared {
    tables: RwLock<Tables>,
    events: EventBus,
    faults: Mutex<Vec<Fault>>,
    resets: watch::Sender<u64>,
}

/// Shared durable state. Cheap to clone.
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (resets, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                tables: RwLock::new(Tables::default()),
                events: EventBus::new(),
                faults: Mutex::new(Vec::new()),
                resets,
            }),
        }
    }

    /// A handle acting as `user`.
    pub fn connect(&self, user: UserContext) -> MemoryClient {
        MemoryClient {
            backend: self.clone(),
            user,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    /// Make the next matching call fail with `Unavailable`. `kind: None`
    /// matches calls on any kind.
    pub fn fail_next(&self, op: FaultOp, kind: Option<EntityKind>) {
        self.shared.faults.lock().push(Fault { op, kind });
    }

    /// Break every open change-feed subscription.
    pub fn drop_connections(&self) {
        self.shared.resets.send_modify(|n| *n += 1);
    }

    /// Every stored row of `kind`, ignoring access.
    pub fn dump(&self, kind: EntityKind) -> Vec<Entity> {
        self.shared.tables.read().table(kind).cloned().collect()
    }

    fn take_fault(&self, op: FaultOp, kind: Option<EntityKind>) -> Result<(), BackendError> {
        let mut faults = self.shared.faults.lock();
        let hit = faults
            .iter()
            .position(|f| f.op == op && (f.kind.is_none() || f.kind == kind));
        match hit {
            Some(index) => {
                faults.remove(index);
                debug!(?op, ?kind, "injected backend failure");
                Err(BackendError::Unavailable(format!("injected {op:?} failure")))
            }
            None => Ok(()),
        }
    }

    fn publish(&self, events: Vec<ChangeEvent>) {
        for event in events {
            self.shared.events.send(event);
        }
    }
}

/// One user's connection to a [`MemoryBackend`].
pub struct MemoryClient {
    backend: MemoryBackend,
    user: UserContext,
    subscriptions: Mutex<HashMap<SubscriptionHandle, JoinHandle<()>>>,
}

impl MemoryClient {
    pub fn user(&self) -> &UserContext {
        &self.user
    }

    fn visible<T>(
        &self,
        tables: &Tables,
        kind: EntityKind,
        project: impl Fn(&Entity) -> Option<&T>,
    ) -> Vec<T>
    where
        T: Clone,
    {
        tables
            .table(kind)
            .filter(|e| tables.access(&self.user.id, e).can_read())
            .filter_map(|e| project(e).cloned())
            .collect()
    }

    fn parent_uuid(key: &ViewKey) -> Result<Uuid, BackendError> {
        key.parent
            .as_deref()
            .and_then(|p| Uuid::parse_str(p).ok())
            .ok_or_else(|| BackendError::Invalid(format!("view {} needs a parent id", key.slot)))
    }

    fn readable<'a>(&self, tables: &'a Tables, kind: EntityKind, id: Uuid) -> Result<&'a Entity, BackendError> {
        tables
            .get(kind, id)
            .filter(|e| tables.access(&self.user.id, e).can_read())
            .ok_or_else(|| BackendError::NotFound(format!("{kind} {id} not found")))
    }

    fn build_view(&self, tables: &Tables, key: &ViewKey) -> Result<ViewPage, BackendError> {
        let groups: Vec<Group> = self.visible(tables, EntityKind::Group, Entity::as_group);
        let items: Vec<Item> = self.visible(tables, EntityKind::Item, Entity::as_item);
        match key.slot.as_str() {
            slots::FOLDERS => {
                let collections: Vec<Collection> =
                    self.visible(tables, EntityKind::Collection, Entity::as_collection);
                let rows = projection::folder_summaries(&collections, &groups, &items, &key.query);
                Ok(projection::paginate(rows, &key.page))
            }
            slots::FOLDER_NOTEBOOKS => {
                let id = Self::parent_uuid(key)?;
                self.readable(tables, EntityKind::Collection, id)?;
                let rows =
                    projection::notebook_summaries(id.into(), &groups, &items, &key.query);
                Ok(projection::paginate(rows, &key.page))
            }
            slots::NOTEBOOK_NOTES => {
                let id = Self::parent_uuid(key)?;
                self.readable(tables, EntityKind::Group, id)?;
                let rows = projection::notebook_notes(id.into(), &items, &key.query);
                Ok(projection::paginate(rows, &key.page))
            }
            slots::NOTE => {
                let id = Self::parent_uuid(key)?;
                let item = self.readable(tables, EntityKind::Item, id)?;
                Ok(projection::paginate(vec![item.clone()], &key.page))
            }
            other => Err(BackendError::Invalid(format!("unknown view slot {other:?}"))),
        }
    }

    fn build_row(&self, tables: &Tables, candidate: &Entity) -> Result<Entity, BackendError> {
        let now = Utc::now();
        let id = EntityId::Durable(Uuid::new_v4());
        match candidate {
            Entity::Collection(c) => {
                if c.name.trim().is_empty() {
                    return Err(BackendError::Invalid("collection name is empty".into()));
                }
                Ok(Entity::Collection(Collection {
                    id,
                    owner_id: self.user.id.clone(),
                    name: c.name.clone(),
                    color: if c.color.is_empty() { DEFAULT_COLOR.into() } else { c.color.clone() },
                    created_at: now,
                    updated_at: now,
                }))
            }
            Entity::Group(g) => {
                if g.name.trim().is_empty() {
                    return Err(BackendError::Invalid("group name is empty".into()));
                }
                let parent_id = durable_ref(g.collection_id, "group")?;
                let parent = tables
                    .get(EntityKind::Collection, parent_id)
                    .ok_or_else(|| BackendError::Invalid(format!("collection {parent_id} does not exist")))?;
                tables.require(&self.user.id, parent, AccessLevel::Write)?;
                Ok(Entity::Group(Group {
                    id,
                    owner_id: parent.owner_id().to_string(),
                    collection_id: parent.id(),
                    name: g.name.clone(),
                    color: if g.color.is_empty() { DEFAULT_COLOR.into() } else { g.color.clone() },
                    archived: g.archived,
                    archived_at: g.archived.then(|| g.archived_at.unwrap_or(now)),
                    sort_order: g.sort_order,
                    created_at: now,
                    updated_at: now,
                }))
            }
            Entity::Item(i) => {
                if !i.position.is_finite() {
                    return Err(BackendError::Invalid("item position is not finite".into()));
                }
                let parent_id = durable_ref(i.group_id, "item")?;
                let parent = tables
                    .get(EntityKind::Group, parent_id)
                    .ok_or_else(|| BackendError::Invalid(format!("group {parent_id} does not exist")))?;
                tables.require(&self.user.id, parent, AccessLevel::Write)?;
                Ok(Entity::Item(Item {
                    id,
                    owner_id: parent.owner_id().to_string(),
                    group_id: parent.id(),
                    collection_id: parent.collection_id(),
                    title: i.title.clone(),
                    content: i.content.clone(),
                    position: i.position,
                    created_at: now,
                    updated_at: now,
                }))
            }
        }
    }
}

#[async_trait]
impl Backend for MemoryClient {
    async fn list(&self, kind: EntityKind, filter: &Filter) -> Result<Vec<Entity>> {
        self.backend.take_fault(FaultOp::List, Some(kind))?;
        let tables = self.backend.shared.tables.read();
        let mut rows: Vec<Entity> = tables
            .table(kind)
            .filter(|e| tables.access(&self.user.id, e).can_read())
            .filter(|e| filter.matches_entity(e))
            .cloned()
            .collect();
        rows.sort_by_key(|e| match e {
            Entity::Collection(c) => c.created_at,
            Entity::Group(g) => g.created_at,
            Entity::Item(i) => i.created_at,
        });
        Ok(rows)
    }

    async fn get_by_id(&self, kind: EntityKind, id: Uuid) -> Result<Option<Entity>> {
        self.backend.take_fault(FaultOp::Get, Some(kind))?;
        let tables = self.backend.shared.tables.read();
        Ok(tables
            .get(kind, id)
            .filter(|e| tables.access(&self.user.id, e).can_read())
            .cloned())
    }

    async fn create(&self, candidate: &Entity) -> Result<Entity> {
        self.backend.take_fault(FaultOp::Create, Some(candidate.kind()))?;
        let row = {
            let mut tables = self.backend.shared.tables.write();
            let row = self.build_row(&tables, candidate)?;
            tables.put(row.clone());
            row
        };
        debug!(kind = %row.kind(), id = %row.id(), user = %self.user.id, "row created");
        self.backend
            .publish(vec![ChangeEvent::entity(ChangeType::Insert, Some(&row), None)]);
        Ok(row)
    }

    async fn update(&self, kind: EntityKind, id: Uuid, patch: &EntityPatch) -> Result<Entity> {
        self.backend.take_fault(FaultOp::Update, Some(kind))?;
        if patch.kind() != kind {
            return Err(BackendError::Invalid(format!("{} patch sent for {kind}", patch.kind())).into());
        }
        for referenced in patch.referenced_ids() {
            durable_ref(referenced, "patch")?;
        }
        let mut events = Vec::new();
        let row = {
            let mut tables = self.backend.shared.tables.write();
            let old = tables
                .get(kind, id)
                .cloned()
                .ok_or_else(|| BackendError::NotFound(format!("{kind} {id} not found")))?;
            tables.require(&self.user.id, &old, AccessLevel::Write)?;

            let new_parent = match patch.new_parent() {
                Some(parent) if Some(parent) != old.parent_id() => {
                    let parent_kind = kind.parent().unwrap_or(EntityKind::Collection);
                    let parent = tables
                        .get(parent_kind, uuid_of(parent))
                        .cloned()
                        .ok_or_else(|| BackendError::Invalid(format!("{parent_kind} {parent} does not exist")))?;
                    tables.require(&self.user.id, &parent, AccessLevel::Write)?;
                    Some(parent)
                }
                _ => None,
            };

            let now = Utc::now();
            let mut row = old.clone();
            row.apply(patch);
            match (&mut row, &new_parent) {
                (Entity::Item(item), parent) => {
                    let group = parent
                        .as_ref()
                        .or_else(|| tables.get(EntityKind::Group, uuid_of(item.group_id)));
                    if let Some(group) = group {
                        item.collection_id = group.collection_id();
                        item.owner_id = group.owner_id().to_string();
                    }
                }
                (Entity::Group(group), Some(parent)) => {
                    group.owner_id = parent.owner_id().to_string();
                }
                _ => {}
            }
            if let Entity::Group(group) = &mut row {
                if group.archived && group.archived_at.is_none() {
                    group.archived_at = Some(now);
                }
            }
            row.touch(now);

            if let (Entity::Group(group), Some(_)) = (&row, &new_parent) {
                let children = tables.children(EntityKind::Group, id);
                for child in children {
                    let mut moved = child.clone();
                    if let Entity::Item(item) = &mut moved {
                        item.collection_id = group.collection_id;
                        item.owner_id = group.owner_id.clone();
                    }
                    moved.touch(now);
                    events.push(ChangeEvent::entity(ChangeType::Update, Some(&moved), Some(&child)));
                    tables.put(moved);
                }
            }
            tables.put(row.clone());
            events.insert(0, ChangeEvent::entity(ChangeType::Update, Some(&row), Some(&old)));
            row
        };
        self.backend.publish(events);
        Ok(row)
    }

    async fn delete(&self, kind: EntityKind, id: Uuid) -> Result<()> {
        self.backend.take_fault(FaultOp::Delete, Some(kind))?;
        let mut events = Vec::new();
        {
            let mut tables = self.backend.shared.tables.write();
            let Some(existing) = tables.get(kind, id).cloned() else {
                return Ok(());
            };
            tables.require(&self.user.id, &existing, AccessLevel::Owner)?;
            let removed = tables.remove_cascade(kind, id, &mut events);
            debug!(%kind, %id, removed, "row deleted");
        }
        self.backend.publish(events);
        Ok(())
    }

    async fn delete_where(&self, kind: EntityKind, filter: &Filter) -> Result<usize> {
        self.backend.take_fault(FaultOp::DeleteWhere, Some(kind))?;
        let mut events = Vec::new();
        let count = {
            let mut tables = self.backend.shared.tables.write();
            let matched: Vec<Entity> = tables
                .table(kind)
                .filter(|e| tables.access(&self.user.id, e).can_read())
                .filter(|e| filter.matches_entity(e))
                .cloned()
                .collect();
            for entity in &matched {
                tables.require(&self.user.id, entity, AccessLevel::Owner)?;
            }
            for entity in &matched {
                tables.remove_cascade(kind, uuid_of(entity.id()), &mut events);
            }
            matched.len()
        };
        self.backend.publish(events);
        Ok(count)
    }

    async fn fetch_view(&self, key: &ViewKey) -> Result<ViewPage> {
        self.backend.take_fault(FaultOp::View, None)?;
        let tables = self.backend.shared.tables.read();
        Ok(self.build_view(&tables, key)?)
    }
}

#[async_trait]
impl AccessControl for MemoryClient {
    async fn check_access(&self, resource: ResourceRef) -> Result<AccessLevel> {
        let tables = self.backend.shared.tables.read();
        let entity = tables.resource(resource)?;
        Ok(tables.access(&self.user.id, entity))
    }

    async fn list_permissions(&self, filter: &PermissionFilter) -> Result<Vec<Permission>> {
        let tables = self.backend.shared.tables.read();
        Ok(tables
            .acl
            .permissions(filter)
            .into_iter()
            .filter(|p| {
                p.user_id == self.user.id
                    || tables
                        .resource(p.resource())
                        .is_ok_and(|e| tables.access(&self.user.id, e) == AccessLevel::Owner)
            })
            .collect())
    }

    async fn create_permission(&self, grant: &NewPermission) -> Result<Permission> {
        let (permission, event) = {
            let mut tables = self.backend.shared.tables.write();
            let resource = tables.resource(grant.resource)?.clone();
            tables.require(&self.user.id, &resource, AccessLevel::Owner)?;
            if resource.owner_id() == grant.user_id {
                return Err(BackendError::Invalid("owner already has full access".into()).into());
            }
            let (permission, inserted) = tables.acl.grant(
                &grant.user_id,
                grant.resource,
                grant.permission_level,
                &self.user.id,
                Utc::now(),
            );
            let kind = if inserted { ChangeType::Insert } else { ChangeType::Update };
            let event = ChangeEvent::permission(kind, Some(&permission), None);
            (permission, event)
        };
        self.backend.publish(vec![event]);
        Ok(permission)
    }

    async fn update_permission(&self, id: Uuid, level: PermissionLevel) -> Result<Permission> {
        let (permission, event) = {
            let mut tables = self.backend.shared.tables.write();
            let old = tables
                .acl
                .permission(id)
                .cloned()
                .ok_or_else(|| BackendError::NotFound(format!("permission {id} not found")))?;
            let resource = tables.resource(old.resource())?.clone();
            tables.require(&self.user.id, &resource, AccessLevel::Owner)?;
            let permission = tables
                .acl
                .set_level(id, level)
                .ok_or_else(|| BackendError::NotFound(format!("permission {id} not found")))?;
            let event = ChangeEvent::permission(ChangeType::Update, Some(&permission), Some(&old));
            (permission, event)
        };
        self.backend.publish(vec![event]);
        Ok(permission)
    }

    async fn delete_permission(&self, id: Uuid) -> Result<()> {
        let event = {
            let mut tables = self.backend.shared.tables.write();
            let Some(existing) = tables.acl.permission(id).cloned() else {
                return Err(BackendError::NotFound(format!("permission {id} not found")).into());
            };
            if existing.user_id != self.user.id {
                let resource = tables.resource(existing.resource())?.clone();
                tables.require(&self.user.id, &resource, AccessLevel::Owner)?;
            }
            tables.acl.revoke(id);
            ChangeEvent::permission(ChangeType::Delete, None, Some(&existing))
        };
        self.backend.publish(vec![event]);
        Ok(())
    }

    async fn create_invitation(&self, invite: &NewInvitation) -> Result<Invitation> {
        let mut tables = self.backend.shared.tables.write();
        let resource = tables.resource(invite.resource)?.clone();
        tables.require(&self.user.id, &resource, AccessLevel::Owner)?;
        let invitation = tables.acl.invite(invite, &self.user.id, Utc::now())?;
        debug!(resource = %invitation.resource_id, invitee = %invitation.invitee_email, "invitation created");
        Ok(invitation)
    }

    async fn accept_invitation(&self, token: &str) -> Result<AcceptedInvitation> {
        let mut events = Vec::new();
        let accepted = {
            let mut tables = self.backend.shared.tables.write();
            let now = Utc::now();
            let plan = tables.acl.accept(token, &self.user, now)?;
            match plan {
                AcceptPlan::AlreadyAccepted(invitation) => AcceptedInvitation {
                    permission: tables
                        .acl
                        .permission_for(&self.user.id, invitation.resource())
                        .cloned(),
                    ownership_transferred: invitation.transfer_ownership_on_accept,
                    invitation,
                },
                AcceptPlan::Grant(invitation) => {
                    tables.resource(invitation.resource())?;
                    let (permission, inserted) = tables.acl.grant(
                        &self.user.id,
                        invitation.resource(),
                        invitation.permission_level,
                        &invitation.invited_by,
                        now,
                    );
                    let kind = if inserted { ChangeType::Insert } else { ChangeType::Update };
                    events.push(ChangeEvent::permission(kind, Some(&permission), None));
                    AcceptedInvitation {
                        invitation,
                        permission: Some(permission),
                        ownership_transferred: false,
                    }
                }
                AcceptPlan::Transfer(invitation) => {
                    let resource = invitation.resource();
                    let previous_owner = tables.resource(resource)?.owner_id().to_string();
                    tables.reassign_owner(resource.resource_id, &self.user.id, &mut events);
                    if let Some(own) = tables.acl.permission_for(&self.user.id, resource).cloned() {
                        tables.acl.revoke(own.id);
                        events.push(ChangeEvent::permission(ChangeType::Delete, None, Some(&own)));
                    }
                    if previous_owner != self.user.id {
                        let (kept, _) = tables.acl.grant(
                            &previous_owner,
                            resource,
                            PermissionLevel::Write,
                            &self.user.id,
                            now,
                        );
                        events.push(ChangeEvent::permission(ChangeType::Insert, Some(&kept), None));
                    }
                    debug!(resource = %resource.resource_id, from = %previous_owner, to = %self.user.id, "ownership transferred");
                    AcceptedInvitation {
                        invitation,
                        permission: None,
                        ownership_transferred: true,
                    }
                }
            }
        };
        self.backend.publish(events);
        Ok(accepted)
    }

    async fn list_invitations(&self, resource: ResourceRef) -> Result<Vec<Invitation>> {
        let tables = self.backend.shared.tables.read();
        let entity = tables.resource(resource)?;
        tables.require(&self.user.id, entity, AccessLevel::Owner)?;
        Ok(tables.acl.invitations_for(resource))
    }
}

#[async_trait]
impl ChangeFeed for MemoryClient {
    async fn subscribe(&self, scope: &SubscriptionScope) -> Result<Subscription> {
        self.backend.take_fault(FaultOp::Subscribe, None)?;
        if scope.user_id != self.user.id {
            return Err(BackendError::Forbidden("cannot subscribe for another user".into()).into());
        }
        let scope = {
            let tables = self.backend.shared.tables.read();
            let mut narrowed = SubscriptionScope::for_user(&self.user.id);
            narrowed.collections = scope
                .collections
                .iter()
                .copied()
                .filter(|id| self.readable(&tables, EntityKind::Collection, *id).is_ok())
                .collect();
            narrowed.groups = scope
                .groups
                .iter()
                .copied()
                .filter(|id| self.readable(&tables, EntityKind::Group, *id).is_ok())
                .collect();
            narrowed
        };

        let mut rx = self.backend.shared.events.subscribe();
        let mut resets = self.backend.shared.resets.subscribe();
        let (tx, events) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let user = self.user.id.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = resets.changed() => {
                        let _ = tx.send(FeedMessage::Error("connection reset by server".into())).await;
                        break;
                    }
                    _ = tx.closed() => break,
                    event = rx.recv() => match event {
                        Ok(event) => {
                            if scope.admits(&event) && tx.send(FeedMessage::Change(event)).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(%user, missed, "change feed lagged");
                            let _ = tx.send(FeedMessage::Error(format!("feed lagged by {missed} events"))).await;
                            break;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        });
        let handle = SubscriptionHandle(Uuid::new_v4());
        self.subscriptions.lock().insert(handle, task);
        Ok(Subscription { handle, events })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        if let Some(task) = self.subscriptions.lock().remove(&handle) {
            task.abort();
        }
    }
}

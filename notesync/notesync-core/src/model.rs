//! Entity types shared by the store, the mutation pipeline and the backends.
//!
//! Three owned kinds form a strict tree under a user: collections (folders)
//! hold groups (notebooks), groups hold items (notes). Permissions and
//! invitations live beside the tree and reference a collection or a group.

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const TEMP_PREFIX: &str = "temp:";

pub const DEFAULT_COLOR: &str = "#6b7280";

/// Identifier of a tree entity.
///
/// `Temp` ids are minted locally for optimistic creates and never reach the
/// backend; `Durable` ids are assigned by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityId {
    Temp(u64),
    Durable(Uuid),
}

impl EntityId {
    pub fn is_temp(&self) -> bool {
        matches!(self, EntityId::Temp(_))
    }

    pub fn durable(&self) -> Option<Uuid> {
        match self {
            EntityId::Durable(id) => Some(*id),
            EntityId::Temp(_) => None,
        }
    }
}

impl From<Uuid> for EntityId {
    fn from(id: Uuid) -> Self {
        EntityId::Durable(id)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Temp(n) => write!(f, "{}{}", TEMP_PREFIX, n),
            EntityId::Durable(id) => write!(f, "{}", id),
        }
    }
}

impl FromStr for EntityId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(n) = s.strip_prefix(TEMP_PREFIX) {
            return n
                .parse::<u64>()
                .map(EntityId::Temp)
                .map_err(|e| format!("invalid temp id {s:?}: {e}"));
        }
        Uuid::parse_str(s)
            .map(EntityId::Durable)
            .map_err(|e| format!("invalid id {s:?}: {e}"))
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// The three kinds of tree entities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Collection,
    Group,
    Item,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Collection, EntityKind::Group, EntityKind::Item];

    /// Table name used by the change feed and the HTTP routes.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Collection => "folders",
            EntityKind::Group => "notebooks",
            EntityKind::Item => "notes",
        }
    }

    pub fn from_table(table: &str) -> Option<Self> {
        match table {
            "folders" => Some(EntityKind::Collection),
            "notebooks" => Some(EntityKind::Group),
            "notes" => Some(EntityKind::Item),
            _ => None,
        }
    }

    pub fn parent(&self) -> Option<EntityKind> {
        match self {
            EntityKind::Collection => None,
            EntityKind::Group => Some(EntityKind::Collection),
            EntityKind::Item => Some(EntityKind::Group),
        }
    }

    pub fn child(&self) -> Option<EntityKind> {
        match self {
            EntityKind::Collection => Some(EntityKind::Group),
            EntityKind::Group => Some(EntityKind::Item),
            EntityKind::Item => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: EntityId,
    pub owner_id: String,
    pub name: String,
    pub color: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: EntityId,
    pub owner_id: String,
    pub collection_id: EntityId,
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sort_order: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: EntityId,
    pub owner_id: String,
    pub group_id: EntityId,
    /// Denormalized from the parent group.
    pub collection_id: EntityId,
    pub title: String,
    #[serde(default)]
    pub content: String,
    pub position: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Any tree entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    Collection(Collection),
    Group(Group),
    Item(Item),
}

impl Entity {
    pub fn id(&self) -> EntityId {
        match self {
            Entity::Collection(c) => c.id,
            Entity::Group(g) => g.id,
            Entity::Item(i) => i.id,
        }
    }

    pub fn set_id(&mut self, id: EntityId) {
        match self {
            Entity::Collection(c) => c.id = id,
            Entity::Group(g) => g.id = id,
            Entity::Item(i) => i.id = id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Collection(_) => EntityKind::Collection,
            Entity::Group(_) => EntityKind::Group,
            Entity::Item(_) => EntityKind::Item,
        }
    }

    pub fn owner_id(&self) -> &str {
        match self {
            Entity::Collection(c) => &c.owner_id,
            Entity::Group(g) => &g.owner_id,
            Entity::Item(i) => &i.owner_id,
        }
    }

    pub fn set_owner_id(&mut self, owner: &str) {
        match self {
            Entity::Collection(c) => c.owner_id = owner.to_string(),
            Entity::Group(g) => g.owner_id = owner.to_string(),
            Entity::Item(i) => i.owner_id = owner.to_string(),
        }
    }

    /// Direct parent reference, if the kind has one.
    pub fn parent_id(&self) -> Option<EntityId> {
        match self {
            Entity::Collection(_) => None,
            Entity::Group(g) => Some(g.collection_id),
            Entity::Item(i) => Some(i.group_id),
        }
    }

    /// Collection the entity lives under (itself for collections).
    pub fn collection_id(&self) -> EntityId {
        match self {
            Entity::Collection(c) => c.id,
            Entity::Group(g) => g.collection_id,
            Entity::Item(i) => i.collection_id,
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            Entity::Collection(c) => c.updated_at,
            Entity::Group(g) => g.updated_at,
            Entity::Item(i) => i.updated_at,
        }
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        match self {
            Entity::Collection(c) => c.updated_at = at,
            Entity::Group(g) => g.updated_at = at,
            Entity::Item(i) => i.updated_at = at,
        }
    }

    /// Shallow merge of `patch` into the entity. Returns `false` without
    /// touching anything when the patch targets another kind.
    pub fn apply(&mut self, patch: &EntityPatch) -> bool {
        match (self, patch) {
            (Entity::Collection(c), EntityPatch::Collection(p)) => {
                if let Some(name) = &p.name {
                    c.name = name.clone();
                }
                if let Some(color) = &p.color {
                    c.color = color.clone();
                }
                true
            }
            (Entity::Group(g), EntityPatch::Group(p)) => {
                if let Some(name) = &p.name {
                    g.name = name.clone();
                }
                if let Some(color) = &p.color {
                    g.color = color.clone();
                }
                if let Some(collection_id) = p.collection_id {
                    g.collection_id = collection_id;
                }
                if let Some(archived) = p.archived {
                    g.archived = archived;
                    g.archived_at = if archived { p.archived_at.or(g.archived_at) } else { None };
                }
                if let Some(sort_order) = p.sort_order {
                    g.sort_order = sort_order;
                }
                true
            }
            (Entity::Item(i), EntityPatch::Item(p)) => {
                if let Some(title) = &p.title {
                    i.title = title.clone();
                }
                if let Some(content) = &p.content {
                    i.content = content.clone();
                }
                if let Some(position) = p.position {
                    i.position = position;
                }
                if let Some(group_id) = p.group_id {
                    i.group_id = group_id;
                }
                if let Some(collection_id) = p.collection_id {
                    i.collection_id = collection_id;
                }
                true
            }
            _ => false,
        }
    }

    pub fn as_collection(&self) -> Option<&Collection> {
        match self {
            Entity::Collection(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_group(&self) -> Option<&Group> {
        match self {
            Entity::Group(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_item(&self) -> Option<&Item> {
        match self {
            Entity::Item(i) => Some(i),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
    /// Only read together with `archived: Some(true)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<EntityId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityPatch {
    Collection(CollectionPatch),
    Group(GroupPatch),
    Item(ItemPatch),
}

impl EntityPatch {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityPatch::Collection(_) => EntityKind::Collection,
            EntityPatch::Group(_) => EntityKind::Group,
            EntityPatch::Item(_) => EntityKind::Item,
        }
    }

    /// New parent carried by the patch, if it re-parents the entity.
    pub fn new_parent(&self) -> Option<EntityId> {
        match self {
            EntityPatch::Collection(_) => None,
            EntityPatch::Group(p) => p.collection_id,
            EntityPatch::Item(p) => p.group_id,
        }
    }

    /// Every id the patch references.
    pub fn referenced_ids(&self) -> Vec<EntityId> {
        match self {
            EntityPatch::Collection(_) => Vec::new(),
            EntityPatch::Group(p) => p.collection_id.into_iter().collect(),
            EntityPatch::Item(p) => p.group_id.into_iter().chain(p.collection_id).collect(),
        }
    }
}

/// Kinds of resources a permission or invitation can target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Collection,
    Group,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Collection => "collection",
            ResourceType::Group => "group",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "collection" => Some(ResourceType::Collection),
            "group" => Some(ResourceType::Group),
            _ => None,
        }
    }

    pub fn entity_kind(&self) -> EntityKind {
        match self {
            ResourceType::Collection => EntityKind::Collection,
            ResourceType::Group => EntityKind::Group,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub resource_type: ResourceType,
    pub resource_id: Uuid,
}

impl ResourceRef {
    pub fn collection(id: Uuid) -> Self {
        Self {
            resource_type: ResourceType::Collection,
            resource_id: id,
        }
    }

    pub fn group(id: Uuid) -> Self {
        Self {
            resource_type: ResourceType::Group,
            resource_id: id,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    Read,
    Write,
}

/// Effective access of a user on a resource, ordered from weakest to strongest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    None,
    Read,
    Write,
    Owner,
}

impl AccessLevel {
    pub fn can_read(&self) -> bool {
        *self >= AccessLevel::Read
    }

    pub fn can_write(&self) -> bool {
        *self >= AccessLevel::Write
    }
}

impl From<PermissionLevel> for AccessLevel {
    fn from(level: PermissionLevel) -> Self {
        match level {
            PermissionLevel::Read => AccessLevel::Read,
            PermissionLevel::Write => AccessLevel::Write,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    pub id: Uuid,
    pub user_id: String,
    pub resource_type: ResourceType,
    pub resource_id: Uuid,
    pub permission_level: PermissionLevel,
    pub granted_by: String,
    pub granted_at: DateTime<Utc>,
}

impl Permission {
    pub fn resource(&self) -> ResourceRef {
        ResourceRef {
            resource_type: self.resource_type,
            resource_id: self.resource_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Invitation {
    pub id: Uuid,
    pub token: String,
    pub resource_type: ResourceType,
    pub resource_id: Uuid,
    pub invitee_email: String,
    pub permission_level: PermissionLevel,
    pub invited_by: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub accepted_by: Option<String>,
    #[serde(default)]
    pub transfer_ownership_on_accept: bool,
}

impl Invitation {
    pub fn resource(&self) -> ResourceRef {
        ResourceRef {
            resource_type: self.resource_type,
            resource_id: self.resource_id,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// The signed-in user as seen by the sync layer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserContext {
    pub id: String,
    pub email: String,
}

impl UserContext {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
        }
    }
}

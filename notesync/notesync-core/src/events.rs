use crate::model::{Entity, EntityKind, Permission};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub const PERMISSIONS_TABLE: &str = "permissions";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

/// One row change pushed by the durable store: `{table, eventType, new, old}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub table: String,
    pub event_type: ChangeType,
    #[serde(default)]
    pub new: Option<serde_json::Value>,
    #[serde(default)]
    pub old: Option<serde_json::Value>,
}

impl ChangeEvent {
    pub fn entity(event_type: ChangeType, new: Option<&Entity>, old: Option<&Entity>) -> Self {
        let kind = new.or(old).map_or(EntityKind::Item, Entity::kind);
        Self {
            table: kind.table().to_string(),
            event_type,
            new: new.and_then(|e| serde_json::to_value(e).ok()),
            old: old.and_then(|e| serde_json::to_value(e).ok()),
        }
    }

    pub fn permission(event_type: ChangeType, new: Option<&Permission>, old: Option<&Permission>) -> Self {
        Self {
            table: PERMISSIONS_TABLE.to_string(),
            event_type,
            new: new.and_then(|p| serde_json::to_value(p).ok()),
            old: old.and_then(|p| serde_json::to_value(p).ok()),
        }
    }

    pub fn kind(&self) -> Option<EntityKind> {
        EntityKind::from_table(&self.table)
    }

    /// The row after the change, or before it for deletes.
    pub fn record(&self) -> Option<&serde_json::Value> {
        match self.event_type {
            ChangeType::Delete => self.old.as_ref().or(self.new.as_ref()),
            _ => self.new.as_ref().or(self.old.as_ref()),
        }
    }

    pub fn field_str(&self, field: &str) -> Option<&str> {
        self.record()?.get(field)?.as_str()
    }

    pub fn field_uuid(&self, field: &str) -> Option<Uuid> {
        self.field_str(field).and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn record_id(&self) -> Option<Uuid> {
        self.field_uuid("id")
    }
}

/// In-process fan-out of change events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ChangeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    pub fn send(&self, event: ChangeEvent) {
        let _ = self.tx.send(event);
    }
}

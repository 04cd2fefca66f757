//! Durable-store seam.
//!
//! The sync core talks to persistence, access control and the change feed
//! through the traits here and in [`crate::acl`] / [`crate::realtime`].
//! Two implementations ship: [`MemoryBackend`] for tests and the reference
//! server, and [`HttpBackend`] for talking to that server over the wire.

use crate::model::{Entity, EntityKind, EntityPatch};
use crate::view::{ViewKey, ViewPage};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use uuid::Uuid;

pub mod http;
pub mod memory;

pub use http::HttpBackend;
pub use memory::{FaultOp, MemoryBackend, MemoryClient};

/// One predicate on a top-level field of the JSON form of a row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Eq { field: String, value: Value },
    Gte { field: String, value: Value },
    Lte { field: String, value: Value },
}

/// Conjunction of conditions. The empty filter matches every row.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Serialize) -> Self {
        self.conditions.push(Condition::Eq {
            field: field.to_string(),
            value: serde_json::to_value(value).unwrap_or(Value::Null),
        });
        self
    }

    pub fn gte(mut self, field: &str, value: impl Serialize) -> Self {
        self.conditions.push(Condition::Gte {
            field: field.to_string(),
            value: serde_json::to_value(value).unwrap_or(Value::Null),
        });
        self
    }

    pub fn lte(mut self, field: &str, value: impl Serialize) -> Self {
        self.conditions.push(Condition::Lte {
            field: field.to_string(),
            value: serde_json::to_value(value).unwrap_or(Value::Null),
        });
        self
    }

    pub fn matches(&self, record: &Value) -> bool {
        self.conditions.iter().all(|condition| match condition {
            Condition::Eq { field, value } => record.get(field) == Some(value),
            Condition::Gte { field, value } => record
                .get(field)
                .and_then(|v| compare(v, value))
                .is_some_and(|o| o != Ordering::Less),
            Condition::Lte { field, value } => record
                .get(field)
                .and_then(|v| compare(v, value))
                .is_some_and(|o| o != Ordering::Greater),
        })
    }

    pub fn matches_entity(&self, entity: &Entity) -> bool {
        if self.conditions.is_empty() {
            return true;
        }
        serde_json::to_value(entity).is_ok_and(|v| self.matches(&v))
    }
}

/// Row storage with the durable store's semantics: the backend assigns
/// ids, owners and timestamps, and every call is checked against the
/// caller's access.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn list(&self, kind: EntityKind, filter: &Filter) -> Result<Vec<Entity>>;
    async fn get_by_id(&self, kind: EntityKind, id: Uuid) -> Result<Option<Entity>>;
    /// Persist a candidate row. Its id, owner and timestamps are ignored
    /// and the stored row is returned.
    async fn create(&self, candidate: &Entity) -> Result<Entity>;
    async fn update(&self, kind: EntityKind, id: Uuid, patch: &EntityPatch) -> Result<Entity>;
    /// Delete a row and everything under it.
    async fn delete(&self, kind: EntityKind, id: Uuid) -> Result<()>;
    /// Delete every matching row; returns how many went.
    async fn delete_where(&self, kind: EntityKind, filter: &Filter) -> Result<usize>;
    async fn fetch_view(&self, key: &ViewKey) -> Result<ViewPage>;
}

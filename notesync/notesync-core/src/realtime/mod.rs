//! Live reconciliation of server-pushed row changes into the entity store.
//!
//! The reconciler subscribes to the change feed for everything the user can
//! see, applies each event with the store primitives, and invalidates the
//! views the change touches. Lost connections and connect timeouts are
//! retried with capped exponential backoff until `max_attempts` is spent,
//! after which live sync is reported unavailable.

use crate::acl::{AccessControl, PermissionFilter};
use crate::config::RealtimeConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{ChangeEvent, ChangeType, PERMISSIONS_TABLE};
use crate::model::{Entity, EntityId, EntityKind, ResourceType, UserContext};
use crate::store::EntityStore;
use crate::view::{slots, ViewCache};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;


#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionHandle(pub Uuid);

/// The rows a subscription wants to hear about.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionScope {
    pub user_id: String,
    #[serde(default)]
    pub collections: BTreeSet<Uuid>,
    #[serde(default)]
    pub groups: BTreeSet<Uuid>,
}

impl SubscriptionScope {
    pub fn for_user(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            ..Default::default()
        }
    }

    pub fn admits(&self, event: &ChangeEvent) -> bool {
        if event.table == PERMISSIONS_TABLE {
            return event.field_str("user_id") == Some(self.user_id.as_str());
        }
        if event.field_str("owner_id") == Some(self.user_id.as_str()) {
            return true;
        }
        let in_collections = |field: &str| {
            event
                .field_uuid(field)
                .is_some_and(|id| self.collections.contains(&id))
        };
        let in_groups = |field: &str| {
            event
                .field_uuid(field)
                .is_some_and(|id| self.groups.contains(&id))
        };
        match event.kind() {
            Some(EntityKind::Collection) => in_collections("id"),
            Some(EntityKind::Group) => in_groups("id") || in_collections("collection_id"),
            Some(EntityKind::Item) => in_groups("group_id") || in_collections("collection_id"),
            None => false,
        }
    }
}

/// What a subscription delivers.
#[derive(Clone, Debug, PartialEq)]
pub enum FeedMessage {
    Change(ChangeEvent),
    /// The connection broke; no further messages follow.
    Error(String),
}

pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub events: mpsc::Receiver<FeedMessage>,
}

/// Push channel of row changes, delivered at least once.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, scope: &SubscriptionScope) -> Result<Subscription>;
    async fn unsubscribe(&self, handle: SubscriptionHandle);
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Errored { reason: String },
    TimedOut,
    Reconnecting { attempt: u32 },
    /// Reconnects exhausted; live sync is unavailable until `connect` is
    /// called again.
    Failed { attempts: u32 },
}

/// Effect of one event on the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Updated,
    Removed,
    Ignored,
    /// The user's own permissions changed; the subscription scope is stale.
    Rescope,
}

enum StreamEnd {
    Rescope,
    Lost(String),
}

struct Inner {
    store: Arc<EntityStore>,
    views: Arc<ViewCache>,
    feed: Arc<dyn ChangeFeed>,
    acl: Arc<dyn AccessControl>,
    user: UserContext,
    config: RealtimeConfig,
    state: watch::Sender<ConnectionState>,
    handle: Mutex<Option<SubscriptionHandle>>,
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        debug!(?state, "realtime state");
        self.state.send_replace(state);
    }

    async fn scope(&self) -> Result<SubscriptionScope> {
        let mut scope = SubscriptionScope::for_user(&self.user.id);
        scope.collections = self.store.read(|view| {
            view.collections()
                .iter()
                .filter_map(|c| c.id.durable())
                .collect()
        });
        let granted = self
            .acl
            .list_permissions(&PermissionFilter::for_user(self.user.id.clone()))
            .await?;
        for permission in granted {
            match permission.resource_type {
                ResourceType::Collection => scope.collections.insert(permission.resource_id),
                ResourceType::Group => scope.groups.insert(permission.resource_id),
            };
        }
        Ok(scope)
    }

    async fn open(&self) -> Result<Subscription, ConnectionState> {
        let attempt = async {
            let scope = self.scope().await?;
            debug!(
                collections = scope.collections.len(),
                groups = scope.groups.len(),
                "subscribing to change feed"
            );
            self.feed.subscribe(&scope).await
        };
        match tokio::time::timeout(self.config.connect_timeout(), attempt).await {
            Err(_) => {
                warn!(timeout = ?self.config.connect_timeout(), "change feed connect timed out");
                Err(ConnectionState::TimedOut)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "change feed connect failed");
                Err(ConnectionState::Errored {
                    reason: e.to_string(),
                })
            }
            Ok(Ok(subscription)) => Ok(subscription),
        }
    }

    async fn pump(&self, mut events: mpsc::Receiver<FeedMessage>) -> StreamEnd {
        while let Some(message) = events.recv().await {
            match message {
                FeedMessage::Change(event) => {
                    if self.apply(&event) == Applied::Rescope {
                        return StreamEnd::Rescope;
                    }
                }
                FeedMessage::Error(reason) => return StreamEnd::Lost(reason),
            }
        }
        StreamEnd::Lost("change feed closed".into())
    }

    async fn run(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        self.set_state(ConnectionState::Connecting);
        loop {
            match self.open().await {
                Ok(subscription) => {
                    attempt = 0;
                    let handle = subscription.handle;
                    *self.handle.lock() = Some(handle);
                    self.set_state(ConnectionState::Connected);
                    info!(user = %self.user.id, "live sync connected");

                    let end = self.pump(subscription.events).await;
                    self.handle.lock().take();
                    self.feed.unsubscribe(handle).await;
                    match end {
                        StreamEnd::Rescope => {
                            info!(user = %self.user.id, "permissions changed, re-subscribing");
                            self.views.invalidate(slots::FOLDERS);
                            self.set_state(ConnectionState::Connecting);
                            continue;
                        }
                        StreamEnd::Lost(reason) => {
                            warn!(%reason, "live sync connection lost");
                            self.set_state(ConnectionState::Errored { reason });
                        }
                    }
                }
                Err(failure) => self.set_state(failure),
            }

            attempt += 1;
            if attempt > self.config.max_attempts {
                warn!(attempts = self.config.max_attempts, "live sync unavailable");
                self.set_state(ConnectionState::Failed {
                    attempts: self.config.max_attempts,
                });
                return;
            }
            let delay = self.config.backoff(attempt);
            self.set_state(ConnectionState::Reconnecting { attempt });
            warn!(attempt, ?delay, "reconnecting change feed");
            tokio::time::sleep(delay).await;
        }
    }

    fn apply(&self, event: &ChangeEvent) -> Applied {
        if event.table == PERMISSIONS_TABLE {
            return if event.field_str("user_id") == Some(self.user.id.as_str()) {
                Applied::Rescope
            } else {
                Applied::Ignored
            };
        }
        let Some(kind) = event.kind() else {
            debug!(table = %event.table, "change on unknown table ignored");
            return Applied::Ignored;
        };

        if event.event_type == ChangeType::Delete {
            let Some(id) = event.record_id() else {
                return Applied::Ignored;
            };
            let removed = self.store.remove(kind, EntityId::Durable(id));
            return match removed.first() {
                Some(root) => {
                    self.views.invalidate_entity(root);
                    Applied::Removed
                }
                None => Applied::Ignored,
            };
        }

        let Some(record) = event.record() else {
            return Applied::Ignored;
        };
        let entity: Entity = match serde_json::from_value(record.clone()) {
            Ok(entity) => entity,
            Err(e) => {
                warn!(table = %event.table, error = %e, "undecodable change event");
                return Applied::Ignored;
            }
        };
        if entity.kind() != kind || entity.id().is_temp() {
            return Applied::Ignored;
        }

        let previous = self.store.get(kind, entity.id());
        let applied = match (event.event_type, &previous) {
            (ChangeType::Update, None) => return Applied::Ignored,
            (_, Some(_)) => Applied::Updated,
            (_, None) => Applied::Inserted,
        };
        self.store.replace(entity.clone());
        self.views.invalidate_entity(&entity);
        if let Some(previous) = previous.filter(|p| p.parent_id() != entity.parent_id()) {
            self.views.invalidate_entity(&previous);
        }
        applied
    }
}

/// Owns the change-feed subscription of one session.
pub struct Reconciler {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<EntityStore>,
        views: Arc<ViewCache>,
        feed: Arc<dyn ChangeFeed>,
        acl: Arc<dyn AccessControl>,
        user: UserContext,
        config: RealtimeConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                store,
                views,
                feed,
                acl,
                user,
                config,
                state,
                handle: Mutex::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    /// Start the connection loop unless it is already running.
    pub fn connect(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(inner.run()));
    }

    /// Stop the loop, drop the subscription and reset to `Disconnected`.
    pub async fn disconnect(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        let handle = self.inner.handle.lock().take();
        if let Some(handle) = handle {
            self.inner.feed.unsubscribe(handle).await;
        }
        self.inner.set_state(ConnectionState::Disconnected);
        info!(user = %self.inner.user.id, "live sync disconnected");
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// `Err(RealtimeUnavailable)` once reconnects are exhausted.
    pub fn ensure_live(&self) -> SyncResult<()> {
        match self.state() {
            ConnectionState::Failed { attempts } => Err(SyncError::RealtimeUnavailable { attempts }),
            _ => Ok(()),
        }
    }

    /// Scope a subscription opened now would use.
    pub async fn scope(&self) -> Result<SubscriptionScope> {
        self.inner.scope().await
    }

    /// Apply one change event to the store. Safe to call repeatedly with
    /// the same event.
    pub fn apply_event(&self, event: &ChangeEvent) -> Applied {
        self.inner.apply(event)
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

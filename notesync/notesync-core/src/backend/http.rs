//! Client for the reference server.
//!
//! Rows travel as the same JSON the in-memory backend stores. Errors come
//! back as status codes and are mapped onto [`BackendError`]; the change
//! feed is a server-sent event stream on `/changes`.

use super::{Backend, Filter};
use crate::acl::{AcceptedInvitation, AccessControl, NewInvitation, NewPermission, PermissionFilter};
use crate::error::BackendError;
use crate::events::ChangeEvent;
use crate::model::{
    AccessLevel, Entity, EntityKind, EntityPatch, Invitation, Permission, PermissionLevel,
    ResourceRef, UserContext,
};
use crate::realtime::{ChangeFeed, FeedMessage, Subscription, SubscriptionHandle, SubscriptionScope};
use crate::view::{ViewKey, ViewPage};
use anyhow::Result;
use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

const FEED_BUFFER: usize = 128;

pub const USER_ID_HEADER: &str = "X-User-Id";
pub const USER_EMAIL_HEADER: &str = "X-User-Email";

/// Body of `GET /access/{type}/{id}`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccessReply {
    pub level: AccessLevel,
}

/// Body of `PATCH /permissions/{id}`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LevelChange {
    pub permission_level: PermissionLevel,
}

/// Body of `POST /tables/{table}/delete`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Deleted {
    pub deleted: usize,
}

/// Query string of `GET /changes`: comma-separated resource ids.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeParams {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub collections: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub groups: String,
}

impl ScopeParams {
    pub fn from_scope(scope: &SubscriptionScope) -> Self {
        let join = |ids: &std::collections::BTreeSet<Uuid>| {
            ids.iter().map(Uuid::to_string).collect::<Vec<_>>().join(",")
        };
        Self {
            collections: join(&scope.collections),
            groups: join(&scope.groups),
        }
    }

    /// Scope for `user_id`; unparsable ids are dropped.
    pub fn into_scope(self, user_id: &str) -> SubscriptionScope {
        let split = |raw: &str| {
            raw.split(',')
                .filter_map(|s| Uuid::parse_str(s.trim()).ok())
                .collect()
        };
        SubscriptionScope {
            user_id: user_id.to_string(),
            collections: split(&self.collections),
            groups: split(&self.groups),
        }
    }
}

fn transport_error(e: reqwest::Error) -> anyhow::Error {
    BackendError::Unavailable(e.to_string()).into()
}

/// One server-sent event frame. Comments and keep-alives yield `None`.
fn parse_frame(frame: &str) -> Option<FeedMessage> {
    let mut event = None;
    let mut data = String::new();
    for line in frame.lines() {
        if let Some(name) = line.strip_prefix("event:") {
            event = Some(name.trim());
        } else if let Some(value) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(value.strip_prefix(' ').unwrap_or(value));
        }
    }
    if data.is_empty() {
        return None;
    }
    match event {
        Some("error") => Some(FeedMessage::Error(data)),
        _ => match serde_json::from_str::<ChangeEvent>(&data) {
            Ok(change) => Some(FeedMessage::Change(change)),
            Err(e) => {
                warn!(error = %e, "undecodable change frame");
                None
            }
        },
    }
}

fn frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n").map(|p| p + 2)
}

async fn forward(response: Response, tx: mpsc::Sender<FeedMessage>) {
    let mut stream = response.bytes_stream();
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => buffer.extend_from_slice(&bytes),
            Err(e) => {
                let _ = tx.send(FeedMessage::Error(e.to_string())).await;
                return;
            }
        }
        while let Some(end) = frame_end(&buffer) {
            let frame = buffer.split_to(end);
            let Some(message) = parse_frame(&String::from_utf8_lossy(&frame)) else {
                continue;
            };
            if tx.send(message).await.is_err() {
                return;
            }
        }
    }
    let _ = tx
        .send(FeedMessage::Error("change stream ended".into()))
        .await;
}

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    user: UserContext,
    token: Option<String>,
    subscriptions: Mutex<HashMap<SubscriptionHandle, JoinHandle<()>>>,
}

impl HttpBackend {
    /// Identify as `user` through the `X-User-*` headers.
    pub fn new(base_url: impl Into<String>, user: UserContext) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user,
            token: None,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Authenticate with a bearer token instead of the identity headers.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn user(&self) -> &UserContext {
        &self.user
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder
                .header(USER_ID_HEADER, &self.user.id)
                .header(USER_EMAIL_HEADER, &self.user.email),
        }
    }

    async fn send(builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(BackendError::from_http_status(status.as_u16(), body).into())
    }

    async fn json<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T> {
        Self::send(builder).await?.json().await.map_err(transport_error)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn list(&self, kind: EntityKind, filter: &Filter) -> Result<Vec<Entity>> {
        let path = format!("/tables/{}/query", kind.table());
        Self::json(self.request(Method::POST, &path).json(filter)).await
    }

    async fn get_by_id(&self, kind: EntityKind, id: Uuid) -> Result<Option<Entity>> {
        let path = format!("/tables/{}/{}", kind.table(), id);
        match Self::json(self.request(Method::GET, &path)).await {
            Ok(entity) => Ok(Some(entity)),
            Err(e) if matches!(BackendError::classify(&e), Some(BackendError::NotFound(_))) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create(&self, candidate: &Entity) -> Result<Entity> {
        let path = format!("/tables/{}", candidate.kind().table());
        Self::json(self.request(Method::POST, &path).json(candidate)).await
    }

    async fn update(&self, kind: EntityKind, id: Uuid, patch: &EntityPatch) -> Result<Entity> {
        let path = format!("/tables/{}/{}", kind.table(), id);
        Self::json(self.request(Method::PATCH, &path).json(patch)).await
    }

    async fn delete(&self, kind: EntityKind, id: Uuid) -> Result<()> {
        let path = format!("/tables/{}/{}", kind.table(), id);
        Self::send(self.request(Method::DELETE, &path)).await?;
        Ok(())
    }

    async fn delete_where(&self, kind: EntityKind, filter: &Filter) -> Result<usize> {
        let path = format!("/tables/{}/delete", kind.table());
        let deleted: Deleted = Self::json(self.request(Method::POST, &path).json(filter)).await?;
        Ok(deleted.deleted)
    }

    async fn fetch_view(&self, key: &ViewKey) -> Result<ViewPage> {
        let path = format!("/views/{}", key.slot);
        Self::json(self.request(Method::GET, &path).query(&key.params())).await
    }
}

#[async_trait]
impl AccessControl for HttpBackend {
    async fn check_access(&self, resource: ResourceRef) -> Result<AccessLevel> {
        let path = format!(
            "/access/{}/{}",
            resource.resource_type.as_str(),
            resource.resource_id
        );
        let reply: AccessReply = Self::json(self.request(Method::GET, &path)).await?;
        Ok(reply.level)
    }

    async fn list_permissions(&self, filter: &PermissionFilter) -> Result<Vec<Permission>> {
        Self::json(self.request(Method::GET, "/permissions").query(filter)).await
    }

    async fn create_permission(&self, grant: &NewPermission) -> Result<Permission> {
        Self::json(self.request(Method::POST, "/permissions").json(grant)).await
    }

    async fn update_permission(&self, id: Uuid, level: PermissionLevel) -> Result<Permission> {
        let body = LevelChange {
            permission_level: level,
        };
        Self::json(
            self.request(Method::PATCH, &format!("/permissions/{id}"))
                .json(&body),
        )
        .await
    }

    async fn delete_permission(&self, id: Uuid) -> Result<()> {
        Self::send(self.request(Method::DELETE, &format!("/permissions/{id}"))).await?;
        Ok(())
    }

    async fn create_invitation(&self, invite: &NewInvitation) -> Result<Invitation> {
        Self::json(self.request(Method::POST, "/invitations").json(invite)).await
    }

    async fn accept_invitation(&self, token: &str) -> Result<AcceptedInvitation> {
        let path = format!("/invitations/{token}/accept");
        Self::json(self.request(Method::POST, &path)).await
    }

    async fn list_invitations(&self, resource: ResourceRef) -> Result<Vec<Invitation>> {
        Self::json(self.request(Method::GET, "/invitations").query(&resource)).await
    }
}

#[async_trait]
impl ChangeFeed for HttpBackend {
    async fn subscribe(&self, scope: &SubscriptionScope) -> Result<Subscription> {
        let params = ScopeParams::from_scope(scope);
        let response = Self::send(self.request(Method::GET, "/changes").query(&params)).await?;
        let (tx, events) = mpsc::channel(FEED_BUFFER);
        let handle = SubscriptionHandle(Uuid::new_v4());
        let task = tokio::spawn(forward(response, tx));
        self.subscriptions.lock().insert(handle, task);
        debug!(user = %self.user.id, ?handle, "change stream opened");
        Ok(Subscription { handle, events })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        if let Some(task) = self.subscriptions.lock().remove(&handle) {
            task.abort();
        }
    }
}

impl Drop for HttpBackend {
    fn drop(&mut self) {
        for (_, task) in self.subscriptions.lock().drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChangeType;
    use std::collections::BTreeSet;

    #[test]
    fn parses_change_and_error_frames() {
        let event = ChangeEvent {
            table: "items".into(),
            event_type: ChangeType::Insert,
            new: Some(serde_json::json!({"id": "x"})),
            old: None,
        };
        let frame = format!("data: {}\n\n", serde_json::to_string(&event).unwrap());
        assert_eq!(parse_frame(&frame), Some(FeedMessage::Change(event)));

        assert_eq!(
            parse_frame("event: error\ndata: lagged\n\n"),
            Some(FeedMessage::Error("lagged".into()))
        );
        assert_eq!(parse_frame(":\n\n"), None);
        assert_eq!(parse_frame("data: {not json}\n\n"), None);
    }

    #[test]
    fn frames_split_on_blank_lines() {
        let mut buffer = BytesMut::from(&b"data: 1\n\ndata: 2"[..]);
        let end = frame_end(&buffer).unwrap();
        assert_eq!(&buffer.split_to(end)[..], b"data: 1\n\n");
        assert_eq!(frame_end(&buffer), None);
    }

    #[test]
    fn scope_params_round_trip_through_query_string() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let scope = SubscriptionScope {
            user_id: "alice".into(),
            collections: BTreeSet::from([a, b]),
            groups: BTreeSet::new(),
        };
        let params = ScopeParams::from_scope(&scope);
        assert!(params.groups.is_empty());
        assert_eq!(params.into_scope("alice"), scope);

        let junk = ScopeParams {
            collections: format!("{a},nope,"),
            groups: String::new(),
        };
        assert_eq!(junk.into_scope("bob").collections, BTreeSet::from([a]));
    }
}

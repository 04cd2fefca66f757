//! HTTP API over the in-memory durable store.
//!
//! Every request acts as the caller identified by [`AuthContext`]; access
//! checks happen in the store, and its [`BackendError`]s become status codes.

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{
        sse::{self, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, patch, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use notesync_core::acl::{
    AcceptedInvitation, AccessControl, NewInvitation, NewPermission, PermissionFilter,
};
use notesync_core::auth::TokenVerifier;
use notesync_core::backend::http::{
    AccessReply, Deleted, LevelChange, ScopeParams, USER_EMAIL_HEADER, USER_ID_HEADER,
};
use notesync_core::backend::{Backend, Filter, MemoryBackend, MemoryClient};
use notesync_core::model::{
    Entity, EntityKind, EntityPatch, Invitation, Permission, ResourceRef, ResourceType,
    UserContext,
};
use notesync_core::realtime::{ChangeFeed, FeedMessage};
use notesync_core::view::{ViewKey, ViewPage, ViewParams};
use notesync_core::BackendError;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error};
use uuid::Uuid;

/// Authentication context extracted from request headers.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub user: UserContext,
}

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;
        if let Some(auth) = headers.get("Authorization").and_then(|v| v.to_str().ok()) {
            if let Some(token) = auth.strip_prefix("Bearer ") {
                if let Some(claims) = state.verifier.verify(token).await {
                    return Ok(Self {
                        user: claims.user(),
                    });
                }
            }
        }
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        };
        match header(USER_ID_HEADER) {
            Some(id) => Ok(Self {
                user: UserContext::new(id, header(USER_EMAIL_HEADER).unwrap_or_default()),
            }),
            None => Err(StatusCode::UNAUTHORIZED),
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub db: MemoryBackend,
    pub verifier: Arc<dyn TokenVerifier>,
}

impl AppState {
    fn client(&self, auth: &AuthContext) -> MemoryClient {
        self.db.connect(auth.user.clone())
    }
}

/// Collaborator failure rendered as the status its classification maps to.
pub struct ApiError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match BackendError::classify(&self.0) {
            Some(classified) => {
                let status = StatusCode::from_u16(classified.http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                debug!(%status, error = %classified, "request rejected");
                (status, classified.to_string()).into_response()
            }
            None => {
                error!(error = %self.0, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response()
            }
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn kind_of(table: &str) -> ApiResult<EntityKind> {
    EntityKind::from_table(table)
        .ok_or_else(|| BackendError::NotFound(format!("unknown table {table:?}")).into())
}

pub fn router(db: MemoryBackend, verifier: Arc<dyn TokenVerifier>) -> Router {
    let app_state = AppState { db, verifier };
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/tables/{table}", get(list_all).post(create_row))
        .route("/tables/{table}/query", post(query_rows))
        .route("/tables/{table}/delete", post(delete_rows))
        .route(
            "/tables/{table}/{id}",
            get(get_row).patch(update_row).delete(delete_row),
        )
        .route("/views/{slot}", get(fetch_view))
        .route("/access/{resource_type}/{id}", get(check_access))
        .route("/permissions", get(list_permissions).post(create_permission))
        .route(
            "/permissions/{id}",
            patch(update_permission).delete(delete_permission),
        )
        .route("/invitations", get(list_invitations).post(create_invitation))
        .route("/invitations/{token}/accept", post(accept_invitation))
        .route("/changes", get(changes))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(app_state)
}

async fn list_all(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(table): Path<String>,
) -> ApiResult<Json<Vec<Entity>>> {
    let kind = kind_of(&table)?;
    Ok(Json(state.client(&auth).list(kind, &Filter::all()).await?))
}

async fn query_rows(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(table): Path<String>,
    Json(filter): Json<Filter>,
) -> ApiResult<Json<Vec<Entity>>> {
    let kind = kind_of(&table)?;
    Ok(Json(state.client(&auth).list(kind, &filter).await?))
}

async fn create_row(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(table): Path<String>,
    Json(candidate): Json<Entity>,
) -> ApiResult<(StatusCode, Json<Entity>)> {
    if kind_of(&table)? != candidate.kind() {
        return Err(BackendError::Invalid(format!("{} row posted to {table}", candidate.kind())).into());
    }
    let row = state.client(&auth).create(&candidate).await?;
    Ok((StatusCode::CREATED, Json(row)))
}

async fn get_row(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((table, id)): Path<(String, Uuid)>,
) -> ApiResult<Json<Entity>> {
    let kind = kind_of(&table)?;
    match state.client(&auth).get_by_id(kind, id).await? {
        Some(row) => Ok(Json(row)),
        None => Err(BackendError::NotFound(format!("{kind} {id} not found")).into()),
    }
}

async fn update_row(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((table, id)): Path<(String, Uuid)>,
    Json(patch): Json<EntityPatch>,
) -> ApiResult<Json<Entity>> {
    let kind = kind_of(&table)?;
    Ok(Json(state.client(&auth).update(kind, id, &patch).await?))
}

async fn delete_row(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((table, id)): Path<(String, Uuid)>,
) -> ApiResult<StatusCode> {
    let kind = kind_of(&table)?;
    state.client(&auth).delete(kind, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_rows(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(table): Path<String>,
    Json(filter): Json<Filter>,
) -> ApiResult<Json<Deleted>> {
    let kind = kind_of(&table)?;
    let deleted = state.client(&auth).delete_where(kind, &filter).await?;
    Ok(Json(Deleted { deleted }))
}

async fn fetch_view(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(slot): Path<String>,
    Query(params): Query<ViewParams>,
) -> ApiResult<Json<ViewPage>> {
    let key = ViewKey::from_params(slot, params);
    Ok(Json(state.client(&auth).fetch_view(&key).await?))
}

async fn check_access(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((resource_type, id)): Path<(String, Uuid)>,
) -> ApiResult<Json<AccessReply>> {
    let resource_type = ResourceType::from_str(&resource_type).ok_or_else(|| {
        BackendError::NotFound(format!("unknown resource type {resource_type:?}"))
    })?;
    let resource = ResourceRef {
        resource_type,
        resource_id: id,
    };
    let level = state.client(&auth).check_access(resource).await?;
    Ok(Json(AccessReply { level }))
}

async fn list_permissions(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(filter): Query<PermissionFilter>,
) -> ApiResult<Json<Vec<Permission>>> {
    Ok(Json(state.client(&auth).list_permissions(&filter).await?))
}

async fn create_permission(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(grant): Json<NewPermission>,
) -> ApiResult<(StatusCode, Json<Permission>)> {
    let permission = state.client(&auth).create_permission(&grant).await?;
    Ok((StatusCode::CREATED, Json(permission)))
}

async fn update_permission(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Json(change): Json<LevelChange>,
) -> ApiResult<Json<Permission>> {
    Ok(Json(
        state
            .client(&auth)
            .update_permission(id, change.permission_level)
            .await?,
    ))
}

async fn delete_permission(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.client(&auth).delete_permission(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_invitations(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(resource): Query<ResourceRef>,
) -> ApiResult<Json<Vec<Invitation>>> {
    Ok(Json(state.client(&auth).list_invitations(resource).await?))
}

async fn create_invitation(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(invite): Json<NewInvitation>,
) -> ApiResult<(StatusCode, Json<Invitation>)> {
    let invitation = state.client(&auth).create_invitation(&invite).await?;
    Ok((StatusCode::CREATED, Json(invitation)))
}

async fn accept_invitation(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(token): Path<String>,
) -> ApiResult<Json<AcceptedInvitation>> {
    Ok(Json(state.client(&auth).accept_invitation(&token).await?))
}

/// Row changes the caller may read, as server-sent events. Ids in the
/// query string the caller cannot read are dropped from the scope.
async fn changes(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(params): Query<ScopeParams>,
) -> ApiResult<Sse<impl Stream<Item = Result<sse::Event, axum::Error>>>> {
    let scope = params.into_scope(&auth.user.id);
    let subscription = state.client(&auth).subscribe(&scope).await?;
    debug!(user = %auth.user.id, collections = scope.collections.len(), groups = scope.groups.len(), "change stream opened");
    let stream = ReceiverStream::new(subscription.events).map(|message| match message {
        FeedMessage::Change(event) => sse::Event::default().json_data(event),
        FeedMessage::Error(reason) => Ok(sse::Event::default().event("error").data(reason)),
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

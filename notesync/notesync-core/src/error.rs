use crate::model::{EntityId, EntityKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Which optimistic protocol a durable write belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    Create,
    Update,
    Delete,
}

impl fmt::Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MutationOp::Create => "create",
            MutationOp::Update => "update",
            MutationOp::Delete => "delete",
        })
    }
}

/// Errors surfaced by the sync layer to the UI.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Rejected before any optimistic state was applied.
    #[error("VALIDATION: {0}")]
    Validation(String),
    /// The backend rejected or failed a write; the optimistic change has
    /// already been rolled back. `attempted` holds the data for a retry.
    #[error("DURABLE_WRITE: {op} of {kind} failed: {source}")]
    DurableWrite {
        op: MutationOp,
        kind: EntityKind,
        attempted: serde_json::Value,
        #[source]
        source: anyhow::Error,
    },
    #[error("MUTATION_IN_FLIGHT: {kind} {id} has a pending mutation")]
    MutationInFlight { kind: EntityKind, id: EntityId },
    #[error("REALTIME_UNAVAILABLE: live sync unavailable after {attempts} attempts")]
    RealtimeUnavailable { attempts: u32 },
    #[error("RATE_LIMITED: daily limit of {limit} reached, resets at {resets_at}")]
    RateLimited { limit: u32, resets_at: DateTime<Utc> },
    #[error("BACKEND: {0}")]
    Backend(#[from] anyhow::Error),
}

impl SyncError {
    /// Whether the caller may retry the same request as-is.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SyncError::DurableWrite { source, .. } | SyncError::Backend(source) => !matches!(
                source.downcast_ref::<BackendError>(),
                Some(
                    BackendError::Forbidden(_)
                        | BackendError::Invalid(_)
                        | BackendError::InvitationExpired
                        | BackendError::InvitationUsed
                )
            ),
            SyncError::MutationInFlight { .. } | SyncError::RealtimeUnavailable { .. } => true,
            SyncError::Validation(_) | SyncError::RateLimited { .. } => false,
        }
    }

    /// Classified collaborator error underneath, when there is one.
    pub fn backend_error(&self) -> Option<&BackendError> {
        match self {
            SyncError::DurableWrite { source, .. } | SyncError::Backend(source) => {
                source.downcast_ref::<BackendError>()
            }
            _ => None,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Classification of failures reported by the persistence, ACL and realtime
/// collaborators. Carried inside `anyhow::Error` across the trait seams.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("FORBIDDEN: {0}")]
    Forbidden(String),
    #[error("CONFLICT: {0}")]
    Conflict(String),
    #[error("INVALID: {0}")]
    Invalid(String),
    #[error("INVITATION_EXPIRED")]
    InvitationExpired,
    #[error("INVITATION_USED")]
    InvitationUsed,
    #[error("UNAVAILABLE: {0}")]
    Unavailable(String),
}

impl BackendError {
    /// HTTP status used by the reference server for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            BackendError::NotFound(_) => 404,
            BackendError::Forbidden(_) => 403,
            BackendError::Conflict(_) | BackendError::InvitationUsed => 409,
            BackendError::Invalid(_) => 400,
            BackendError::InvitationExpired => 410,
            BackendError::Unavailable(_) => 503,
        }
    }

    /// Inverse of [`BackendError::http_status`] for client responses.
    pub fn from_http_status(status: u16, body: String) -> Self {
        match status {
            404 => BackendError::NotFound(body),
            403 | 401 => BackendError::Forbidden(body),
            409 if body.contains("INVITATION_USED") => BackendError::InvitationUsed,
            409 => BackendError::Conflict(body),
            400 | 422 => BackendError::Invalid(body),
            410 => BackendError::InvitationExpired,
            _ => BackendError::Unavailable(format!("HTTP {status}: {body}")),
        }
    }

    pub fn classify(err: &anyhow::Error) -> Option<&BackendError> {
        err.downcast_ref::<BackendError>()
    }
}

//! Access control: permissions, invitations and how they resolve.
//!
//! A user owns what they created; everyone else gets in through a
//! [`Permission`] on a collection or a group. A group inherits the access
//! its collection grants, and items inherit from their group.

use crate::error::BackendError;
use crate::model::{
    AccessLevel, Invitation, Permission, PermissionLevel, ResourceRef, ResourceType, UserContext,
};
use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Lifetime of an invitation when the inviter does not pick one.
pub const INVITATION_TTL_DAYS: i64 = 7;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewPermission {
    pub user_id: String,
    #[serde(flatten)]
    pub resource: ResourceRef,
    pub permission_level: PermissionLevel,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewInvitation {
    #[serde(flatten)]
    pub resource: ResourceRef,
    pub invitee_email: String,
    pub permission_level: PermissionLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub transfer_ownership_on_accept: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<ResourceType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<Uuid>,
}

impl PermissionFilter {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn for_resource(resource: ResourceRef) -> Self {
        Self {
            user_id: None,
            resource_type: Some(resource.resource_type),
            resource_id: Some(resource.resource_id),
        }
    }

    pub fn matches(&self, permission: &Permission) -> bool {
        self.user_id
            .as_ref()
            .map_or(true, |u| *u == permission.user_id)
            && self
                .resource_type
                .map_or(true, |t| t == permission.resource_type)
            && self
                .resource_id
                .map_or(true, |r| r == permission.resource_id)
    }
}

/// Result of accepting an invitation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AcceptedInvitation {
    pub invitation: Invitation,
    /// The accepter's permission; `None` when they became the owner.
    pub permission: Option<Permission>,
    #[serde(default)]
    pub ownership_transferred: bool,
}

/// Operations the authenticated caller can perform on the ACL.
#[async_trait]
pub trait AccessControl: Send + Sync {
    async fn check_access(&self, resource: ResourceRef) -> Result<AccessLevel>;
    async fn list_permissions(&self, filter: &PermissionFilter) -> Result<Vec<Permission>>;
    async fn create_permission(&self, grant: &NewPermission) -> Result<Permission>;
    async fn update_permission(&self, id: Uuid, level: PermissionLevel) -> Result<Permission>;
    async fn delete_permission(&self, id: Uuid) -> Result<()>;
    async fn create_invitation(&self, invite: &NewInvitation) -> Result<Invitation>;
    async fn accept_invitation(&self, token: &str) -> Result<AcceptedInvitation>;
    async fn list_invitations(&self, resource: ResourceRef) -> Result<Vec<Invitation>>;
}

/// 32 random bytes, URL-safe base64 without padding.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// What accepting an invitation requires the caller to do next.
#[derive(Clone, Debug, PartialEq)]
pub enum AcceptPlan {
    /// Grant the invitation's level to the accepter.
    Grant(Invitation),
    /// Hand the resource to the accepter.
    Transfer(Invitation),
    /// The same user accepted before; nothing changes.
    AlreadyAccepted(Invitation),
}

/// In-memory permission and invitation tables with the resolution rules.
#[derive(Clone, Debug, Default)]
pub struct AclState {
    permissions: HashMap<Uuid, Permission>,
    invitations: HashMap<Uuid, Invitation>,
}

impl AclState {
    pub fn permission_for(&self, user_id: &str, resource: ResourceRef) -> Option<&Permission> {
        self.permissions
            .values()
            .find(|p| p.user_id == user_id && p.resource() == resource)
    }

    pub fn permission(&self, id: Uuid) -> Option<&Permission> {
        self.permissions.get(&id)
    }

    fn granted(&self, user_id: &str, resource: ResourceRef) -> AccessLevel {
        self.permission_for(user_id, resource)
            .map_or(AccessLevel::None, |p| p.permission_level.into())
    }

    /// Effective access of `user_id` on something inside `collection`
    /// (and `group`, when the target is a group or one of its items).
    /// `owner_id` is the owner of the target.
    pub fn resolve(
        &self,
        user_id: &str,
        owner_id: &str,
        collection: Uuid,
        group: Option<Uuid>,
    ) -> AccessLevel {
        if user_id == owner_id {
            return AccessLevel::Owner;
        }
        let inherited = self.granted(user_id, ResourceRef::collection(collection));
        let direct = group.map_or(AccessLevel::None, |g| {
            self.granted(user_id, ResourceRef::group(g))
        });
        inherited.max(direct)
    }

    pub fn permissions(&self, filter: &PermissionFilter) -> Vec<Permission> {
        let mut out: Vec<Permission> = self
            .permissions
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.granted_at.cmp(&b.granted_at).then(a.id.cmp(&b.id)));
        out
    }

    /// Grant `level`, reusing an existing permission for the same user and
    /// resource. An existing grant is only ever raised. The flag tells
    /// whether a new row was inserted.
    pub fn grant(
        &mut self,
        user_id: &str,
        resource: ResourceRef,
        level: PermissionLevel,
        granted_by: &str,
        now: DateTime<Utc>,
    ) -> (Permission, bool) {
        if let Some(existing) = self
            .permissions
            .values_mut()
            .find(|p| p.user_id == user_id && p.resource() == resource)
        {
            if level == PermissionLevel::Write {
                existing.permission_level = PermissionLevel::Write;
            }
            return (existing.clone(), false);
        }
        let permission = Permission {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            resource_type: resource.resource_type,
            resource_id: resource.resource_id,
            permission_level: level,
            granted_by: granted_by.to_string(),
            granted_at: now,
        };
        self.permissions.insert(permission.id, permission.clone());
        (permission, true)
    }

    pub fn set_level(&mut self, id: Uuid, level: PermissionLevel) -> Option<Permission> {
        let permission = self.permissions.get_mut(&id)?;
        permission.permission_level = level;
        Some(permission.clone())
    }

    pub fn revoke(&mut self, id: Uuid) -> Option<Permission> {
        self.permissions.remove(&id)
    }

    /// Drop every permission and invitation on a deleted resource.
    pub fn forget_resource(&mut self, resource: ResourceRef) -> Vec<Permission> {
        self.invitations.retain(|_, inv| inv.resource() != resource);
        let ids: Vec<Uuid> = self
            .permissions
            .values()
            .filter(|p| p.resource() == resource)
            .map(|p| p.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.permissions.remove(&id))
            .collect()
    }

    pub fn invite(
        &mut self,
        invite: &NewInvitation,
        invited_by: &str,
        now: DateTime<Utc>,
    ) -> Result<Invitation, BackendError> {
        if invite.transfer_ownership_on_accept
            && invite.resource.resource_type != ResourceType::Collection
        {
            return Err(BackendError::Invalid(
                "ownership can only be transferred for collections".into(),
            ));
        }
        let email = invite.invitee_email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(BackendError::Invalid(format!(
                "invalid invitee email {email:?}"
            )));
        }
        let invitation = Invitation {
            id: Uuid::new_v4(),
            token: generate_token(),
            resource_type: invite.resource.resource_type,
            resource_id: invite.resource.resource_id,
            invitee_email: email.to_string(),
            permission_level: invite.permission_level,
            invited_by: invited_by.to_string(),
            expires_at: invite
                .expires_at
                .unwrap_or(now + Duration::days(INVITATION_TTL_DAYS)),
            created_at: now,
            accepted_at: None,
            accepted_by: None,
            transfer_ownership_on_accept: invite.transfer_ownership_on_accept,
        };
        self.invitations.insert(invitation.id, invitation.clone());
        Ok(invitation)
    }

    pub fn invitations_for(&self, resource: ResourceRef) -> Vec<Invitation> {
        let mut out: Vec<Invitation> = self
            .invitations
            .values()
            .filter(|inv| inv.resource() == resource)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Validate and consume an invitation token for `user`.
    pub fn accept(
        &mut self,
        token: &str,
        user: &UserContext,
        now: DateTime<Utc>,
    ) -> Result<AcceptPlan, BackendError> {
        let invitation = self
            .invitations
            .values_mut()
            .find(|inv| inv.token == token)
            .ok_or_else(|| BackendError::NotFound("invitation not found".into()))?;

        if invitation.accepted_at.is_some() {
            return if invitation.accepted_by.as_deref() == Some(user.id.as_str()) {
                Ok(AcceptPlan::AlreadyAccepted(invitation.clone()))
            } else {
                Err(BackendError::InvitationUsed)
            };
        }
        if invitation.is_expired(now) {
            return Err(BackendError::InvitationExpired);
        }
        if !invitation
            .invitee_email
            .eq_ignore_ascii_case(user.email.trim())
        {
            return Err(BackendError::Forbidden(
                "invitation was issued to a different email".into(),
            ));
        }

        invitation.accepted_at = Some(now);
        invitation.accepted_by = Some(user.id.clone());
        let invitation = invitation.clone();
        Ok(if invitation.transfer_ownership_on_accept {
            AcceptPlan::Transfer(invitation)
        } else {
            AcceptPlan::Grant(invitation)
        })
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Actor context: the identity, tenant boundary and role threaded through every step.
//!
//! An [`ActorContext`] is built once at the request boundary (or rebuilt by a worker
//! from serialized job arguments) and never mutated afterwards. Nested workflows
//! receive the very same value.
//!
//! The serialized form ([`SerializedActor`]) uses string keys and string role names
//! only, because job arguments round-trip through JSON text in the job store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Errors raised while building or reconstructing an actor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActorError {
    /// The serialized role is not one of the known roles.
    #[error("unknown role '{0}'")]
    UnknownRole(String),

    /// A required field is missing or empty.
    #[error("actor field '{0}' is missing or empty")]
    MissingField(&'static str),

    /// The system role may only be obtained through [`ActorContext::system`].
    #[error("the system role is reserved for bootstrap operations")]
    SystemRoleReserved,

    /// The serialized actor is not a JSON object with string fields.
    #[error("malformed actor: {0}")]
    Malformed(String),
}

/// Role of an actor within its tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    /// Full control within the tenant.
    Admin,
    /// May create and modify records.
    Editor,
    /// Read-only access.
    Viewer,
    /// Internal actor for bootstrap operations only.
    System,
}

impl Role {
    /// Every known role, in declaration order.
    pub const ALL: [Role; 4] = [Role::Admin, Role::Editor, Role::Viewer, Role::System];

    /// Returns the serialized name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Editor => "editor",
            Self::Viewer => "viewer",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ActorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "editor" => Ok(Self::Editor),
            "viewer" => Ok(Self::Viewer),
            "system" => Ok(Self::System),
            other => Err(ActorError::UnknownRole(other.to_string())),
        }
    }
}

/// The closed set of operations allowed to run as the system actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemOperation {
    /// Loading the principal while authenticating a request.
    LoadPrincipal,
    /// Resolving the tenant a request belongs to.
    ResolveTenant,
    /// Enqueueing a job from the cron scheduler.
    RunScheduledJob,
}

impl SystemOperation {
    /// Identifier used as the system actor's id.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoadPrincipal => "system:load_principal",
            Self::ResolveTenant => "system:resolve_tenant",
            Self::RunScheduledJob => "system:run_scheduled_job",
        }
    }

    fn parse(id: &str) -> Option<Self> {
        match id {
            "system:load_principal" => Some(Self::LoadPrincipal),
            "system:resolve_tenant" => Some(Self::ResolveTenant),
            "system:run_scheduled_job" => Some(Self::RunScheduledJob),
            _ => None,
        }
    }
}

/// Tenant id carried by system actors.
pub const SYSTEM_TENANT: &str = "system";

/// Immutable identity, tenant and role of whoever triggered a unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActorContext {
    id: String,
    tenant_id: String,
    role: Role,
}

impl ActorContext {
    /// Build an actor for an ordinary (non-system) principal.
    pub fn new(
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        role: Role,
    ) -> Result<Self, ActorError> {
        if role == Role::System {
            return Err(ActorError::SystemRoleReserved);
        }
        Self::checked(id.into(), tenant_id.into(), role)
    }

    /// The system actor for one of the enumerated bootstrap operations.
    pub fn system(operation: SystemOperation) -> Self {
        Self {
            id: operation.as_str().to_string(),
            tenant_id: SYSTEM_TENANT.to_string(),
            role: Role::System,
        }
    }

    fn checked(id: String, tenant_id: String, role: Role) -> Result<Self, ActorError> {
        if id.trim().is_empty() {
            return Err(ActorError::MissingField("id"));
        }
        if tenant_id.trim().is_empty() {
            return Err(ActorError::MissingField("tenant_id"));
        }
        Ok(Self {
            id,
            tenant_id,
            role,
        })
    }

    /// Identity of the actor.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Tenant boundary of the actor.
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Role of the actor.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether this is the system actor.
    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }

    /// The bootstrap operation a system actor was created for.
    pub fn system_operation(&self) -> Option<SystemOperation> {
        if self.is_system() {
            SystemOperation::parse(&self.id)
        } else {
            None
        }
    }

    /// Whether both actors belong to the same tenant.
    pub fn same_tenant(&self, other: &ActorContext) -> bool {
        self.tenant_id == other.tenant_id
    }

    /// Convert into the string-keyed wire form.
    pub fn to_serialized(&self) -> SerializedActor {
        SerializedActor {
            id: self.id.clone(),
            tenant_id: self.tenant_id.clone(),
            role: self.role.as_str().to_string(),
        }
    }

    /// Serialize into a JSON object.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "tenant_id": self.tenant_id,
            "role": self.role.as_str(),
        })
    }

    /// Rebuild an actor from its JSON form, rejecting unknown roles.
    pub fn from_json(value: &Value) -> Result<Self, ActorError> {
        let serialized: SerializedActor = serde_json::from_value(value.clone())
            .map_err(|e| ActorError::Malformed(e.to_string()))?;
        Self::try_from(serialized)
    }
}

impl fmt::Display for ActorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.id, self.tenant_id, self.role)
    }
}

/// String-keyed representation of an actor stored inside job arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedActor {
    /// Actor identity.
    pub id: String,
    /// Tenant identity.
    pub tenant_id: String,
    /// Role name, validated against [`Role`] on reconstruction.
    pub role: String,
}

impl TryFrom<SerializedActor> for ActorContext {
    type Error = ActorError;

    fn try_from(value: SerializedActor) -> Result<Self, Self::Error> {
        let role = value.role.parse::<Role>()?;
        if role == Role::System {
            // Only the enumerated bootstrap identities survive a round trip.
            let operation =
                SystemOperation::parse(&value.id).ok_or(ActorError::SystemRoleReserved)?;
            return Ok(Self::system(operation));
        }
        Self::checked(value.id, value.tenant_id, role)
    }
}

impl From<&ActorContext> for SerializedActor {
    fn from(actor: &ActorContext) -> Self {
        actor.to_serialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_roundtrip() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
    }

    #[test]
    fn test_unknown_role_is_rejected() {
        assert_eq!(
            "superuser".parse::<Role>(),
            Err(ActorError::UnknownRole("superuser".to_string()))
        );
        assert!("Admin".parse::<Role>().is_err());
        assert!("".parse::<Role>().is_err());
    }

    #[test]
    fn test_new_rejects_system_role() {
        assert_eq!(
            ActorContext::new("u-1", "t-1", Role::System),
            Err(ActorError::SystemRoleReserved)
        );
    }

    #[test]
    fn test_new_rejects_empty_fields() {
        assert_eq!(
            ActorContext::new("", "t-1", Role::Viewer),
            Err(ActorError::MissingField("id"))
        );
        assert_eq!(
            ActorContext::new("u-1", "  ", Role::Viewer),
            Err(ActorError::MissingField("tenant_id"))
        );
    }

    #[test]
    fn test_json_roundtrip_preserves_actor() {
        let actor = ActorContext::new("user-42", "tenant-a", Role::Editor).unwrap();
        let json = actor.to_json();

        assert_eq!(json["role"], "editor");
        assert_eq!(ActorContext::from_json(&json).unwrap(), actor);
    }

    #[test]
    fn test_from_json_rejects_invalid_role() {
        let json = serde_json::json!({"id": "u", "tenant_id": "t", "role": "root"});
        assert_eq!(
            ActorContext::from_json(&json),
            Err(ActorError::UnknownRole("root".to_string()))
        );
    }

    #[test]
    fn test_from_json_rejects_non_string_fields() {
        let json = serde_json::json!({"id": 7, "tenant_id": "t", "role": "viewer"});
        assert!(matches!(
            ActorContext::from_json(&json),
            Err(ActorError::Malformed(_))
        ));
    }

    #[test]
    fn test_system_actor_roundtrip() {
        let actor = ActorContext::system(SystemOperation::RunScheduledJob);
        assert!(actor.is_system());
        assert_eq!(
            actor.system_operation(),
            Some(SystemOperation::RunScheduledJob)
        );

        let rebuilt = ActorContext::from_json(&actor.to_json()).unwrap();
        assert_eq!(rebuilt, actor);
    }

    #[test]
    fn test_forged_system_actor_is_rejected() {
        let json = serde_json::json!({"id": "mallory", "tenant_id": "t", "role": "system"});
        assert_eq!(
            ActorContext::from_json(&json),
            Err(ActorError::SystemRoleReserved)
        );
    }

    #[test]
    fn test_same_tenant() {
        let a = ActorContext::new("a", "t-1", Role::Admin).unwrap();
        let b = ActorContext::new("b", "t-1", Role::Viewer).unwrap();
        let c = ActorContext::new("c", "t-2", Role::Viewer).unwrap();
        assert!(a.same_tenant(&b));
        assert!(!a.same_tenant(&c));
    }
}

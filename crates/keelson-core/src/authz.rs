// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Authorization collaborator interface.
//!
//! The policy engine lives outside this crate. Keelson only hands it the opaque
//! [`ActorContext`] and interprets the decision. Hiding cross-tenant denials as
//! `NotFound` is the collaborator's job.

use async_trait::async_trait;

use crate::actor::ActorContext;
use crate::error::StepError;

/// The object an operation targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Resource {
    /// Resource type, e.g. `order`.
    pub kind: String,
    /// Resource id, absent for collection-level operations.
    pub id: Option<String>,
}

impl Resource {
    /// A specific record.
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: Some(id.into()),
        }
    }

    /// A collection of records.
    pub fn collection(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
        }
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}:{}", self.kind, id),
            None => f.write_str(&self.kind),
        }
    }
}

/// Answer from the policy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationDecision {
    /// The operation may proceed.
    Allow,
    /// The operation is not permitted.
    Deny,
    /// The resource does not exist for this actor.
    NotFound,
}

impl AuthorizationDecision {
    /// Map the decision onto a step result. Deny and NotFound are always permanent.
    pub fn into_result(self, resource: &Resource, action: &str) -> Result<(), StepError> {
        match self {
            Self::Allow => Ok(()),
            Self::Deny => Err(StepError::Forbidden(format!("{} on {}", action, resource))),
            Self::NotFound => Err(StepError::NotFound(resource.to_string())),
        }
    }
}

/// External policy engine consulted by steps through
/// [`StepContext::authorize`](crate::context::StepContext::authorize).
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Decide whether `actor` may perform `action` on `resource`.
    ///
    /// Errors are infrastructure failures (e.g. policy store unreachable), not denials.
    async fn authorize(
        &self,
        actor: &ActorContext,
        resource: &Resource,
        action: &str,
    ) -> Result<AuthorizationDecision, StepError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_mapping() {
        let order = Resource::new("order", "o-1");

        assert_eq!(
            AuthorizationDecision::Allow.into_result(&order, "update"),
            Ok(())
        );
        assert_eq!(
            AuthorizationDecision::Deny.into_result(&order, "update"),
            Err(StepError::Forbidden("update on order:o-1".into()))
        );
        assert_eq!(
            AuthorizationDecision::NotFound.into_result(&order, "update"),
            Err(StepError::NotFound("order:o-1".into()))
        );
    }

    #[test]
    fn test_resource_display() {
        assert_eq!(Resource::collection("invoice").to_string(), "invoice");
        assert_eq!(Resource::new("invoice", "9").to_string(), "invoice:9");
    }
}

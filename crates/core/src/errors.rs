use thiserror::Error;

use crate::approvals::machine::TransitionError;
use crate::domain::approval::{ApprovalAction, ApprovalStatus};
use crate::domain::entity::EntityId;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
    #[error("entity {entity_id} cycle {cycle_sequence} is final ({status}); resubmit to continue")]
    FinalStateProtected { entity_id: EntityId, cycle_sequence: u32, status: ApprovalStatus },
    #[error("operation targets cycle {expected} of entity {entity_id}, now on cycle {current}")]
    StaleCycle { entity_id: EntityId, expected: u32, current: u32 },
    #[error("operator `{operator_id}` may not {action} entity {entity_id}: {reason}")]
    PermissionDenied {
        entity_id: EntityId,
        operator_id: String,
        action: ApprovalAction,
        reason: String,
    },
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("approvable entity not found: {0}")]
    EntityNotFound(EntityId),
    #[error("no approval cycle owns external reference `{0}`")]
    UnknownReference(String),
    #[error("approval provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("concurrent modification of entity {entity_id} (expected version {expected_version})")]
    ConcurrencyConflict { entity_id: EntityId, expected_version: i64 },
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl ApplicationError {
    /// Whether the caller may retry the whole operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable(_)
                | Self::Integration(_)
                | Self::ConcurrencyConflict { .. }
                | Self::Persistence(_)
        )
    }

    pub fn is_final_state_protected(&self) -> bool {
        matches!(self, Self::Domain(DomainError::FinalStateProtected { .. }))
    }

    /// Errors meaning "this cycle can no longer be changed by that operation".
    pub fn is_closed_cycle(&self) -> bool {
        matches!(
            self,
            Self::Domain(
                DomainError::FinalStateProtected { .. }
                    | DomainError::StaleCycle { .. }
                    | DomainError::InvalidTransition(_)
            )
        )
    }

    pub fn error_class(&self) -> &'static str {
        match self {
            Self::Domain(DomainError::InvalidTransition(_)) => "invalid_transition",
            Self::Domain(DomainError::FinalStateProtected { .. }) => "final_state_protected",
            Self::Domain(DomainError::StaleCycle { .. }) => "stale_cycle",
            Self::Domain(DomainError::PermissionDenied { .. }) => "permission_denied",
            Self::Domain(DomainError::InvariantViolation(_)) => "invariant_violation",
            Self::EntityNotFound(_) => "entity_not_found",
            Self::UnknownReference(_) => "unknown_reference",
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::Integration(_) => "integration",
            Self::ConcurrencyConflict { .. } => "concurrency_conflict",
            Self::Persistence(_) => "persistence",
            Self::Configuration(_) => "configuration",
        }
    }
}

/// Everything an approval operation can fail with.
pub type ApprovalError = ApplicationError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("forbidden: {message}")]
    Forbidden { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Forbidden { .. } => "You are not allowed to perform this approval action.",
            Self::NotFound { .. } => "The requested approval record does not exist.",
            Self::Conflict { .. } => {
                "This approval has already been decided and can no longer be changed."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Forbidden { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::Forbidden { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let message = value.to_string();
        let correlation_id = "unassigned".to_owned();
        match value {
            ApplicationError::Domain(DomainError::InvalidTransition(_))
            | ApplicationError::Domain(DomainError::InvariantViolation(_)) => {
                Self::BadRequest { message, correlation_id }
            }
            ApplicationError::Domain(DomainError::FinalStateProtected { .. })
            | ApplicationError::Domain(DomainError::StaleCycle { .. }) => {
                Self::Conflict { message, correlation_id }
            }
            ApplicationError::Domain(DomainError::PermissionDenied { .. }) => {
                Self::Forbidden { message, correlation_id }
            }
            ApplicationError::EntityNotFound(_) | ApplicationError::UnknownReference(_) => {
                Self::NotFound { message, correlation_id }
            }
            ApplicationError::ProviderUnavailable(_)
            | ApplicationError::Integration(_)
            | ApplicationError::ConcurrencyConflict { .. }
            | ApplicationError::Persistence(_) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
            ApplicationError::Configuration(_) => Self::Internal { message, correlation_id },
        }
    }
}

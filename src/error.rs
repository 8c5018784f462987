//! Error taxonomy surfaced to the initiating user.
//!
//! Every failure in the dispatch core is scoped to the operation that
//! triggered it. Conflict, capacity and not-found errors are actionable and
//! prompt a re-fetch of the affected record; transport errors are retried in
//! the background by the change feed and only surface when they persist.

use std::fmt;

use crate::bus::FeedError;
use crate::model::{ServiceId, ServiceStatus, TransferId, TransferStatus, UserId};

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Error returned by claim attempts: already taken, capacity exceeded or
/// not found, plus validation and transport failures.
pub type ClaimError = DispatchError;

/// A pre-flight check failed. Never reaches the network.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Why a write lost against the current backend state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    /// Another courier claimed the service first.
    AlreadyTaken {
        service_id: ServiceId,
        status: ServiceStatus,
    },
    /// The service moved on since it was read.
    StaleStatus {
        service_id: ServiceId,
        expected: ServiceStatus,
        actual: ServiceStatus,
    },
    /// The service is no longer held by the acting courier.
    NotAssignee { service_id: ServiceId },
    /// A transfer request is already pending for the service.
    DuplicateTransfer { service_id: ServiceId },
    /// The transfer request was already answered.
    TransferResolved {
        transfer_id: TransferId,
        status: TransferStatus,
    },
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyTaken { service_id, status } => {
                write!(f, "service {service_id} was already taken (now {status})")
            }
            Self::StaleStatus {
                service_id,
                expected,
                actual,
            } => write!(
                f,
                "service {service_id} is {actual}, expected {expected}"
            ),
            Self::NotAssignee { service_id } => {
                write!(f, "service {service_id} is not assigned to you")
            }
            Self::DuplicateTransfer { service_id } => {
                write!(f, "a transfer for service {service_id} is already pending")
            }
            Self::TransferResolved {
                transfer_id,
                status,
            } => write!(f, "transfer {transfer_id} was already {status}"),
        }
    }
}

/// Errors that can occur in the dispatch core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("conflict: {0}")]
    Conflict(ConflictKind),

    #[error("capacity exceeded: courier {courier} holds {active} of {max} concurrent services")]
    Capacity { courier: UserId, active: u32, max: u32 },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<FeedError> for DispatchError {
    fn from(err: FeedError) -> Self {
        match err {
            FeedError::InvalidFilter { .. } => Self::validation("filter", err.to_string()),
            other => Self::Transport(other.to_string()),
        }
    }
}

impl DispatchError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation(ValidationError::new(field, message))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Returns true if the service was claimed by someone else first.
    pub fn is_already_taken(&self) -> bool {
        matches!(self, Self::Conflict(ConflictKind::AlreadyTaken { .. }))
    }

    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::Capacity { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Conflict, capacity and not-found errors mean the local copy of the
    /// record is stale and must be re-fetched immediately.
    pub fn should_refetch(&self) -> bool {
        matches!(
            self,
            Self::Conflict(_) | Self::Capacity { .. } | Self::NotFound { .. }
        )
    }

    /// Actionable text for the user who initiated the operation.
    pub fn message(&self) -> String {
        match self {
            Self::Validation(e) => e.message.clone(),
            Self::Conflict(ConflictKind::AlreadyTaken { .. }) => {
                "Another courier took this service first.".to_string()
            }
            Self::Conflict(kind) => kind.to_string(),
            Self::Capacity { max, .. } => format!(
                "You already hold the maximum of {max} active services for this branch."
            ),
            Self::NotFound { .. } => "This service no longer exists.".to_string(),
            Self::Transport(_) => {
                "The server could not be reached. Please try again.".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = DispatchError::validation("reason", "a reason is required");
        assert_eq!(err.to_string(), "validation failed: reason: a reason is required");
        assert!(!err.should_refetch());
    }

    #[test]
    fn test_claim_outcomes_are_distinguishable() {
        let service_id = ServiceId::new();
        let taken = DispatchError::Conflict(ConflictKind::AlreadyTaken {
            service_id,
            status: ServiceStatus::Assigned,
        });
        let capacity = DispatchError::Capacity {
            courier: UserId::new(),
            active: 3,
            max: 3,
        };
        let missing = DispatchError::NotFound {
            entity: "service",
            id: service_id.to_string(),
        };

        assert!(taken.is_already_taken() && !taken.is_capacity() && !taken.is_not_found());
        assert!(capacity.is_capacity() && !capacity.is_conflict());
        assert!(missing.is_not_found() && !missing.is_conflict());
        assert!(taken.should_refetch() && capacity.should_refetch() && missing.should_refetch());
    }

    #[test]
    fn test_transport_error_is_not_refetched() {
        let err = DispatchError::Transport("timed out".to_string());
        assert!(err.is_transport());
        assert!(!err.should_refetch());
        assert!(err.message().contains("try again"));
    }

    #[test]
    fn test_feed_errors_map_to_transport_except_bad_filters() {
        let unreachable: DispatchError = FeedError::Unreachable("down".to_string()).into();
        assert!(unreachable.is_transport());

        let bad_filter: DispatchError = FeedError::InvalidFilter {
            filter: "or=(a,b)".to_string(),
            reason: "disjunction".to_string(),
        }
        .into();
        assert!(bad_filter.is_validation());
    }
}

//! Backend API: the shared source of truth.
//!
//! This module contains:
//! - `ServiceApi` trait: the CRUD surface used by coordinators and views
//! - Request types for the single atomic status+assignee endpoint
//! - `ApiError`: backend rejections, mapped into `DispatchError`
//! - Implementations: in-memory backend publishing on the change feed

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{ConflictKind, DispatchError};
use crate::model::{
    BranchId, NewService, Service, ServiceId, ServicePatch, ServiceStatus, ThreadMessage,
    TransferDecision, TransferId, TransferRequest, TransferStatus, UserId, ZoneCapacityConfig,
    ZoneId,
};

pub mod memory;

pub use memory::MemoryBackend;

/// Result type for backend calls.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Rejections returned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Status precondition failed for {service_id}: expected {expected}, found {actual}")]
    StatusMismatch {
        service_id: ServiceId,
        expected: ServiceStatus,
        actual: ServiceStatus,
    },

    #[error("Service {service_id} is not held by the expected courier")]
    AssigneeMismatch { service_id: ServiceId },

    #[error("Courier {courier} holds {active} of {max} concurrent services")]
    CapacityExceeded { courier: UserId, active: u32, max: u32 },

    #[error("A transfer is already pending for service {service_id}")]
    DuplicatePendingTransfer { service_id: ServiceId },

    #[error("Transfer {transfer_id} is {status}, not pending")]
    TransferNotPending {
        transfer_id: TransferId,
        status: TransferStatus,
    },

    #[error("Only the recipient may respond to transfer {transfer_id}")]
    NotRecipient { transfer_id: TransferId },

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Backend unreachable: {0}")]
    Unreachable(String),
}

/// Maps backend rejections into the user-facing taxonomy.
///
/// `Invalid` and `NotRecipient` become `Validation`: they are the backend
/// repeating a check the client already runs before sending, so reaching
/// them means the local check was bypassed or raced, and the user-facing
/// remedy is the same as for the local failure. They do not trigger a
/// re-fetch.
impl From<ApiError> for DispatchError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::NotFound { entity, id } => DispatchError::NotFound { entity, id },
            ApiError::StatusMismatch {
                service_id,
                expected,
                actual,
            } => DispatchError::Conflict(ConflictKind::StaleStatus {
                service_id,
                expected,
                actual,
            }),
            ApiError::AssigneeMismatch { service_id } => {
                DispatchError::Conflict(ConflictKind::NotAssignee { service_id })
            }
            ApiError::CapacityExceeded {
                courier,
                active,
                max,
            } => DispatchError::Capacity {
                courier,
                active,
                max,
            },
            ApiError::DuplicatePendingTransfer { service_id } => {
                DispatchError::Conflict(ConflictKind::DuplicateTransfer { service_id })
            }
            ApiError::TransferNotPending {
                transfer_id,
                status,
            } => DispatchError::Conflict(ConflictKind::TransferResolved {
                transfer_id,
                status,
            }),
            ApiError::NotRecipient { .. } => DispatchError::validation(
                "responder",
                "only the receiving courier may answer this transfer",
            ),
            ApiError::Invalid(message) => DispatchError::validation("request", message),
            ApiError::Unreachable(message) => DispatchError::Transport(message),
        }
    }
}

/// Bulk-list filter. Empty fields do not constrain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceQuery {
    pub statuses: Vec<ServiceStatus>,
    pub requester: Option<UserId>,
    pub courier: Option<UserId>,
    pub branch: Option<BranchId>,
}

impl ServiceQuery {
    pub fn with_statuses(statuses: &[ServiceStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Self::default()
        }
    }

    pub fn requested_by(mut self, requester: UserId) -> Self {
        self.requester = Some(requester);
        self
    }

    pub fn assigned_to(mut self, courier: UserId) -> Self {
        self.courier = Some(courier);
        self
    }

    pub fn in_branch(mut self, branch: BranchId) -> Self {
        self.branch = Some(branch);
        self
    }

    pub fn matches(&self, service: &Service) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&service.status))
            && self.requester.map_or(true, |r| service.requester_ref == r)
            && self
                .courier
                .map_or(true, |c| service.assigned_courier_ref == Some(c))
            && self.branch.map_or(true, |b| service.branch_ref == Some(b))
    }
}

/// How a transition changes the assignee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssigneeChange {
    #[default]
    Keep,
    Set(UserId),
    Clear,
}

/// Every field a status transition writes, applied together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPatch {
    pub status: ServiceStatus,
    pub assignee: AssigneeChange,
    pub zone_ref: Option<ZoneId>,
    pub cancellation_reason: Option<String>,
}

impl StatusPatch {
    pub fn to(status: ServiceStatus) -> Self {
        Self {
            status,
            assignee: AssigneeChange::Keep,
            zone_ref: None,
            cancellation_reason: None,
        }
    }

    /// Write the patch and its timestamps onto a service.
    pub fn apply_to(&self, service: &mut Service, now: DateTime<Utc>) {
        match self.assignee {
            AssigneeChange::Keep => {}
            AssigneeChange::Set(courier) => {
                service.assigned_courier_ref = Some(courier);
                service.assigned_at = Some(now);
            }
            AssigneeChange::Clear => {
                service.assigned_courier_ref = None;
                service.assigned_at = None;
            }
        }
        if let Some(zone) = self.zone_ref {
            service.zone_ref = Some(zone);
        }
        match self.status {
            ServiceStatus::Delivered => service.completed_at = Some(now),
            ServiceStatus::Cancelled => {
                service.cancellation_reason = self.cancellation_reason.clone();
            }
            ServiceStatus::Available => service.completed_at = None,
            _ => {}
        }
        service.status = self.status;
        service.updated_at = now;
    }
}

/// Server-side cap check evaluated inside the same atomic update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityGuard {
    pub courier: UserId,
    pub max_concurrent: u32,
}

/// Conditional update for the atomic status+assignee endpoint.
///
/// Succeeds only if the stored status equals `expected_status`, the stored
/// assignee equals `expected_assignee` when given, and the guarded courier
/// is under cap when a guard is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionCommand {
    pub service_id: ServiceId,
    pub expected_status: ServiceStatus,
    pub expected_assignee: Option<UserId>,
    pub patch: StatusPatch,
    pub capacity_guard: Option<CapacityGuard>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransfer {
    pub service_ref: ServiceId,
    pub from_courier_ref: UserId,
    pub to_courier_ref: UserId,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResponse {
    pub transfer_id: TransferId,
    pub responder: UserId,
    pub decision: TransferDecision,
    pub reason: Option<String>,
}

/// Both records after a transfer was answered.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOutcome {
    pub request: TransferRequest,
    pub service: Service,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferQuery {
    pub service: Option<ServiceId>,
    pub courier: Option<UserId>,
    pub status: Option<TransferStatus>,
}

impl TransferQuery {
    pub fn matches(&self, request: &TransferRequest) -> bool {
        self.service.map_or(true, |s| request.service_ref == s)
            && self.courier.map_or(true, |c| {
                request.from_courier_ref == c || request.to_courier_ref == c
            })
            && self.status.map_or(true, |s| request.status == s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub service_ref: ServiceId,
    pub author_ref: UserId,
    pub body: String,
}

/// CRUD API of the backend.
///
/// Every method is atomic: a call either applies all of its writes or none.
/// Effects are also published on the change feed.
#[async_trait]
pub trait ServiceApi: Send + Sync {
    async fn create_service(&self, requester: UserId, new: NewService) -> ApiResult<Service>;

    async fn get_service(&self, id: ServiceId) -> ApiResult<Service>;

    /// Matching services, most recently changed first.
    async fn list_services(&self, query: &ServiceQuery) -> ApiResult<Vec<Service>>;

    /// Edit non-status fields. Rejected on terminal services.
    async fn patch_service_fields(&self, id: ServiceId, patch: ServicePatch) -> ApiResult<Service>;

    /// The single atomic status+assignee endpoint.
    async fn transition_service(&self, command: TransitionCommand) -> ApiResult<Service>;

    /// Services held by the courier (assigned or en route).
    async fn count_active_for_courier(&self, courier: UserId) -> ApiResult<u32>;

    async fn create_transfer(&self, new: NewTransfer) -> ApiResult<TransferRequest>;

    /// Resolve a pending transfer; an accept reassigns the service in the
    /// same atomic step.
    async fn respond_transfer(&self, response: TransferResponse) -> ApiResult<TransferOutcome>;

    async fn get_transfer(&self, id: TransferId) -> ApiResult<TransferRequest>;

    async fn list_transfers(&self, query: &TransferQuery) -> ApiResult<Vec<TransferRequest>>;

    async fn post_message(&self, new: NewMessage) -> ApiResult<ThreadMessage>;

    /// Messages of one service thread, oldest first.
    async fn list_messages(&self, service: ServiceId) -> ApiResult<Vec<ThreadMessage>>;

    /// Stored config, or the unconstrained default for an unknown branch.
    async fn get_zone_config(&self, branch: BranchId) -> ApiResult<ZoneCapacityConfig>;

    async fn set_zone_config(&self, config: ZoneCapacityConfig) -> ApiResult<ZoneCapacityConfig>;
}

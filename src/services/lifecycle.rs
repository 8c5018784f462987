//! Service lifecycle: valid transitions, guards and side effects.
//!
//! `ServiceLifecycleMachine` is pure: it turns a transition request into a
//! `TransitionCommand` carrying every field the transition writes, so the
//! backend applies the whole change in one atomic call or not at all.
//! `LifecycleCoordinator` sends those commands.

use std::fmt;
use std::sync::Arc;

use tracing::info;

use super::{bounded, Backend, RecordRefresher, ZoneCapacityGovernor};
use crate::config::CoordinatorConfig;
use crate::error::{ConflictKind, DispatchError, Result};
use crate::model::{Role, Service, ServiceId, ServiceStatus, SessionIdentity, UserId, ZoneId};
use crate::storage::{AssigneeChange, ServiceApi, StatusPatch, TransitionCommand};

/// A requested status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// available → assigned.
    Assign { courier: UserId },
    /// assigned → en_route. Uses the service's zone when none is given.
    StartRoute { zone: Option<ZoneId> },
    /// en_route → delivered.
    Deliver,
    /// delivered → paid.
    MarkPaid,
    /// available|assigned → cancelled.
    Cancel { reason: String },
    /// assigned|en_route → available. Dispatcher only.
    Revert,
}

impl Transition {
    pub fn target(&self) -> ServiceStatus {
        match self {
            Self::Assign { .. } => ServiceStatus::Assigned,
            Self::StartRoute { .. } => ServiceStatus::EnRoute,
            Self::Deliver => ServiceStatus::Delivered,
            Self::MarkPaid => ServiceStatus::Paid,
            Self::Cancel { .. } => ServiceStatus::Cancelled,
            Self::Revert => ServiceStatus::Available,
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Assign { .. } => "assign",
            Self::StartRoute { .. } => "start_route",
            Self::Deliver => "deliver",
            Self::MarkPaid => "mark_paid",
            Self::Cancel { .. } => "cancel",
            Self::Revert => "revert",
        })
    }
}

/// Pure transition planner.
pub struct ServiceLifecycleMachine;

impl ServiceLifecycleMachine {
    /// Validate `transition` against the current copy of `service` and the
    /// acting identity, and build the conditional update that performs it.
    ///
    /// The command's expected status (and assignee, where one is held)
    /// pins the state this plan was made from; if the backend has moved on,
    /// the update is rejected rather than applied to a different state.
    pub fn plan(
        service: &Service,
        transition: &Transition,
        actor: &SessionIdentity,
    ) -> Result<TransitionCommand> {
        let target = transition.target();
        if !service.status.can_transition_to(target) {
            return Err(Self::out_of_order(service, transition));
        }

        let patch = match transition {
            Transition::Assign { courier } => {
                let self_claim = actor.role == Role::Courier && actor.user_id == *courier;
                if !self_claim && !actor.is_dispatcher() {
                    return Err(DispatchError::validation(
                        "courier",
                        "couriers may only claim services for themselves",
                    ));
                }
                StatusPatch {
                    assignee: AssigneeChange::Set(*courier),
                    ..StatusPatch::to(target)
                }
            }
            Transition::StartRoute { zone } => {
                Self::require_holder_or_dispatcher(service, actor)?;
                let zone = zone.or(service.zone_ref).ok_or_else(|| {
                    DispatchError::validation(
                        "zone_ref",
                        "a zone must be resolved before the route starts",
                    )
                })?;
                StatusPatch {
                    zone_ref: Some(zone),
                    ..StatusPatch::to(target)
                }
            }
            Transition::Deliver | Transition::MarkPaid => {
                Self::require_holder_or_dispatcher(service, actor)?;
                StatusPatch::to(target)
            }
            Transition::Cancel { reason } => {
                let reason = reason.trim();
                if reason.is_empty() {
                    return Err(DispatchError::validation(
                        "reason",
                        "a reason is required to cancel a service",
                    ));
                }
                let owner = actor.role == Role::Requester && actor.user_id == service.requester_ref;
                if !owner && !actor.is_dispatcher() {
                    return Err(DispatchError::validation(
                        "role",
                        "only the requester or a dispatcher may cancel a service",
                    ));
                }
                StatusPatch {
                    assignee: AssigneeChange::Clear,
                    cancellation_reason: Some(reason.to_string()),
                    ..StatusPatch::to(target)
                }
            }
            Transition::Revert => {
                if !actor.is_dispatcher() {
                    return Err(DispatchError::validation(
                        "role",
                        "only a dispatcher may return a service to the pool",
                    ));
                }
                StatusPatch {
                    assignee: AssigneeChange::Clear,
                    ..StatusPatch::to(target)
                }
            }
        };

        Ok(TransitionCommand {
            service_id: service.id,
            expected_status: service.status,
            expected_assignee: service.assigned_courier_ref,
            patch,
            capacity_guard: None,
        })
    }

    fn require_holder_or_dispatcher(service: &Service, actor: &SessionIdentity) -> Result<()> {
        if actor.is_dispatcher() {
            return Ok(());
        }
        if actor.role == Role::Courier && service.assigned_courier_ref == Some(actor.user_id) {
            return Ok(());
        }
        if actor.role == Role::Courier {
            return Err(DispatchError::Conflict(ConflictKind::NotAssignee {
                service_id: service.id,
            }));
        }
        Err(DispatchError::validation(
            "role",
            "only the assigned courier or a dispatcher may do this",
        ))
    }

    fn out_of_order(service: &Service, transition: &Transition) -> DispatchError {
        match transition {
            Transition::Assign { .. } if service.status != ServiceStatus::Available => {
                DispatchError::Conflict(ConflictKind::AlreadyTaken {
                    service_id: service.id,
                    status: service.status,
                })
            }
            _ if service.status.is_terminal() || transition.target() == service.status => {
                DispatchError::validation(
                    "status",
                    format!("cannot {transition} a service that is {}", service.status),
                )
            }
            _ => DispatchError::Conflict(ConflictKind::StaleStatus {
                service_id: service.id,
                expected: Self::required_status(transition),
                actual: service.status,
            }),
        }
    }

    fn required_status(transition: &Transition) -> ServiceStatus {
        match transition {
            Transition::Assign { .. } | Transition::Cancel { .. } => ServiceStatus::Available,
            Transition::StartRoute { .. } | Transition::Revert => ServiceStatus::Assigned,
            Transition::Deliver => ServiceStatus::EnRoute,
            Transition::MarkPaid => ServiceStatus::Delivered,
        }
    }
}

/// Single entry point for status changes made by dispatchers and the
/// holding courier.
pub struct LifecycleCoordinator {
    backend: Backend,
    governor: Arc<ZoneCapacityGovernor>,
}

impl LifecycleCoordinator {
    pub fn new(
        api: Arc<dyn ServiceApi>,
        governor: Arc<ZoneCapacityGovernor>,
        config: &CoordinatorConfig,
    ) -> Self {
        Self {
            backend: Backend::new(api, config.request_timeout()),
            governor,
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn RecordRefresher>) -> Self {
        self.backend.refresher = Some(refresher);
        self
    }

    /// Dispatcher assignment of an available service. Subject to the same
    /// capacity guard as a claim.
    pub async fn assign(
        &self,
        actor: &SessionIdentity,
        service_id: ServiceId,
        courier: UserId,
    ) -> Result<Service> {
        self.apply(actor, service_id, Transition::Assign { courier })
            .await
    }

    pub async fn start_route(
        &self,
        actor: &SessionIdentity,
        service_id: ServiceId,
        zone: Option<ZoneId>,
    ) -> Result<Service> {
        self.apply(actor, service_id, Transition::StartRoute { zone })
            .await
    }

    pub async fn mark_delivered(&self, actor: &SessionIdentity, service_id: ServiceId) -> Result<Service> {
        self.apply(actor, service_id, Transition::Deliver).await
    }

    pub async fn mark_paid(&self, actor: &SessionIdentity, service_id: ServiceId) -> Result<Service> {
        self.apply(actor, service_id, Transition::MarkPaid).await
    }

    pub async fn cancel(
        &self,
        actor: &SessionIdentity,
        service_id: ServiceId,
        reason: impl Into<String>,
    ) -> Result<Service> {
        self.apply(
            actor,
            service_id,
            Transition::Cancel {
                reason: reason.into(),
            },
        )
        .await
    }

    /// Return a held service to the available pool, clearing its courier.
    pub async fn revert(&self, actor: &SessionIdentity, service_id: ServiceId) -> Result<Service> {
        self.apply(actor, service_id, Transition::Revert).await
    }

    /// Plan and send one transition.
    #[tracing::instrument(
        name = "lifecycle.apply",
        skip(self, actor),
        fields(actor = %actor.user_id, role = %actor.role)
    )]
    pub async fn apply(
        &self,
        actor: &SessionIdentity,
        service_id: ServiceId,
        transition: Transition,
    ) -> Result<Service> {
        let result = self.try_apply(actor, service_id, &transition).await;
        match &result {
            Ok(service) => {
                info!(status = %service.status, "Transition applied");
                self.backend.reflect(service);
            }
            Err(e) => {
                info!(error = %e, "Transition rejected");
                self.backend.refetch_after(service_id, e).await;
            }
        }
        result
    }

    async fn try_apply(
        &self,
        actor: &SessionIdentity,
        service_id: ServiceId,
        transition: &Transition,
    ) -> Result<Service> {
        let service = self.backend.fetch(service_id).await?;
        let mut command = ServiceLifecycleMachine::plan(&service, transition, actor)?;
        if let Transition::Assign { courier } = transition {
            command.capacity_guard = self
                .governor
                .capacity_guard(service.branch_ref.or(actor.branch_ref), *courier)
                .await?;
        }
        bounded(
            self.backend.timeout,
            "transition_service",
            self.backend.api.transition_service(command),
        )
        .await
    }
}

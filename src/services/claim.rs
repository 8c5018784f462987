//! Optimistic claims of available services by couriers.

use std::sync::Arc;

use tracing::{info, warn};

use super::{Backend, RecordRefresher, ServiceLifecycleMachine, Transition, ZoneCapacityGovernor};
use crate::config::CoordinatorConfig;
use crate::error::{ClaimError, ConflictKind, DispatchError};
use crate::model::{Role, Service, ServiceId, ServiceStatus, SessionIdentity, UserId};
use crate::storage::{ApiError, ServiceApi};

/// Takes an available service for a courier.
///
/// The outcome is decided only by the backend's conditional update: it
/// succeeds while the service is still available and, in a constrained
/// branch, the courier is under cap. No local lock spans the call, so
/// callers debounce repeated taps themselves. A claim that times out is
/// reported as a transport error and is never retried here.
pub struct ClaimCoordinator {
    backend: Backend,
    governor: Arc<ZoneCapacityGovernor>,
}

impl ClaimCoordinator {
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

    /// Claim `service_id` for `courier_id`.
    ///
    /// Rejections distinguish an already-taken service, an exceeded
    /// capacity cap and a missing service. Each triggers a re-fetch of the
    /// record so the local view shows who actually won.
    #[tracing::instrument(name = "claim", skip(self), fields(service_id = %service_id, courier_id = %courier_id))]
    pub async fn claim(
        &self,
        service_id: ServiceId,
        courier_id: UserId,
    ) -> Result<Service, ClaimError> {
        match self.try_claim(service_id, courier_id).await {
            Ok(service) => {
                info!("Claim accepted");
                self.backend.reflect(&service);
                Ok(service)
            }
            Err(e) => {
                warn!(error = %e, "Claim rejected");
                self.backend.refetch_after(service_id, &e).await;
                Err(e)
            }
        }
    }

    async fn try_claim(&self, service_id: ServiceId, courier_id: UserId) -> Result<Service, ClaimError> {
        let service = self.backend.fetch(service_id).await?;
        let actor = SessionIdentity::new(courier_id, Role::Courier, service.branch_ref);
        let mut command = ServiceLifecycleMachine::plan(
            &service,
            &Transition::Assign {
                courier: courier_id,
            },
            &actor,
        )?;
        command.capacity_guard = self
            .governor
            .capacity_guard(service.branch_ref, courier_id)
            .await?;

        let timeout = self.backend.timeout;
        match tokio::time::timeout(timeout, self.backend.api.transition_service(command)).await {
            Ok(Ok(claimed)) => Ok(claimed),
            Ok(Err(ApiError::StatusMismatch {
                service_id,
                expected: ServiceStatus::Available,
                actual,
            })) => Err(DispatchError::Conflict(ConflictKind::AlreadyTaken {
                service_id,
                status: actual,
            })),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(DispatchError::Transport(format!(
                "claim got no response within {}ms",
                timeout.as_millis()
            ))),
        }
    }
}

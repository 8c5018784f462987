//! Branch-level concurrent-job caps for constrained-capacity mode.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::bounded;
use crate::error::{DispatchError, Result};
use crate::model::{BranchId, SessionIdentity, UserId, ZoneCapacityConfig};
use crate::storage::{CapacityGuard, ServiceApi};

/// Reads and updates branch capacity config and builds the guard claims
/// carry to the backend.
pub struct ZoneCapacityGovernor {
    api: Arc<dyn ServiceApi>,
    timeout: Duration,
}

impl ZoneCapacityGovernor {
    pub fn new(api: Arc<dyn ServiceApi>, timeout: Duration) -> Self {
        Self { api, timeout }
    }

    pub async fn get_config(&self, branch: BranchId) -> Result<ZoneCapacityConfig> {
        bounded(self.timeout, "get_zone_config", self.api.get_zone_config(branch)).await
    }

    /// Replace a branch's config. Dispatchers only, and only for their own
    /// branch when the session is bound to one.
    #[tracing::instrument(skip(self, actor, config), fields(actor = %actor.user_id))]
    pub async fn set_config(
        &self,
        actor: &SessionIdentity,
        branch: BranchId,
        config: ZoneCapacityConfig,
    ) -> Result<ZoneCapacityConfig> {
        if !actor.is_dispatcher() {
            return Err(DispatchError::validation(
                "role",
                "only dispatchers may change branch capacity",
            ));
        }
        if actor.branch_ref.is_some_and(|own| own != branch) {
            return Err(DispatchError::validation(
                "branch_ref",
                "dispatchers may only configure their own branch",
            ));
        }
        let config = ZoneCapacityConfig {
            branch_ref: branch,
            ..config
        };
        config.validate()?;

        let stored =
            bounded(self.timeout, "set_zone_config", self.api.set_zone_config(config)).await?;
        info!(
            low_demand = stored.low_demand_enabled,
            max = stored.max_concurrent_services_per_courier,
            "Branch capacity updated"
        );
        Ok(stored)
    }

    /// Guard for a claim by `courier` in `branch`.
    ///
    /// Returns `None` when the branch is unconstrained. Under low-demand
    /// mode the courier's current load is checked first so an obviously
    /// over-cap claim fails without a write; the returned guard repeats the
    /// check atomically on the backend.
    pub async fn capacity_guard(
        &self,
        branch: Option<BranchId>,
        courier: UserId,
    ) -> Result<Option<CapacityGuard>> {
        let Some(branch) = branch else {
            return Ok(None);
        };
        let config = self.get_config(branch).await?;
        if !config.low_demand_enabled {
            return Ok(None);
        }

        let max = config.max_concurrent_services_per_courier;
        let active = bounded(
            self.timeout,
            "count_active_for_courier",
            self.api.count_active_for_courier(courier),
        )
        .await?;
        debug!(courier_id = %courier, active, max, "Checked courier load");
        if active >= max {
            return Err(DispatchError::Capacity {
                courier,
                active,
                max,
            });
        }
        Ok(Some(CapacityGuard {
            courier,
            max_concurrent: max,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::memory_backend;

    fn constrained(branch: BranchId, max: u32) -> ZoneCapacityConfig {
        ZoneCapacityConfig {
            branch_ref: branch,
            low_demand_enabled: true,
            max_concurrent_services_per_courier: max,
        }
    }

    #[tokio::test]
    async fn test_set_config_is_dispatcher_only() {
        let governor = ZoneCapacityGovernor::new(memory_backend(), Duration::from_secs(1));
        let branch = BranchId::new();
        let courier = SessionIdentity::courier(UserId::new(), branch);

        let err = governor
            .set_config(&courier, branch, constrained(branch, 2))
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(!governor.get_config(branch).await.unwrap().low_demand_enabled);
    }

    #[tokio::test]
    async fn test_dispatcher_limited_to_own_branch() {
        let governor = ZoneCapacityGovernor::new(memory_backend(), Duration::from_secs(1));
        let own = BranchId::new();
        let other = BranchId::new();
        let dispatcher = SessionIdentity::dispatcher(UserId::new(), own);

        assert!(governor
            .set_config(&dispatcher, other, constrained(other, 2))
            .await
            .unwrap_err()
            .is_validation());
        let stored = governor
            .set_config(&dispatcher, own, constrained(other, 2))
            .await
            .unwrap();
        assert_eq!(stored.branch_ref, own);
    }

    #[tokio::test]
    async fn test_unconstrained_branch_has_no_guard() {
        let governor = ZoneCapacityGovernor::new(memory_backend(), Duration::from_secs(1));
        let guard = governor
            .capacity_guard(Some(BranchId::new()), UserId::new())
            .await
            .unwrap();
        assert!(guard.is_none());
        assert!(governor
            .capacity_guard(None, UserId::new())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_constrained_branch_yields_guard() {
        let backend = memory_backend();
        let governor = ZoneCapacityGovernor::new(backend.clone(), Duration::from_secs(1));
        let branch = BranchId::new();
        backend.set_zone_config(constrained(branch, 3)).await.unwrap();
        let courier = UserId::new();

        let guard = governor
            .capacity_guard(Some(branch), courier)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(guard.max_concurrent, 3);
        assert_eq!(guard.courier, courier);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transport_error() {
        let backend = memory_backend();
        backend.set_unreachable(true);
        let governor = ZoneCapacityGovernor::new(backend, Duration::from_secs(1));

        let err = governor.get_config(BranchId::new()).await.unwrap_err();
        assert!(err.is_transport());
    }
}

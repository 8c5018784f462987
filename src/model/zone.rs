//! Branch-level capacity configuration.

use serde::{Deserialize, Serialize};

use super::ids::BranchId;
use crate::error::ValidationError;

/// Default per-courier cap applied when a branch has never been configured.
pub const DEFAULT_MAX_CONCURRENT_SERVICES: u32 = 3;

/// Constrained-capacity ("low demand") settings of one branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneCapacityConfig {
    pub branch_ref: BranchId,
    /// When true, couriers may hold at most `max_concurrent_services_per_courier`
    /// assigned/en-route services.
    pub low_demand_enabled: bool,
    pub max_concurrent_services_per_courier: u32,
}

impl ZoneCapacityConfig {
    /// Unconstrained configuration for a branch that has none stored.
    pub fn unconstrained(branch_ref: BranchId) -> Self {
        Self {
            branch_ref,
            low_demand_enabled: false,
            max_concurrent_services_per_courier: DEFAULT_MAX_CONCURRENT_SERVICES,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_concurrent_services_per_courier == 0 {
            return Err(ValidationError::new(
                "max_concurrent_services_per_courier",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

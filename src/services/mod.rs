//! Coordinators that turn user actions into backend calls.
//!
//! Coordinators treat their own writes as proposals: the backend's atomic
//! conditional update decides the outcome, and local views converge through
//! the change feed. None of them hold a lock across a backend call or retry
//! on their own.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{DispatchError, Result};
use crate::model::{Service, ServiceId};
use crate::storage::{ApiError, ApiResult, ServiceApi};

pub mod capacity;
pub mod claim;
pub mod lifecycle;
pub mod transfer;
pub mod unread;

pub use capacity::ZoneCapacityGovernor;
pub use claim::ClaimCoordinator;
pub use lifecycle::{LifecycleCoordinator, ServiceLifecycleMachine, Transition};
pub use transfer::TransferCoordinator;
pub use unread::{UnreadActivityTracker, UnreadWatermark};

/// Receives authoritative copies of records after an actionable error or a
/// successful write, so local views converge without waiting for the feed.
pub trait RecordRefresher: Send + Sync {
    /// Latest backend copy of a service.
    fn refresh(&self, service: &Service);

    /// The service no longer exists.
    fn forget(&self, id: ServiceId);
}

/// Await a backend call, treating no response within `timeout` as a
/// transport failure.
pub(crate) async fn bounded<T, F>(timeout: Duration, operation: &'static str, call: F) -> Result<T>
where
    F: Future<Output = ApiResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(DispatchError::from),
        Err(_) => {
            warn!(operation, ?timeout, "Backend call timed out");
            Err(DispatchError::Transport(format!(
                "{operation} got no response within {}ms",
                timeout.as_millis()
            )))
        }
    }
}

/// Shared plumbing for coordinators: the API handle, the request bound
/// and an optional refresher.
#[derive(Clone)]
pub(crate) struct Backend {
    pub api: Arc<dyn ServiceApi>,
    pub timeout: Duration,
    pub refresher: Option<Arc<dyn RecordRefresher>>,
}

impl Backend {
    pub fn new(api: Arc<dyn ServiceApi>, timeout: Duration) -> Self {
        Self {
            api,
            timeout,
            refresher: None,
        }
    }

    pub async fn fetch(&self, id: ServiceId) -> Result<Service> {
        let result = bounded(self.timeout, "get_service", self.api.get_service(id)).await;
        if let Err(e) = &result {
            if e.is_not_found() {
                self.forget(id);
            }
        }
        result
    }

    pub fn reflect(&self, service: &Service) {
        if let Some(refresher) = &self.refresher {
            refresher.refresh(service);
        }
    }

    pub fn forget(&self, id: ServiceId) {
        if let Some(refresher) = &self.refresher {
            refresher.forget(id);
        }
    }

    /// After a conflict, capacity or not-found rejection, re-read the
    /// affected service and hand it to the refresher.
    pub async fn refetch_after(&self, id: ServiceId, err: &DispatchError) {
        if !err.should_refetch() || self.refresher.is_none() {
            return;
        }
        match tokio::time::timeout(self.timeout, self.api.get_service(id)).await {
            Ok(Ok(service)) => self.reflect(&service),
            Ok(Err(ApiError::NotFound { .. })) => self.forget(id),
            Ok(Err(e)) => debug!(service_id = %id, error = %e, "Re-fetch after rejection failed"),
            Err(_) => debug!(service_id = %id, "Re-fetch after rejection timed out"),
        }
    }
}

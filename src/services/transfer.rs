//! Courier-to-courier handoff of held services.

use std::sync::Arc;

use tracing::{info, warn};

use super::{bounded, Backend, RecordRefresher};
use crate::config::CoordinatorConfig;
use crate::error::{DispatchError, Result};
use crate::model::{ServiceId, TransferDecision, TransferId, TransferRequest, TransferStatus, UserId};
use crate::storage::{NewTransfer, ServiceApi, TransferOutcome, TransferQuery, TransferResponse};

/// Two-party request/accept/reject protocol.
///
/// An accepted transfer reassigns the service in the same backend call
/// that resolves the request and never routes it through `available`.
pub struct TransferCoordinator {
    backend: Backend,
}

impl TransferCoordinator {
    pub fn new(api: Arc<dyn ServiceApi>, config: &CoordinatorConfig) -> Self {
        Self {
            backend: Backend::new(api, config.request_timeout()),
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn RecordRefresher>) -> Self {
        self.backend.refresher = Some(refresher);
        self
    }

    /// Ask `to_courier` to take over `service_id` from `from_courier`.
    ///
    /// Fails with a conflict if a request is already pending for the
    /// service or `from_courier` no longer holds it.
    #[tracing::instrument(name = "transfer.request", skip(self, reason), fields(service_id = %service_id))]
    pub async fn request(
        &self,
        service_id: ServiceId,
        from_courier: UserId,
        to_courier: UserId,
        reason: Option<String>,
    ) -> Result<TransferRequest> {
        if from_courier == to_courier {
            return Err(DispatchError::validation(
                "to_courier_ref",
                "choose a different courier to hand this service to",
            ));
        }
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());

        let new = NewTransfer {
            service_ref: service_id,
            from_courier_ref: from_courier,
            to_courier_ref: to_courier,
            reason,
        };
        match bounded(
            self.backend.timeout,
            "create_transfer",
            self.backend.api.create_transfer(new),
        )
        .await
        {
            Ok(request) => {
                info!(transfer_id = %request.id, "Transfer requested");
                Ok(request)
            }
            Err(e) => {
                warn!(error = %e, "Transfer request rejected");
                self.backend.refetch_after(service_id, &e).await;
                Err(e)
            }
        }
    }

    /// Answer a pending request as `responder`, who must be its recipient.
    #[tracing::instrument(name = "transfer.respond", skip(self, reason), fields(transfer_id = %request_id))]
    pub async fn respond(
        &self,
        responder: UserId,
        request_id: TransferId,
        decision: TransferDecision,
        reason: Option<String>,
    ) -> Result<TransferOutcome> {
        let request = bounded(
            self.backend.timeout,
            "get_transfer",
            self.backend.api.get_transfer(request_id),
        )
        .await?;
        if request.to_courier_ref != responder {
            return Err(DispatchError::validation(
                "responder",
                "only the receiving courier may answer this transfer",
            ));
        }

        let response = TransferResponse {
            transfer_id: request_id,
            responder,
            decision,
            reason: reason.filter(|r| !r.trim().is_empty()),
        };
        match bounded(
            self.backend.timeout,
            "respond_transfer",
            self.backend.api.respond_transfer(response),
        )
        .await
        {
            Ok(outcome) => {
                info!(
                    decision = %outcome.request.status,
                    assignee = ?outcome.service.assigned_courier_ref,
                    "Transfer resolved"
                );
                self.backend.reflect(&outcome.service);
                Ok(outcome)
            }
            Err(e) => {
                warn!(error = %e, "Transfer response rejected");
                self.backend.refetch_after(request.service_ref, &e).await;
                Err(e)
            }
        }
    }

    /// Pending requests addressed to `courier`.
    pub async fn incoming(&self, courier: UserId) -> Result<Vec<TransferRequest>> {
        let query = TransferQuery {
            courier: Some(courier),
            status: Some(TransferStatus::Pending),
            ..TransferQuery::default()
        };
        let requests = bounded(
            self.backend.timeout,
            "list_transfers",
            self.backend.api.list_transfers(&query),
        )
        .await?;
        Ok(requests
            .into_iter()
            .filter(|r| r.to_courier_ref == courier)
            .collect())
    }

    /// Pending requests sent by `courier`.
    pub async fn outgoing(&self, courier: UserId) -> Result<Vec<TransferRequest>> {
        let query = TransferQuery {
            courier: Some(courier),
            status: Some(TransferStatus::Pending),
            ..TransferQuery::default()
        };
        let requests = bounded(
            self.backend.timeout,
            "list_transfers",
            self.backend.api.list_transfers(&query),
        )
        .await?;
        Ok(requests
            .into_iter()
            .filter(|r| r.from_courier_ref == courier)
            .collect())
    }
}

//! In-memory backend for standalone mode and tests.
//!
//! All records live behind one mutex, so every call is atomic. Each
//! mutation is published on the change feed while the lock is held,
//! which keeps feed order identical to commit order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    ApiError, ApiResult, NewMessage, NewTransfer, ServiceApi, ServiceQuery, TransferOutcome,
    TransferQuery, TransferResponse, TransitionCommand,
};
use crate::bus::{ChangeEvent, ChannelFeed};
use crate::model::{
    entity, BranchId, MessageId, NewService, Service, ServiceId, ServicePatch, ThreadMessage,
    TransferDecision, TransferId, TransferRequest, TransferStatus, UserId, ZoneCapacityConfig,
};

#[derive(Default)]
struct BackendState {
    services: HashMap<ServiceId, Service>,
    transfers: HashMap<TransferId, TransferRequest>,
    messages: Vec<ThreadMessage>,
    zone_configs: HashMap<BranchId, ZoneCapacityConfig>,
}

impl BackendState {
    fn service(&self, id: ServiceId) -> ApiResult<&Service> {
        self.services.get(&id).ok_or_else(|| service_not_found(id))
    }

    fn held_by(&self, courier: UserId) -> u32 {
        let held = self
            .services
            .values()
            .filter(|s| s.is_held_by(courier))
            .count();
        u32::try_from(held).unwrap_or(u32::MAX)
    }
}

fn service_not_found(id: ServiceId) -> ApiError {
    ApiError::NotFound {
        entity: "service",
        id: id.to_string(),
    }
}

/// In-memory implementation of `ServiceApi`.
///
/// Supports failure injection: `set_unreachable` makes every call fail
/// with `ApiError::Unreachable`, `set_response_delay` stalls every call
/// before it touches state, and `set_listing_delay` stalls list responses
/// after their snapshot is taken.
pub struct MemoryBackend {
    state: Mutex<BackendState>,
    feed: Arc<ChannelFeed>,
    unreachable: AtomicBool,
    delay_ms: AtomicU64,
    listing_delay_ms: AtomicU64,
}

impl MemoryBackend {
    pub fn new(feed: Arc<ChannelFeed>) -> Self {
        info!("Memory backend initialized");
        Self {
            state: Mutex::new(BackendState::default()),
            feed,
            unreachable: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            listing_delay_ms: AtomicU64::new(0),
        }
    }

    pub fn feed(&self) -> &Arc<ChannelFeed> {
        &self.feed
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_response_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.delay_ms.store(ms, Ordering::SeqCst);
    }

    pub fn set_listing_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.listing_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Store a service as-is, publishing an insert. Used to load fixtures.
    pub async fn seed_service(&self, service: Service) {
        let mut state = self.state.lock().await;
        self.publish(ChangeEvent::insert(entity::SERVICES, &service));
        state.services.insert(service.id, service);
    }

    /// Remove a service outside the API, as an external deletion would.
    pub async fn delete_service(&self, id: ServiceId) -> ApiResult<Service> {
        self.precheck().await?;
        let mut state = self.state.lock().await;
        let removed = state
            .services
            .remove(&id)
            .ok_or_else(|| service_not_found(id))?;
        self.publish(ChangeEvent::delete(entity::SERVICES, &removed));
        info!(service_id = %id, "Service deleted");
        Ok(removed)
    }

    async fn precheck(&self) -> ApiResult<()> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ApiError::Unreachable(
                "memory backend is marked unreachable".to_string(),
            ));
        }
        Ok(())
    }

    /// Reject pending transfers of a service whose holder no longer offers
    /// them, so the next holder can request a transfer again.
    fn void_pending_transfers(&self, state: &mut BackendState, service: &Service) {
        let now = Utc::now();
        let reason = if service.status.is_held() {
            "service was reassigned".to_string()
        } else {
            format!("service is {}", service.status)
        };
        for request in state.transfers.values_mut() {
            if request.service_ref != service.id || !request.is_pending() {
                continue;
            }
            let old = request.clone();
            request.status = TransferStatus::Rejected;
            request.response_reason = Some(reason.clone());
            request.resolved_at = Some(now);
            self.publish(ChangeEvent::update(entity::TRANSFER_REQUESTS, &old, &*request));
            info!(
                transfer_id = %request.id,
                service_id = %service.id,
                "Pending transfer voided"
            );
        }
    }

    fn publish(&self, event: crate::bus::Result<ChangeEvent>) {
        match event {
            Ok(event) => {
                self.feed.publish(event);
            }
            Err(e) => warn!(error = %e, "Failed to encode change event"),
        }
    }
}

#[async_trait]
impl ServiceApi for MemoryBackend {
    async fn create_service(&self, requester: UserId, new: NewService) -> ApiResult<Service> {
        self.precheck().await?;
        new.validate()
            .map_err(|e| ApiError::Invalid(e.to_string()))?;

        let service = Service::from_new(ServiceId::new(), requester, new, Utc::now());
        let mut state = self.state.lock().await;
        self.publish(ChangeEvent::insert(entity::SERVICES, &service));
        state.services.insert(service.id, service.clone());
        info!(service_id = %service.id, requester_id = %requester, "Service created");
        Ok(service)
    }

    async fn get_service(&self, id: ServiceId) -> ApiResult<Service> {
        self.precheck().await?;
        let state = self.state.lock().await;
        state.service(id).cloned()
    }

    async fn list_services(&self, query: &ServiceQuery) -> ApiResult<Vec<Service>> {
        self.precheck().await?;
        let state = self.state.lock().await;
        let mut services: Vec<Service> = state
            .services
            .values()
            .filter(|s| query.matches(s))
            .cloned()
            .collect();
        drop(state);
        services.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        let listing_delay = self.listing_delay_ms.load(Ordering::SeqCst);
        if listing_delay > 0 {
            tokio::time::sleep(Duration::from_millis(listing_delay)).await;
        }
        Ok(services)
    }

    async fn patch_service_fields(&self, id: ServiceId, patch: ServicePatch) -> ApiResult<Service> {
        self.precheck().await?;
        patch
            .validate()
            .map_err(|e| ApiError::Invalid(e.to_string()))?;

        let mut state = self.state.lock().await;
        let old = state.service(id)?.clone();
        if old.status.is_terminal() {
            return Err(ApiError::Invalid(format!(
                "service {id} is {} and can no longer be edited",
                old.status
            )));
        }
        let mut updated = old.clone();
        patch.apply_to(&mut updated);
        updated.updated_at = Utc::now();

        self.publish(ChangeEvent::update(entity::SERVICES, &old, &updated));
        state.services.insert(id, updated.clone());
        debug!(service_id = %id, "Service fields patched");
        Ok(updated)
    }

    async fn transition_service(&self, command: TransitionCommand) -> ApiResult<Service> {
        self.precheck().await?;
        let mut state = self.state.lock().await;
        let old = state.service(command.service_id)?.clone();

        if old.status != command.expected_status {
            debug!(
                service_id = %command.service_id,
                expected = %command.expected_status,
                actual = %old.status,
                "Transition precondition failed"
            );
            return Err(ApiError::StatusMismatch {
                service_id: command.service_id,
                expected: command.expected_status,
                actual: old.status,
            });
        }
        if let Some(expected) = command.expected_assignee {
            if old.assigned_courier_ref != Some(expected) {
                return Err(ApiError::AssigneeMismatch {
                    service_id: command.service_id,
                });
            }
        }
        if !old.status.can_transition_to(command.patch.status) {
            return Err(ApiError::Invalid(format!(
                "cannot move service from {} to {}",
                old.status, command.patch.status
            )));
        }
        if let Some(guard) = command.capacity_guard {
            let active = state.held_by(guard.courier);
            if active >= guard.max_concurrent {
                return Err(ApiError::CapacityExceeded {
                    courier: guard.courier,
                    active,
                    max: guard.max_concurrent,
                });
            }
        }

        let mut updated = old.clone();
        command.patch.apply_to(&mut updated, Utc::now());
        if !updated.assignment_consistent() {
            return Err(ApiError::Invalid(format!(
                "{} service must {} an assigned courier",
                updated.status,
                if updated.assigned_courier_ref.is_some() {
                    "not have"
                } else {
                    "have"
                }
            )));
        }

        self.publish(ChangeEvent::update(entity::SERVICES, &old, &updated));
        state.services.insert(updated.id, updated.clone());
        if updated.assigned_courier_ref != old.assigned_courier_ref || !updated.status.is_held() {
            self.void_pending_transfers(&mut state, &updated);
        }
        info!(
            service_id = %updated.id,
            from = %old.status,
            to = %updated.status,
            "Service transitioned"
        );
        Ok(updated)
    }

    async fn count_active_for_courier(&self, courier: UserId) -> ApiResult<u32> {
        self.precheck().await?;
        let state = self.state.lock().await;
        Ok(state.held_by(courier))
    }

    async fn create_transfer(&self, new: NewTransfer) -> ApiResult<TransferRequest> {
        self.precheck().await?;
        if new.from_courier_ref == new.to_courier_ref {
            return Err(ApiError::Invalid(
                "a service cannot be transferred to its current courier".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        let service = state.service(new.service_ref)?;
        if !service.is_held_by(new.from_courier_ref) {
            return Err(ApiError::AssigneeMismatch {
                service_id: new.service_ref,
            });
        }
        if state
            .transfers
            .values()
            .any(|t| t.service_ref == new.service_ref && t.is_pending())
        {
            return Err(ApiError::DuplicatePendingTransfer {
                service_id: new.service_ref,
            });
        }

        let request = TransferRequest {
            id: TransferId::new(),
            service_ref: new.service_ref,
            from_courier_ref: new.from_courier_ref,
            to_courier_ref: new.to_courier_ref,
            status: TransferStatus::Pending,
            reason: new.reason,
            response_reason: None,
            created_at: Utc::now(),
            resolved_at: None,
        };
        self.publish(ChangeEvent::insert(entity::TRANSFER_REQUESTS, &request));
        state.transfers.insert(request.id, request.clone());
        info!(
            transfer_id = %request.id,
            service_id = %request.service_ref,
            "Transfer requested"
        );
        Ok(request)
    }

    async fn respond_transfer(&self, response: TransferResponse) -> ApiResult<TransferOutcome> {
        self.precheck().await?;
        let mut state = self.state.lock().await;
        let old_request = state
            .transfers
            .get(&response.transfer_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound {
                entity: "transfer",
                id: response.transfer_id.to_string(),
            })?;

        if !old_request.is_pending() {
            return Err(ApiError::TransferNotPending {
                transfer_id: old_request.id,
                status: old_request.status,
            });
        }
        if old_request.to_courier_ref != response.responder {
            return Err(ApiError::NotRecipient {
                transfer_id: old_request.id,
            });
        }

        let old_service = state.service(old_request.service_ref)?.clone();
        let now = Utc::now();
        let mut service = old_service.clone();

        if response.decision == TransferDecision::Accept {
            if !old_service.is_held_by(old_request.from_courier_ref) {
                return Err(ApiError::AssigneeMismatch {
                    service_id: old_service.id,
                });
            }
            service.assigned_courier_ref = Some(old_request.to_courier_ref);
            service.assigned_at = Some(now);
            service.updated_at = now;
        }

        let mut request = old_request.clone();
        request.status = response.decision.resulting_status();
        request.response_reason = response.reason;
        request.resolved_at = Some(now);

        self.publish(ChangeEvent::update(
            entity::TRANSFER_REQUESTS,
            &old_request,
            &request,
        ));
        state.transfers.insert(request.id, request.clone());
        if service != old_service {
            self.publish(ChangeEvent::update(entity::SERVICES, &old_service, &service));
            state.services.insert(service.id, service.clone());
        }
        info!(
            transfer_id = %request.id,
            service_id = %service.id,
            decision = %request.status,
            "Transfer resolved"
        );
        Ok(TransferOutcome { request, service })
    }

    async fn get_transfer(&self, id: TransferId) -> ApiResult<TransferRequest> {
        self.precheck().await?;
        let state = self.state.lock().await;
        state
            .transfers
            .get(&id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound {
                entity: "transfer",
                id: id.to_string(),
            })
    }

    async fn list_transfers(&self, query: &TransferQuery) -> ApiResult<Vec<TransferRequest>> {
        self.precheck().await?;
        let state = self.state.lock().await;
        let mut transfers: Vec<TransferRequest> = state
            .transfers
            .values()
            .filter(|t| query.matches(t))
            .cloned()
            .collect();
        transfers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(transfers)
    }

    async fn post_message(&self, new: NewMessage) -> ApiResult<ThreadMessage> {
        self.precheck().await?;
        if new.body.trim().is_empty() {
            return Err(ApiError::Invalid("message body cannot be empty".to_string()));
        }
        let mut state = self.state.lock().await;
        state.service(new.service_ref)?;

        let message = ThreadMessage {
            id: MessageId::new(),
            service_ref: new.service_ref,
            author_ref: new.author_ref,
            body: new.body,
            created_at: Utc::now(),
        };
        self.publish(ChangeEvent::insert(entity::MESSAGES, &message));
        state.messages.push(message.clone());
        debug!(service_id = %message.service_ref, message_id = %message.id, "Message posted");
        Ok(message)
    }

    async fn list_messages(&self, service: ServiceId) -> ApiResult<Vec<ThreadMessage>> {
        self.precheck().await?;
        let state = self.state.lock().await;
        Ok(state
            .messages
            .iter()
            .filter(|m| m.service_ref == service)
            .cloned()
            .collect())
    }

    async fn get_zone_config(&self, branch: BranchId) -> ApiResult<ZoneCapacityConfig> {
        self.precheck().await?;
        let state = self.state.lock().await;
        Ok(state
            .zone_configs
            .get(&branch)
            .cloned()
            .unwrap_or_else(|| ZoneCapacityConfig::unconstrained(branch)))
    }

    async fn set_zone_config(&self, config: ZoneCapacityConfig) -> ApiResult<ZoneCapacityConfig> {
        self.precheck().await?;
        config
            .validate()
            .map_err(|e| ApiError::Invalid(e.to_string()))?;

        let mut state = self.state.lock().await;
        match state.zone_configs.get(&config.branch_ref) {
            Some(old) => self.publish(ChangeEvent::update(entity::ZONE_CONFIGS, old, &config)),
            None => self.publish(ChangeEvent::insert(entity::ZONE_CONFIGS, &config)),
        }
        state.zone_configs.insert(config.branch_ref, config.clone());
        info!(
            branch_id = %config.branch_ref,
            low_demand = config.low_demand_enabled,
            max = config.max_concurrent_services_per_courier,
            "Zone capacity updated"
        );
        Ok(config)
    }
}

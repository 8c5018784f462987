//! Per-login application context.
//!
//! An `AppContext` is created when a user logs in and torn down on logout.
//! It owns everything session-scoped: the change feed client, the mounted
//! role view, the unread counters and the message log namespace. Nothing
//! here is global; components receive what they need from the context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{
    ChangeEvent, ChangeFeedClient, EventFilter, EventHandler, EventKind, FeedTransport,
    SubscriptionHandle,
};
use crate::cache::MessageCache;
use crate::config::Config;
use crate::error::{DispatchError, Result};
use crate::handlers::{LocalStateReconciler, RoleView, SyncedView};
use crate::model::{
    entity, NewService, Role, Service, ServiceId, ServicePatch, SessionIdentity, ThreadMessage,
    TransferDecision, TransferId, TransferRequest, UserId, ZoneId,
};
use crate::services::{
    bounded, ClaimCoordinator, LifecycleCoordinator, RecordRefresher, TransferCoordinator,
    UnreadActivityTracker, ZoneCapacityGovernor,
};
use crate::storage::{NewMessage, ServiceApi, TransferOutcome};

/// Shared dependencies a session is built from.
#[derive(Clone)]
pub struct SessionDeps {
    pub api: Arc<dyn ServiceApi>,
    pub transport: Arc<dyn FeedTransport>,
    pub cache: Arc<dyn MessageCache>,
    pub config: Config,
}

enum CacheWrite {
    Append(ThreadMessage),
    Stop,
}

/// Routes message inserts for services in the session's view to the
/// unread tracker and the log writer.
struct MessageHandler {
    reconciler: Arc<LocalStateReconciler>,
    unread: Arc<UnreadActivityTracker>,
    writes: mpsc::UnboundedSender<CacheWrite>,
}

impl EventHandler for MessageHandler {
    fn handle(&self, event: &ChangeEvent) {
        let message: ThreadMessage = match event.new_record() {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Undecodable message event ignored");
                return;
            }
        };
        if !self.reconciler.contains(message.service_ref) {
            return;
        }
        self.unread.record_message(&message);
        let message_id = message.id;
        if self.writes.send(CacheWrite::Append(message)).is_err() {
            debug!(message_id = %message_id, "Message cache writer gone, message not cached");
        }
    }
}

/// Appends messages to the cache one at a time, in feed order.
async fn cache_writer(
    cache: Arc<dyn MessageCache>,
    namespace: String,
    mut writes: mpsc::UnboundedReceiver<CacheWrite>,
) {
    while let Some(write) = writes.recv().await {
        match write {
            CacheWrite::Append(message) => {
                if let Err(e) = cache.append(&namespace, &message).await {
                    warn!(message_id = %message.id, error = %e, "Failed to cache message");
                }
            }
            CacheWrite::Stop => break,
        }
    }
    debug!(namespace = %namespace, "Message cache writer stopped");
}

/// Everything one logged-in user needs.
pub struct AppContext {
    identity: SessionIdentity,
    namespace: String,
    timeout: Duration,
    api: Arc<dyn ServiceApi>,
    cache: Arc<dyn MessageCache>,
    feed: Arc<ChangeFeedClient>,
    view: Arc<SyncedView>,
    unread: Arc<UnreadActivityTracker>,
    governor: Arc<ZoneCapacityGovernor>,
    claims: ClaimCoordinator,
    lifecycle: LifecycleCoordinator,
    transfers: TransferCoordinator,
    messages: SubscriptionHandle,
    writes: mpsc::UnboundedSender<CacheWrite>,
    writer: Mutex<Option<JoinHandle<()>>>,
    logged_out: AtomicBool,
}

impl AppContext {
    /// Build the session for `identity`: mount its role view, wire the
    /// coordinators to it and start following message threads.
    #[tracing::instrument(name = "session.login", skip_all, fields(user = %identity.user_id, role = %identity.role))]
    pub async fn login(identity: SessionIdentity, deps: SessionDeps) -> Result<Self> {
        let SessionDeps {
            api,
            transport,
            cache,
            config,
        } = deps;
        let timeout = config.coordinator.request_timeout();
        let namespace = format!("{}-{}", config.cache.namespace, identity.user_id);

        let feed = Arc::new(ChangeFeedClient::new(transport, config.feed.clone()));
        let view = Arc::new(
            SyncedView::mount(
                Arc::clone(&feed),
                Arc::clone(&api),
                RoleView::for_identity(&identity),
                &config.sync,
                timeout,
            )
            .await?,
        );
        let refresher: Arc<dyn RecordRefresher> = view.clone();

        let governor = Arc::new(ZoneCapacityGovernor::new(Arc::clone(&api), timeout));
        let claims = ClaimCoordinator::new(Arc::clone(&api), Arc::clone(&governor), &config.coordinator)
            .with_refresher(Arc::clone(&refresher));
        let lifecycle =
            LifecycleCoordinator::new(Arc::clone(&api), Arc::clone(&governor), &config.coordinator)
                .with_refresher(Arc::clone(&refresher));
        let transfers =
            TransferCoordinator::new(Arc::clone(&api), &config.coordinator).with_refresher(refresher);

        let unread = Arc::new(UnreadActivityTracker::new(identity.user_id));
        let (writes, write_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(cache_writer(Arc::clone(&cache), namespace.clone(), write_rx));
        let handler = Arc::new(MessageHandler {
            reconciler: Arc::clone(view.reconciler()),
            unread: Arc::clone(&unread),
            writes: writes.clone(),
        });
        let messages = match feed
            .open(entity::MESSAGES, EventFilter::on(EventKind::Insert), handler)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                writer.abort();
                view.unmount();
                return Err(e.into());
            }
        };

        info!(namespace = %namespace, "Session started");
        Ok(Self {
            identity,
            namespace,
            timeout,
            api,
            cache,
            feed,
            view,
            unread,
            governor,
            claims,
            lifecycle,
            transfers,
            messages,
            writes,
            writer: Mutex::new(Some(writer)),
            logged_out: AtomicBool::new(false),
        })
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Namespace of this session's message logs.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn view(&self) -> &SyncedView {
        &self.view
    }

    pub fn feed(&self) -> &ChangeFeedClient {
        &self.feed
    }

    pub fn unread(&self) -> &UnreadActivityTracker {
        &self.unread
    }

    pub fn governor(&self) -> &ZoneCapacityGovernor {
        &self.governor
    }

    pub fn lifecycle(&self) -> &LifecycleCoordinator {
        &self.lifecycle
    }

    pub fn transfers(&self) -> &TransferCoordinator {
        &self.transfers
    }

    /// Submit a new service as the logged-in user.
    pub async fn create_service(&self, new: NewService) -> Result<Service> {
        new.validate()?;
        let service = bounded(
            self.timeout,
            "create_service",
            self.api.create_service(self.identity.user_id, new),
        )
        .await?;
        self.view.refresh(&service);
        info!(service_id = %service.id, "Service created");
        Ok(service)
    }

    /// Edit non-status fields of a service.
    pub async fn update_service(&self, service_id: ServiceId, patch: ServicePatch) -> Result<Service> {
        patch.validate()?;
        let service = bounded(
            self.timeout,
            "patch_service_fields",
            self.api.patch_service_fields(service_id, patch),
        )
        .await?;
        self.view.refresh(&service);
        Ok(service)
    }

    /// Claim an available service for the logged-in courier.
    pub async fn claim(&self, service_id: ServiceId) -> Result<Service> {
        if self.identity.role != Role::Courier {
            return Err(DispatchError::validation(
                "role",
                "only couriers can claim services",
            ));
        }
        self.claims.claim(service_id, self.identity.user_id).await
    }

    pub async fn assign(&self, service_id: ServiceId, courier: UserId) -> Result<Service> {
        self.lifecycle.assign(&self.identity, service_id, courier).await
    }

    pub async fn start_route(&self, service_id: ServiceId, zone: Option<ZoneId>) -> Result<Service> {
        self.lifecycle
            .start_route(&self.identity, service_id, zone)
            .await
    }

    pub async fn mark_delivered(&self, service_id: ServiceId) -> Result<Service> {
        self.lifecycle.mark_delivered(&self.identity, service_id).await
    }

    pub async fn mark_paid(&self, service_id: ServiceId) -> Result<Service> {
        self.lifecycle.mark_paid(&self.identity, service_id).await
    }

    pub async fn cancel(&self, service_id: ServiceId, reason: impl Into<String>) -> Result<Service> {
        self.lifecycle
            .cancel(&self.identity, service_id, reason)
            .await
    }

    pub async fn revert(&self, service_id: ServiceId) -> Result<Service> {
        self.lifecycle.revert(&self.identity, service_id).await
    }

    /// Offer a held service to another courier.
    pub async fn request_transfer(
        &self,
        service_id: ServiceId,
        to_courier: UserId,
        reason: Option<String>,
    ) -> Result<TransferRequest> {
        self.transfers
            .request(service_id, self.identity.user_id, to_courier, reason)
            .await
    }

    pub async fn respond_transfer(
        &self,
        request_id: TransferId,
        decision: TransferDecision,
        reason: Option<String>,
    ) -> Result<TransferOutcome> {
        self.transfers
            .respond(self.identity.user_id, request_id, decision, reason)
            .await
    }

    /// Post to a service's thread. The message reaches the local log
    /// through the feed like everyone else's.
    pub async fn send_message(&self, service_id: ServiceId, body: &str) -> Result<ThreadMessage> {
        let body = body.trim();
        if body.is_empty() {
            return Err(DispatchError::validation("body", "message cannot be empty"));
        }
        let message = bounded(
            self.timeout,
            "post_message",
            self.api.post_message(NewMessage {
                service_ref: service_id,
                author_ref: self.identity.user_id,
                body: body.to_string(),
            }),
        )
        .await?;
        debug!(service_id = %service_id, message_id = %message.id, "Message sent");
        Ok(message)
    }

    /// A service's thread. Read from the backend and merged into the local
    /// log; when the backend is unreachable the local log is served instead.
    pub async fn thread(&self, service_id: ServiceId) -> Result<Vec<ThreadMessage>> {
        let fetched = bounded(self.timeout, "list_messages", self.api.list_messages(service_id)).await;
        let messages = match fetched {
            Ok(messages) => messages,
            Err(e) if e.is_transport() => {
                return match self.cache.load(&self.namespace, service_id).await {
                    Ok(log) if !log.is_empty() => {
                        debug!(service_id = %service_id, "Serving cached thread");
                        Ok(log)
                    }
                    _ => Err(e),
                };
            }
            Err(e) => return Err(e),
        };
        for message in &messages {
            if let Err(e) = self.cache.append(&self.namespace, message).await {
                warn!(message_id = %message.id, error = %e, "Failed to cache message");
            }
        }
        Ok(messages)
    }

    pub fn mark_read(&self, service_id: ServiceId) {
        self.unread.mark_read(service_id);
    }

    pub fn unread_count(&self, service_id: ServiceId) -> u32 {
        self.unread.unread_count(service_id)
    }

    /// End the session: close every subscription, flush and then clear
    /// the message logs, and forget unread state. Idempotent.
    #[tracing::instrument(name = "session.logout", skip_all, fields(user = %self.identity.user_id))]
    pub async fn logout(&self) {
        if self.logged_out.swap(true, Ordering::SeqCst) {
            return;
        }
        self.feed.close(&self.messages);
        self.view.unmount();
        self.feed.close_all();

        if self.writes.send(CacheWrite::Stop).is_err() {
            debug!("Message cache writer already stopped");
        }
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                warn!(error = %e, "Message cache writer ended abnormally");
            }
        }

        if let Err(e) = self.cache.clear_namespace(&self.namespace).await {
            warn!(namespace = %self.namespace, error = %e, "Failed to clear message cache");
        }
        self.unread.clear();
        info!("Session ended");
    }

    pub fn is_logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        if let Some(writer) = self
            .writer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            writer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ChannelFeed;
    use crate::cache::MemoryMessageCache;
    use crate::model::BranchId;
    use crate::storage::MemoryBackend;

    struct World {
        backend: Arc<MemoryBackend>,
        deps: SessionDeps,
    }

    fn world() -> World {
        let feed = Arc::new(ChannelFeed::new());
        let backend = Arc::new(MemoryBackend::new(Arc::clone(&feed)));
        let deps = SessionDeps {
            api: backend.clone(),
            transport: feed,
            cache: Arc::new(MemoryMessageCache::new()),
            config: Config::for_test(),
        };
        World { backend, deps }
    }

    fn job(branch: BranchId) -> NewService {
        NewService {
            destination_address: "Cl 26 #68-35".to_string(),
            client_phone: "320 555 0123".to_string(),
            client_name: "Andres".to_string(),
            branch_ref: Some(branch),
            ..NewService::default()
        }
    }

    async fn eventually(condition: impl Fn() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_claim_updates_courier_view_immediately() {
        let w = world();
        let branch = BranchId::new();
        let courier = AppContext::login(SessionIdentity::courier(UserId::new(), branch), w.deps.clone())
            .await
            .unwrap();
        let service = w.backend.create_service(UserId::new(), job(branch)).await.unwrap();

        courier.claim(service.id).await.unwrap();

        assert_eq!(courier.view().bucket_of(service.id), Some("assigned"));
    }

    #[tokio::test]
    async fn test_only_couriers_claim() {
        let w = world();
        let requester = AppContext::login(SessionIdentity::requester(UserId::new()), w.deps.clone())
            .await
            .unwrap();

        let err = requester.claim(ServiceId::new()).await.unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_messages_counted_cached_and_cleared_on_logout() {
        let w = world();
        let branch = BranchId::new();
        let requester_id = UserId::new();
        let requester = AppContext::login(SessionIdentity::requester(requester_id), w.deps.clone())
            .await
            .unwrap();
        let courier = AppContext::login(SessionIdentity::courier(UserId::new(), branch), w.deps.clone())
            .await
            .unwrap();
        let service = w.backend.create_service(requester_id, job(branch)).await.unwrap();
        assert!(eventually(|| requester.view().bucket_of(service.id).is_some()).await);
        assert!(eventually(|| courier.view().bucket_of(service.id).is_some()).await);

        courier.send_message(service.id, "  ya voy  ").await.unwrap();

        assert!(eventually(|| requester.unread_count(service.id) == 1).await);
        assert_eq!(courier.unread_count(service.id), 0);
        let thread = requester.thread(service.id).await.unwrap();
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].body, "ya voy");

        requester.mark_read(service.id);
        assert_eq!(requester.unread().total_unread(), 0);

        requester.logout().await;
        requester.logout().await;
        assert!(requester.is_logged_out());
        assert_eq!(requester.feed().active_subscriptions(), 0);
        assert!(w
            .deps
            .cache
            .load(requester.namespace(), service.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let w = world();
        let session = AppContext::login(SessionIdentity::requester(UserId::new()), w.deps.clone())
            .await
            .unwrap();

        let err = session.send_message(ServiceId::new(), "   ").await.unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_login_fails_when_backend_unreachable() {
        let w = world();
        w.backend.set_unreachable(true);

        let result = AppContext::login(SessionIdentity::requester(UserId::new()), w.deps.clone()).await;

        assert!(matches!(result, Err(e) if e.is_transport()));
    }

    #[test]
    fn test_message_still_counted_when_cache_writer_gone() {
        let me = UserId::new();
        let reconciler = Arc::new(LocalStateReconciler::new(RoleView::requester(me)));
        let service = Service::from_new(ServiceId::new(), me, job(BranchId::new()), chrono::Utc::now());
        reconciler.upsert(service.clone());
        let unread = Arc::new(UnreadActivityTracker::new(me));
        let (writes, write_rx) = mpsc::unbounded_channel();
        drop(write_rx);
        let handler = MessageHandler {
            reconciler,
            unread: Arc::clone(&unread),
            writes,
        };
        let message = ThreadMessage {
            id: crate::model::MessageId::new(),
            service_ref: service.id,
            author_ref: UserId::new(),
            body: "en la puerta".to_string(),
            created_at: chrono::Utc::now(),
        };

        handler.handle(&ChangeEvent::insert(entity::MESSAGES, &message).unwrap());

        assert_eq!(unread.unread_count(service.id), 1);
    }
}

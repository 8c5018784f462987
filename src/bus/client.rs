//! Subscription manager for one client session.
//!
//! Each subscription owns an independent ordered queue (the transport
//! stream) drained by its own pump task; ordering holds within a
//! subscription, never across subscriptions. Disconnects are healed
//! silently with backoff, and handlers are told when a gap may have
//! occurred so they can re-fetch.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

use super::{ChangeEvent, EventFilter, EventHandler, EventStream, FeedError, FeedTransport, Result};
use crate::config::FeedConfig;
use crate::utils::retry::feed_backoff;

thread_local! {
    /// Id of the subscription whose handler runs on this thread, if any;
    /// lets `close` detect re-entrancy.
    static DELIVERING: Cell<Option<u64>> = const { Cell::new(None) };
}

struct HandlerScope {
    previous: Option<u64>,
}

impl HandlerScope {
    fn enter(id: u64) -> Self {
        Self {
            previous: DELIVERING.with(|current| current.replace(Some(id))),
        }
    }
}

impl Drop for HandlerScope {
    fn drop(&mut self) {
        DELIVERING.with(|current| current.set(self.previous));
    }
}

/// Connection health as seen by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    /// Every subscription is live.
    Connected,
    /// At least one subscription dropped and is being re-established.
    Reconnecting,
    /// Disconnected for longer than the notice threshold.
    Degraded,
}

/// Opaque reference to an open subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: u64,
    entity: String,
    filter: EventFilter,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }
}

struct Subscription {
    id: u64,
    entity: String,
    filter: EventFilter,
    handler: Arc<dyn EventHandler>,
    closed: AtomicBool,
    /// Held for the duration of each handler invocation.
    gate: Mutex<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Invoke the handler unless closed. Returns false once the
    /// subscription is closed.
    fn deliver(&self, event: &ChangeEvent) -> bool {
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return false;
        }
        let _scope = HandlerScope::enter(self.id);
        self.handler.handle(event);
        !self.is_closed()
    }

    fn notify_resubscribed(&self) -> bool {
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return false;
        }
        let _scope = HandlerScope::enter(self.id);
        self.handler.on_resubscribed();
        !self.is_closed()
    }

    /// Stop delivery. After this returns no further handler invocation
    /// starts. Safe to call from inside the subscription's own handler.
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if DELIVERING.with(Cell::get) != Some(self.id) {
            // Wait out an invocation in flight on another thread.
            drop(self.gate.lock().unwrap_or_else(PoisonError::into_inner));
        }
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

/// Tracks outages across subscriptions and publishes `FeedStatus`.
struct FeedHealth {
    status: watch::Sender<FeedStatus>,
    outages: Mutex<HashMap<u64, Instant>>,
    stale_after: Duration,
}

impl FeedHealth {
    fn new(stale_after: Duration) -> Self {
        let (status, _) = watch::channel(FeedStatus::Connected);
        Self {
            status,
            outages: Mutex::new(HashMap::new()),
            stale_after,
        }
    }

    fn mark_down(&self, id: u64) {
        self.outages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_insert_with(Instant::now);
        self.refresh();
    }

    fn mark_up(&self, id: u64) {
        self.outages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        self.refresh();
    }

    fn refresh(&self) {
        let next = {
            let outages = self.outages.lock().unwrap_or_else(PoisonError::into_inner);
            match outages.values().min() {
                None => FeedStatus::Connected,
                Some(since) if since.elapsed() >= self.stale_after => FeedStatus::Degraded,
                Some(_) => FeedStatus::Reconnecting,
            }
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            match next {
                FeedStatus::Degraded => {
                    warn!(threshold = ?self.stale_after, "Change feed degraded, updates may be stale")
                }
                FeedStatus::Connected => info!("Change feed connected"),
                FeedStatus::Reconnecting => debug!("Change feed reconnecting"),
            }
            *current = next;
            true
        });
    }
}

/// Opens, replaces and closes change-feed subscriptions for one session.
pub struct ChangeFeedClient {
    transport: Arc<dyn FeedTransport>,
    config: FeedConfig,
    subscriptions: Mutex<HashMap<u64, Arc<Subscription>>>,
    health: Arc<FeedHealth>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl ChangeFeedClient {
    pub fn new(transport: Arc<dyn FeedTransport>, config: FeedConfig) -> Self {
        let health = Arc::new(FeedHealth::new(config.stale_notice_after()));
        Self {
            transport,
            config,
            subscriptions: Mutex::new(HashMap::new()),
            health,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Subscribe `handler` to changes of `entity` matching `filter`.
    ///
    /// Only one subscription per entity/filter pair is kept: opening the
    /// same pair again closes the previous one first. If the first
    /// connection attempt fails the subscription is still returned and
    /// connects in the background.
    #[tracing::instrument(name = "feed.open", skip_all, fields(entity = %entity, filter = %filter))]
    pub async fn open(
        &self,
        entity: &str,
        filter: EventFilter,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionHandle> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FeedError::ClientClosed);
        }

        let replaced: Vec<Arc<Subscription>> = {
            let mut subscriptions = self.lock_subscriptions();
            let ids: Vec<u64> = subscriptions
                .values()
                .filter(|s| s.entity == entity && s.filter == filter)
                .map(|s| s.id)
                .collect();
            ids.into_iter()
                .filter_map(|id| subscriptions.remove(&id))
                .collect()
        };
        for previous in replaced {
            info!(subscription = previous.id, "Replacing subscription for same entity/filter");
            self.retire(&previous);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let subscription = Arc::new(Subscription {
            id,
            entity: entity.to_string(),
            filter,
            handler,
            closed: AtomicBool::new(false),
            gate: Mutex::new(()),
            task: Mutex::new(None),
        });

        let initial = match self
            .transport
            .subscribe(entity, &subscription.filter)
            .await
        {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(subscription = id, error = %e, "Initial subscribe failed, retrying in background");
                self.health.mark_down(id);
                None
            }
        };

        let task = tokio::spawn(pump(
            Arc::clone(&subscription),
            Arc::clone(&self.transport),
            Arc::clone(&self.health),
            feed_backoff(&self.config),
            self.config.reconnect_max_delay(),
            initial,
        ));
        *subscription
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        let handle = SubscriptionHandle {
            id,
            entity: subscription.entity.clone(),
            filter: subscription.filter.clone(),
        };
        self.lock_subscriptions().insert(id, subscription);
        info!(subscription = id, "Subscription opened");
        Ok(handle)
    }

    /// Replace the filter of an open subscription, keeping its handler.
    ///
    /// The prior subscription is closed before the new one opens, so no
    /// orphaned stream is left behind.
    pub async fn reopen(&self, handle: &mut SubscriptionHandle, filter: EventFilter) -> Result<()> {
        let previous = self
            .lock_subscriptions()
            .remove(&handle.id)
            .ok_or(FeedError::NotOpen(handle.id))?;
        self.retire(&previous);
        let handler = Arc::clone(&previous.handler);
        *handle = self.open(&previous.entity, filter, handler).await?;
        Ok(())
    }

    /// Close a subscription. Idempotent, and safe to call from within the
    /// subscription's own handler. No handler invocation starts after this
    /// returns.
    pub fn close(&self, handle: &SubscriptionHandle) {
        let removed = self.lock_subscriptions().remove(&handle.id);
        if let Some(subscription) = removed {
            self.retire(&subscription);
            info!(subscription = handle.id, entity = %handle.entity, "Subscription closed");
        }
    }

    /// Close every subscription and refuse new ones (logout).
    pub fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<Arc<Subscription>> =
            self.lock_subscriptions().drain().map(|(_, s)| s).collect();
        let count = drained.len();
        for subscription in drained {
            self.retire(&subscription);
        }
        info!(closed = count, "All subscriptions closed");
    }

    pub fn is_open(&self, handle: &SubscriptionHandle) -> bool {
        self.lock_subscriptions().contains_key(&handle.id)
    }

    pub fn active_subscriptions(&self) -> usize {
        self.lock_subscriptions().len()
    }

    pub fn status(&self) -> FeedStatus {
        *self.health.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<FeedStatus> {
        self.health.status.subscribe()
    }

    /// Stream of status changes, starting with the current status.
    pub fn status_stream(&self) -> WatchStream<FeedStatus> {
        WatchStream::new(self.health.status.subscribe())
    }

    fn retire(&self, subscription: &Subscription) {
        subscription.shutdown();
        self.health.mark_up(subscription.id);
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<Subscription>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ChangeFeedClient {
    fn drop(&mut self) {
        for subscription in self.lock_subscriptions().values() {
            subscription.shutdown();
        }
    }
}

/// Drain one subscription's stream, resubscribing with the same filter
/// whenever the stream ends.
async fn pump(
    subscription: Arc<Subscription>,
    transport: Arc<dyn FeedTransport>,
    health: Arc<FeedHealth>,
    backoff: ExponentialBuilder,
    max_delay: Duration,
    initial: Option<EventStream>,
) {
    let mut next = initial;
    loop {
        let mut stream = match next.take() {
            Some(stream) => stream,
            None => {
                let Some(stream) =
                    resubscribe(&subscription, &*transport, &health, backoff, max_delay).await
                else {
                    return;
                };
                health.mark_up(subscription.id);
                info!(subscription = subscription.id, "Subscription re-established");
                if !subscription.notify_resubscribed() {
                    return;
                }
                stream
            }
        };

        while let Some(event) = stream.next().await {
            if !subscription.deliver(&event) {
                return;
            }
        }

        if subscription.is_closed() {
            return;
        }
        warn!(
            subscription = subscription.id,
            entity = %subscription.entity,
            "Subscription stream ended, resubscribing"
        );
        health.mark_down(subscription.id);
    }
}

async fn resubscribe(
    subscription: &Subscription,
    transport: &dyn FeedTransport,
    health: &FeedHealth,
    backoff: ExponentialBuilder,
    max_delay: Duration,
) -> Option<EventStream> {
    let mut delays = backoff.build();
    loop {
        if subscription.is_closed() {
            return None;
        }
        match transport
            .subscribe(&subscription.entity, &subscription.filter)
            .await
        {
            Ok(stream) => return Some(stream),
            Err(e) => {
                let delay = delays.next().unwrap_or(max_delay);
                debug!(
                    subscription = subscription.id,
                    error = %e,
                    retry_in = ?delay,
                    "Resubscribe failed"
                );
                health.refresh();
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ChannelFeed, Operation};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> FeedConfig {
        FeedConfig {
            reconnect_min_delay_ms: 5,
            reconnect_max_delay_ms: 20,
            stale_notice_after_secs: 60,
            ..FeedConfig::default()
        }
    }

    fn event(status: &str) -> ChangeEvent {
        ChangeEvent {
            entity: "services".to_string(),
            operation: Operation::Insert,
            new_value: Some(json!({ "status": status })),
            old_value: None,
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        resubscribed: AtomicUsize,
    }

    impl Recorder {
        fn statuses(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl EventHandler for Recorder {
        fn handle(&self, event: &ChangeEvent) {
            let status = event.new_value.as_ref().unwrap()["status"]
                .as_str()
                .unwrap()
                .to_string();
            self.seen.lock().unwrap().push(status);
        }

        fn on_resubscribed(&self) {
            self.resubscribed.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// Poll until `condition` holds or a second has passed.
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
    async fn test_events_delivered_in_order() {
        let feed = Arc::new(ChannelFeed::new());
        let client = ChangeFeedClient::new(feed.clone(), test_config());
        let recorder = Arc::new(Recorder::default());

        client
            .open("services", EventFilter::all(), recorder.clone())
            .await
            .unwrap();
        for status in ["available", "assigned", "en_route"] {
            feed.publish(event(status));
        }
        settle().await;

        assert_eq!(recorder.statuses(), vec!["available", "assigned", "en_route"]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_delivery() {
        let feed = Arc::new(ChannelFeed::new());
        let client = ChangeFeedClient::new(feed.clone(), test_config());
        let recorder = Arc::new(Recorder::default());

        let handle = client
            .open("services", EventFilter::all(), recorder.clone())
            .await
            .unwrap();
        client.close(&handle);
        client.close(&handle);
        assert!(!client.is_open(&handle));

        feed.publish(event("available"));
        settle().await;
        assert!(recorder.statuses().is_empty());
    }

    #[tokio::test]
    async fn test_close_from_own_handler() {
        let feed = Arc::new(ChannelFeed::new());
        let client = Arc::new(ChangeFeedClient::new(feed.clone(), test_config()));
        let calls = Arc::new(AtomicUsize::new(0));
        let handle_slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));

        let handler = {
            let client = Arc::clone(&client);
            let calls = Arc::clone(&calls);
            let handle_slot = Arc::clone(&handle_slot);
            move |_: &ChangeEvent| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(handle) = handle_slot.lock().unwrap().as_ref() {
                    client.close(handle);
                }
            }
        };

        let handle = client
            .open("services", EventFilter::all(), Arc::new(handler))
            .await
            .unwrap();
        *handle_slot.lock().unwrap() = Some(handle.clone());

        feed.publish(event("available"));
        feed.publish(event("assigned"));
        settle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!client.is_open(&handle));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_from_other_handler_waits_for_running_invocation() {
        let feed = Arc::new(ChannelFeed::new());
        let client = Arc::new(ChangeFeedClient::new(feed.clone(), test_config()));
        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let finished_before_close_returned = Arc::new(AtomicBool::new(false));
        let slow_slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));

        let slow = {
            let started = Arc::clone(&started);
            let finished = Arc::clone(&finished);
            move |_: &ChangeEvent| {
                started.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(200));
                finished.store(true, Ordering::SeqCst);
            }
        };
        let closer = {
            let client = Arc::clone(&client);
            let finished = Arc::clone(&finished);
            let observed = Arc::clone(&finished_before_close_returned);
            let slow_slot = Arc::clone(&slow_slot);
            move |_: &ChangeEvent| {
                if let Some(handle) = slow_slot.lock().unwrap().as_ref() {
                    client.close(handle);
                    observed.store(finished.load(Ordering::SeqCst), Ordering::SeqCst);
                }
            }
        };

        let slow_handle = client
            .open("transfer_requests", EventFilter::all(), Arc::new(slow))
            .await
            .unwrap();
        *slow_slot.lock().unwrap() = Some(slow_handle.clone());
        client
            .open("services", EventFilter::all(), Arc::new(closer))
            .await
            .unwrap();

        feed.publish(ChangeEvent {
            entity: "transfer_requests".to_string(),
            ..event("pending")
        });
        assert!(eventually(|| started.load(Ordering::SeqCst)).await);
        feed.publish(event("available"));
        assert!(eventually(|| !client.is_open(&slow_handle)).await);
        assert!(eventually(|| finished.load(Ordering::SeqCst)).await);
        settle().await;

        assert!(finished_before_close_returned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_reopen_with_changed_filter_leaves_no_orphan() {
        let feed = Arc::new(ChannelFeed::new());
        let client = ChangeFeedClient::new(feed.clone(), test_config());
        let recorder = Arc::new(Recorder::default());

        let mut handle = client
            .open(
                "services",
                EventFilter::all().eq("status", "available"),
                recorder.clone(),
            )
            .await
            .unwrap();
        let old_id = handle.id();

        client
            .reopen(&mut handle, EventFilter::all().eq("status", "assigned"))
            .await
            .unwrap();
        assert_ne!(handle.id(), old_id);
        assert_eq!(client.active_subscriptions(), 1);
        settle().await;
        assert_eq!(feed.receiver_count(), 1);

        feed.publish(event("available"));
        feed.publish(event("assigned"));
        settle().await;

        assert_eq!(recorder.statuses(), vec!["assigned"]);
    }

    #[tokio::test]
    async fn test_same_pair_replaces_previous_subscription() {
        let feed = Arc::new(ChannelFeed::new());
        let client = ChangeFeedClient::new(feed.clone(), test_config());
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let filter = EventFilter::all().eq("status", "available");

        client.open("services", filter.clone(), first.clone()).await.unwrap();
        client.open("services", filter, second.clone()).await.unwrap();
        client
            .open("services", EventFilter::all(), Arc::new(Recorder::default()))
            .await
            .unwrap();
        assert_eq!(client.active_subscriptions(), 2);

        feed.publish(event("available"));
        settle().await;

        assert!(first.statuses().is_empty());
        assert_eq!(second.statuses(), vec!["available"]);
    }

    #[tokio::test]
    async fn test_resubscribes_after_disconnect() {
        let feed = Arc::new(ChannelFeed::new());
        let client = ChangeFeedClient::new(feed.clone(), test_config());
        let recorder = Arc::new(Recorder::default());

        client
            .open("services", EventFilter::all(), recorder.clone())
            .await
            .unwrap();

        feed.disconnect_all();
        assert!(eventually(|| recorder.resubscribed.load(Ordering::SeqCst) == 1).await);
        assert_eq!(client.status(), FeedStatus::Connected);

        feed.publish(event("delivered"));
        settle().await;
        assert_eq!(recorder.statuses(), vec!["delivered"]);
    }

    #[tokio::test]
    async fn test_outage_is_silent_then_degraded() {
        let feed = Arc::new(ChannelFeed::new());
        let config = FeedConfig {
            stale_notice_after_secs: 0,
            ..test_config()
        };
        let client = ChangeFeedClient::new(feed.clone(), config);
        let recorder = Arc::new(Recorder::default());
        client
            .open("services", EventFilter::all(), recorder.clone())
            .await
            .unwrap();

        feed.set_available(false);
        feed.disconnect_all();
        assert!(eventually(|| client.status() == FeedStatus::Degraded).await);
        assert!(recorder.statuses().is_empty());

        feed.set_available(true);
        assert!(eventually(|| client.status() == FeedStatus::Connected).await);
        assert_eq!(recorder.resubscribed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_while_unreachable_connects_later() {
        let feed = Arc::new(ChannelFeed::new());
        feed.set_available(false);
        let client = ChangeFeedClient::new(feed.clone(), test_config());
        let recorder = Arc::new(Recorder::default());

        client
            .open("services", EventFilter::all(), recorder.clone())
            .await
            .unwrap();
        assert_eq!(client.status(), FeedStatus::Reconnecting);

        feed.set_available(true);
        assert!(eventually(|| client.status() == FeedStatus::Connected).await);

        feed.publish(event("available"));
        settle().await;
        assert_eq!(recorder.statuses(), vec!["available"]);
    }

    #[tokio::test]
    async fn test_close_all_refuses_new_subscriptions() {
        let feed = Arc::new(ChannelFeed::new());
        let client = ChangeFeedClient::new(feed.clone(), test_config());
        client
            .open("services", EventFilter::all(), Arc::new(Recorder::default()))
            .await
            .unwrap();

        client.close_all();

        assert_eq!(client.active_subscriptions(), 0);
        let result = client
            .open("services", EventFilter::all(), Arc::new(Recorder::default()))
            .await;
        assert!(matches!(result, Err(FeedError::ClientClosed)));
    }
}

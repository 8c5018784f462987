//! Mounted views: a projection bound to its feed subscriptions.
//!
//! The feed alone does not guarantee consistency (events emitted while
//! disconnected are lost), so a view re-lists its buckets from the backend
//! on mount, after every reconnect and optionally on a timer.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::projection::{LocalStateReconciler, RoleView};
use crate::bus::{ChangeEvent, ChangeFeedClient, EventHandler, SubscriptionHandle};
use crate::config::SyncConfig;
use crate::error::Result;
use crate::model::{entity, Service, ServiceId};
use crate::services::{bounded, RecordRefresher};
use crate::storage::ServiceApi;

/// Feed handler that forwards events and asks for a re-sync after a gap.
struct ViewHandler {
    reconciler: Arc<LocalStateReconciler>,
    resync: Option<mpsc::UnboundedSender<()>>,
}

impl EventHandler for ViewHandler {
    fn handle(&self, event: &ChangeEvent) {
        self.reconciler.apply(event);
    }

    fn on_resubscribed(&self) {
        if let Some(resync) = &self.resync {
            if resync.send(()).is_err() {
                debug!(role = %self.reconciler.view().role, "Re-sync worker gone, reconnect re-sync skipped");
            }
        }
    }
}

#[derive(Clone)]
struct Fetcher {
    api: Arc<dyn ServiceApi>,
    reconciler: Arc<LocalStateReconciler>,
    timeout: Duration,
}

impl Fetcher {
    /// List every bucket and load the result into the projection.
    async fn resync(&self) -> Result<usize> {
        self.reconciler.begin_sync();
        let mut services: Vec<Service> = Vec::new();
        for bucket in &self.reconciler.view().buckets {
            let query = bucket.query();
            match bounded(self.timeout, "list_services", self.api.list_services(&query)).await {
                Ok(listed) => services.extend(listed),
                Err(e) => {
                    self.reconciler.cancel_sync();
                    return Err(e);
                }
            }
        }
        let count = services.len();
        self.reconciler.load(services);
        Ok(count)
    }
}

/// A role view kept in sync with the backend.
pub struct SyncedView {
    reconciler: Arc<LocalStateReconciler>,
    fetcher: Fetcher,
    feed: Arc<ChangeFeedClient>,
    handles: Mutex<Vec<SubscriptionHandle>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SyncedView {
    /// Subscribe to the view's feeds, then perform the initial full fetch.
    ///
    /// Subscribing first means no change committed after the fetch can be
    /// missed.
    #[tracing::instrument(name = "view.mount", skip_all, fields(role = %view.role))]
    pub async fn mount(
        feed: Arc<ChangeFeedClient>,
        api: Arc<dyn ServiceApi>,
        view: RoleView,
        sync: &SyncConfig,
        timeout: Duration,
    ) -> Result<Self> {
        let reconciler = Arc::new(LocalStateReconciler::new(view));
        let (resync_tx, resync_rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn EventHandler> = Arc::new(ViewHandler {
            reconciler: Arc::clone(&reconciler),
            resync: sync.resync_on_reconnect.then_some(resync_tx),
        });

        let fetcher = Fetcher {
            api,
            reconciler: Arc::clone(&reconciler),
            timeout,
        };
        let view = Self {
            reconciler,
            fetcher,
            feed,
            handles: Mutex::new(Vec::new()),
            worker: Mutex::new(None),
        };

        for filter in view.reconciler.view().feeds.clone() {
            match view
                .feed
                .open(entity::SERVICES, filter, Arc::clone(&handler))
                .await
            {
                Ok(handle) => view.lock_handles().push(handle),
                Err(e) => {
                    view.unmount();
                    return Err(e.into());
                }
            }
        }

        let count = match view.fetcher.resync().await {
            Ok(count) => count,
            Err(e) => {
                view.unmount();
                return Err(e);
            }
        };
        info!(count, "View mounted");

        let worker = tokio::spawn(resync_worker(
            view.fetcher.clone(),
            resync_rx,
            sync.resync_interval(),
        ));
        *view
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(worker);
        Ok(view)
    }

    /// Full re-fetch of every bucket.
    pub async fn resync(&self) -> Result<usize> {
        self.fetcher.resync().await
    }

    pub fn reconciler(&self) -> &Arc<LocalStateReconciler> {
        &self.reconciler
    }

    pub fn bucket(&self, name: &str) -> Vec<Service> {
        self.reconciler.bucket(name)
    }

    pub fn bucket_of(&self, id: ServiceId) -> Option<&'static str> {
        self.reconciler.bucket_of(id)
    }

    /// Close the view's subscriptions and stop background re-syncs.
    /// Idempotent.
    pub fn unmount(&self) {
        let handles: Vec<SubscriptionHandle> = self.lock_handles().drain(..).collect();
        for handle in &handles {
            self.feed.close(handle);
        }
        if let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            worker.abort();
        }
        if !handles.is_empty() {
            debug!(role = %self.reconciler.view().role, "View unmounted");
        }
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, Vec<SubscriptionHandle>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RecordRefresher for SyncedView {
    fn refresh(&self, service: &Service) {
        self.reconciler.refresh(service);
    }

    fn forget(&self, id: ServiceId) {
        self.reconciler.forget(id);
    }
}

impl Drop for SyncedView {
    fn drop(&mut self) {
        self.unmount();
    }
}

async fn resync_worker(
    fetcher: Fetcher,
    mut requests: mpsc::UnboundedReceiver<()>,
    interval: Option<Duration>,
) {
    let mut ticker = interval.map(|period| {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker
    });

    loop {
        let reason = tokio::select! {
            request = requests.recv() => match request {
                Some(()) => "reconnect",
                None if ticker.is_none() => return,
                None => {
                    // Handler gone; keep serving the timer alone.
                    if let Some(ticker) = ticker.as_mut() {
                        ticker.tick().await;
                    }
                    "interval"
                }
            },
            _ = async {
                match ticker.as_mut() {
                    Some(ticker) => { ticker.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => "interval",
        };
        // Coalesce reconnect bursts from several subscriptions.
        while requests.try_recv().is_ok() {}

        match fetcher.resync().await {
            Ok(count) => debug!(reason, count, "View re-synced"),
            Err(e) => warn!(reason, error = %e, "View re-sync failed"),
        }
    }
}

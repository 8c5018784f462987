//! Local status-bucketed projection of services.
//!
//! One normalized `id -> Service` store holds every service the view cares
//! about; buckets are derived from it through a `RoleView`, so a service is
//! in at most one bucket by construction. Events are applied in order:
//!
//! - insert: prepend the record if its status matches a bucket
//! - update: drop the record, then prepend it again if the new status still
//!   matches a bucket
//! - delete: drop the record
//!
//! Buckets list most-recently-changed first, except right after a bulk
//! load, which keeps the server's order.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::bus::{ChangeEvent, EventHandler, Operation};
use crate::model::{entity, Service, ServiceId};
use crate::services::RecordRefresher;

mod roles;

pub use roles::{BucketScope, BucketSpec, RoleView};

/// Where one applied change moved a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketMove {
    pub service_id: ServiceId,
    pub from: Option<&'static str>,
    pub to: Option<&'static str>,
}

impl BucketMove {
    /// True if the service changed bucket (or entered/left the view).
    pub fn is_move(&self) -> bool {
        self.from != self.to
    }
}

/// Last local change to a service while a bulk listing is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Touch {
    /// Upserted or moved out of the view by a row with this `updated_at`.
    Changed(DateTime<Utc>),
    /// Deleted, or found missing on the backend.
    Removed,
}

/// Normalized record store plus recency order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectionState {
    records: HashMap<ServiceId, Service>,
    /// Most recently changed first.
    order: Vec<ServiceId>,
    /// Local changes since the oldest listing still in flight.
    sync: Option<SyncWindow>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct SyncWindow {
    /// Listings begun and not yet loaded or cancelled.
    open: u32,
    touched: HashMap<ServiceId, Touch>,
}

impl ProjectionState {
    /// Start recording local changes so a bulk listing started now cannot
    /// roll them back when it is loaded. Overlapping listings share one
    /// window, which closes when the last of them loads or cancels.
    pub fn begin_sync(&mut self) {
        self.sync.get_or_insert_with(SyncWindow::default).open += 1;
    }

    /// Give up on one listing without loading it.
    pub fn cancel_sync(&mut self) {
        self.end_sync();
    }

    fn end_sync(&mut self) -> HashMap<ServiceId, Touch> {
        let Some(window) = self.sync.as_mut() else {
            return HashMap::new();
        };
        window.open = window.open.saturating_sub(1);
        if window.open == 0 {
            self.sync.take().map(|w| w.touched).unwrap_or_default()
        } else {
            window.touched.clone()
        }
    }

    /// Replace the state with a bulk-listed snapshot, keeping its order.
    ///
    /// A local copy strictly newer than the snapshot's is kept, so events
    /// applied while the listing was in flight are not rolled back. Inside
    /// a sync window, a listed row that is not newer than the last local
    /// change to it is dropped in favour of the local state, including a
    /// removal, and records changed during the window but missing from the
    /// listing are kept at the front.
    pub fn load(&mut self, view: &RoleView, services: Vec<Service>) {
        let touched = self.end_sync();
        let mut records = HashMap::with_capacity(services.len());
        let mut order = Vec::with_capacity(services.len());
        for service in services {
            if records.contains_key(&service.id) {
                continue;
            }
            let service = match touched.get(&service.id) {
                Some(Touch::Removed) => continue,
                Some(Touch::Changed(at)) if *at >= service.updated_at => {
                    match self.records.get(&service.id) {
                        Some(local) => local.clone(),
                        None => continue,
                    }
                }
                _ => match self.records.get(&service.id) {
                    Some(local) if local.updated_at > service.updated_at => local.clone(),
                    _ => service,
                },
            };
            if view.bucket_for(&service).is_some() {
                order.push(service.id);
                records.insert(service.id, service);
            }
        }

        let listed: HashSet<ServiceId> = order.iter().copied().collect();
        let mut kept: Vec<ServiceId> = self
            .order
            .iter()
            .copied()
            .filter(|id| {
                !listed.contains(id) && matches!(touched.get(id), Some(Touch::Changed(_)))
            })
            .collect();
        for id in &kept {
            if let Some(local) = self.records.remove(id) {
                records.insert(*id, local);
            }
        }
        kept.extend(order);

        self.records = records;
        self.order = kept;
    }

    /// Apply one change event for the services collection.
    pub fn apply(&mut self, view: &RoleView, event: &ChangeEvent) -> Option<BucketMove> {
        if event.entity != entity::SERVICES {
            return None;
        }
        match event.operation {
            Operation::Insert | Operation::Update => {
                let service: Service = match event.new_record() {
                    Ok(Some(service)) => service,
                    Ok(None) => {
                        warn!(operation = %event.operation, "Service event without new row");
                        return None;
                    }
                    Err(e) => {
                        warn!(error = %e, "Undecodable service event ignored");
                        return None;
                    }
                };
                if let Some(local) = self.records.get(&service.id) {
                    if local.updated_at > service.updated_at {
                        debug!(service_id = %service.id, "Stale service event ignored");
                        return None;
                    }
                }
                Some(self.upsert(view, service))
            }
            Operation::Delete => {
                let id = match event.old_record::<Service>() {
                    Ok(Some(service)) => service.id,
                    Ok(None) => {
                        warn!("Service delete without old row");
                        return None;
                    }
                    Err(e) => {
                        warn!(error = %e, "Undecodable service delete ignored");
                        return None;
                    }
                };
                Some(self.remove(view, id))
            }
        }
    }

    /// Put the latest copy of a service at the front of its bucket, or drop
    /// it if no bucket matches.
    pub fn upsert(&mut self, view: &RoleView, service: Service) -> BucketMove {
        let id = service.id;
        self.touch(id, Touch::Changed(service.updated_at));
        let from = self.bucket_of(view, id);
        self.order.retain(|existing| *existing != id);
        self.records.remove(&id);

        let to = view.bucket_for(&service);
        if to.is_some() {
            self.order.insert(0, id);
            self.records.insert(id, service);
        }
        BucketMove {
            service_id: id,
            from,
            to,
        }
    }

    pub fn remove(&mut self, view: &RoleView, id: ServiceId) -> BucketMove {
        self.touch(id, Touch::Removed);
        let from = self.bucket_of(view, id);
        self.order.retain(|existing| *existing != id);
        self.records.remove(&id);
        BucketMove {
            service_id: id,
            from,
            to: None,
        }
    }

    pub fn get(&self, id: ServiceId) -> Option<&Service> {
        self.records.get(&id)
    }

    pub fn bucket_of(&self, view: &RoleView, id: ServiceId) -> Option<&'static str> {
        self.records.get(&id).and_then(|s| view.bucket_for(s))
    }

    /// Contents of one bucket, in bucket order.
    pub fn bucket<'a>(&'a self, view: &'a RoleView, name: &'a str) -> impl Iterator<Item = &'a Service> + 'a {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(move |service| view.bucket_for(service) == Some(name))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn touch(&mut self, id: ServiceId, touch: Touch) {
        if let Some(window) = self.sync.as_mut() {
            window.touched.insert(id, touch);
        }
    }
}

/// Pure form of `ProjectionState::apply`.
pub fn apply_event(view: &RoleView, mut state: ProjectionState, event: &ChangeEvent) -> ProjectionState {
    state.apply(view, event);
    state
}

/// Keeps one role view's projection current.
///
/// Runs as a change feed handler, so every method takes a short
/// synchronous lock and never awaits. `watch()` publishes a revision
/// number after every change for views to re-render on.
pub struct LocalStateReconciler {
    view: RoleView,
    state: Mutex<ProjectionState>,
    revision: watch::Sender<u64>,
}

impl LocalStateReconciler {
    pub fn new(view: RoleView) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            view,
            state: Mutex::new(ProjectionState::default()),
            revision,
        }
    }

    pub fn view(&self) -> &RoleView {
        &self.view
    }

    /// Open a sync window ahead of a bulk listing. See
    /// `ProjectionState::load`.
    pub fn begin_sync(&self) {
        self.lock().begin_sync();
    }

    /// Close the sync window after a failed listing.
    pub fn cancel_sync(&self) {
        self.lock().cancel_sync();
    }

    /// Replace the projection with a bulk-listed snapshot.
    pub fn load(&self, services: Vec<Service>) {
        let count = {
            let mut state = self.lock();
            state.load(&self.view, services);
            state.len()
        };
        debug!(role = %self.view.role, count, "Projection loaded");
        self.bump();
    }

    pub fn apply(&self, event: &ChangeEvent) -> Option<BucketMove> {
        let moved = self.lock().apply(&self.view, event);
        if let Some(m) = moved {
            self.log_move(m);
            self.bump();
        }
        moved
    }

    pub fn upsert(&self, service: Service) -> BucketMove {
        let moved = self.lock().upsert(&self.view, service);
        self.log_move(moved);
        self.bump();
        moved
    }

    pub fn remove(&self, id: ServiceId) -> BucketMove {
        let moved = self.lock().remove(&self.view, id);
        self.log_move(moved);
        self.bump();
        moved
    }

    pub fn snapshot(&self) -> ProjectionState {
        self.lock().clone()
    }

    pub fn bucket(&self, name: &str) -> Vec<Service> {
        self.lock().bucket(&self.view, name).cloned().collect()
    }

    pub fn bucket_of(&self, id: ServiceId) -> Option<&'static str> {
        self.lock().bucket_of(&self.view, id)
    }

    pub fn get(&self, id: ServiceId) -> Option<Service> {
        self.lock().get(id).cloned()
    }

    pub fn contains(&self, id: ServiceId) -> bool {
        self.lock().get(id).is_some()
    }

    pub fn watch(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, ProjectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    fn log_move(&self, moved: BucketMove) {
        if moved.is_move() {
            debug!(
                role = %self.view.role,
                service_id = %moved.service_id,
                from = moved.from.unwrap_or("-"),
                to = moved.to.unwrap_or("-"),
                "Bucket move"
            );
        }
    }
}

impl EventHandler for LocalStateReconciler {
    fn handle(&self, event: &ChangeEvent) {
        self.apply(event);
    }
}

impl RecordRefresher for LocalStateReconciler {
    fn refresh(&self, service: &Service) {
        let newer = self
            .lock()
            .get(service.id)
            .map_or(true, |local| local.updated_at <= service.updated_at);
        if newer {
            self.upsert(service.clone());
        }
    }

    fn forget(&self, id: ServiceId) {
        self.remove(id);
    }
}

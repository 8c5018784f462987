//! Per-service read watermarks for message threads.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::debug;

use crate::model::{ServiceId, ThreadMessage, UserId};

/// Read state of one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnreadWatermark {
    /// When the session last marked the thread read. `None` if never.
    pub last_read_at: Option<DateTime<Utc>>,
    pub unread: u32,
}

/// Session-owned unread counters.
///
/// Marking a thread read takes effect immediately and does not wait for
/// any feed event. Only messages newer than the watermark and authored by
/// someone else count.
pub struct UnreadActivityTracker {
    me: UserId,
    threads: Mutex<HashMap<ServiceId, UnreadWatermark>>,
    total: watch::Sender<u32>,
}

impl UnreadActivityTracker {
    pub fn new(me: UserId) -> Self {
        let (total, _) = watch::channel(0);
        Self {
            me,
            threads: Mutex::new(HashMap::new()),
            total,
        }
    }

    pub fn identity(&self) -> UserId {
        self.me
    }

    pub fn mark_read(&self, service: ServiceId) {
        self.mark_read_at(service, Utc::now());
    }

    /// Set the watermark to `at` and reset the count.
    pub fn mark_read_at(&self, service: ServiceId, at: DateTime<Utc>) {
        self.update(|threads| {
            threads.insert(
                service,
                UnreadWatermark {
                    last_read_at: Some(at),
                    unread: 0,
                },
            );
        });
        debug!(service_id = %service, "Thread marked read");
    }

    /// Count an incoming message. Returns true if it raised the count.
    pub fn record_message(&self, message: &ThreadMessage) -> bool {
        if message.author_ref == self.me {
            return false;
        }
        let mut counted = false;
        self.update(|threads| {
            let watermark = threads.entry(message.service_ref).or_default();
            if watermark
                .last_read_at
                .map_or(true, |read| message.created_at > read)
            {
                watermark.unread = watermark.unread.saturating_add(1);
                counted = true;
            }
        });
        counted
    }

    pub fn unread_count(&self, service: ServiceId) -> u32 {
        self.lock()
            .get(&service)
            .map_or(0, |watermark| watermark.unread)
    }

    pub fn watermark(&self, service: ServiceId) -> Option<UnreadWatermark> {
        self.lock().get(&service).copied()
    }

    pub fn total_unread(&self) -> u32 {
        *self.total.borrow()
    }

    /// Total unread count as it changes, for badges.
    pub fn watch_total(&self) -> watch::Receiver<u32> {
        self.total.subscribe()
    }

    /// Forget every watermark (logout).
    pub fn clear(&self) {
        self.update(HashMap::clear);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ServiceId, UnreadWatermark>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, change: impl FnOnce(&mut HashMap<ServiceId, UnreadWatermark>)) {
        let total = {
            let mut threads = self.lock();
            change(&mut threads);
            threads.values().map(|w| w.unread).fold(0u32, u32::saturating_add)
        };
        self.total.send_if_modified(|current| {
            let changed = *current != total;
            *current = total;
            changed
        });
    }
}

//! In-memory channel-based change feed for standalone mode.
//!
//! Uses a tokio broadcast channel for pub/sub within a single process.
//! Filters are evaluated here, on the "server" side, before an event is
//! handed to a subscriber's stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{ChangeEvent, EventFilter, EventStream, FeedError, FeedTransport, Result};

/// Channel capacity for broadcast.
pub const CHANNEL_CAPACITY: usize = 1024;

/// In-memory change feed using a tokio broadcast channel.
///
/// Supports simulated outages: `disconnect_all` ends every live stream and
/// `set_available(false)` refuses new subscriptions until restored.
pub struct ChannelFeed {
    /// Broadcast sender; replaced wholesale on disconnect.
    sender: RwLock<broadcast::Sender<ChangeEvent>>,
    capacity: usize,
    available: AtomicBool,
}

impl ChannelFeed {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        info!(capacity, "Channel change feed initialized");
        Self {
            sender: RwLock::new(sender),
            capacity,
            available: AtomicBool::new(true),
        }
    }

    /// Publish an event to every live subscription. Returns the number of
    /// receivers it was queued for (before filtering).
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let sender = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        match sender.send(event) {
            Ok(receivers) => receivers,
            Err(err) => {
                // No receivers, that's okay for publish-only scenarios
                debug!(entity = %err.0.entity, "Published change (no receivers)");
                0
            }
        }
    }

    /// Drop every live connection. Subscribers' streams end once they have
    /// drained what was already queued.
    pub fn disconnect_all(&self) {
        let (sender, _) = broadcast::channel(self.capacity);
        let previous = {
            let mut guard = self.sender.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *guard, sender)
        };
        warn!(
            dropped = previous.receiver_count(),
            "Change feed disconnected all subscribers"
        );
    }

    /// Toggle whether new subscriptions are accepted.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if available {
            info!("Change feed accepting subscriptions");
        } else {
            warn!("Change feed refusing subscriptions");
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .receiver_count()
    }
}

impl Default for ChannelFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeedTransport for ChannelFeed {
    async fn subscribe(&self, entity: &str, filter: &EventFilter) -> Result<EventStream> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(FeedError::Unreachable(
                "channel feed is not accepting subscriptions".to_string(),
            ));
        }

        let receiver = self
            .sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe();
        let entity: Arc<str> = Arc::from(entity);
        let filter = Arc::new(filter.clone());

        debug!(entity = %entity, filter = %filter, "Channel subscription opened");

        let stream = futures::stream::unfold(receiver, move |mut receiver| {
            let entity = Arc::clone(&entity);
            let filter = Arc::clone(&filter);
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(event) => {
                            if *event.entity == *entity && filter.matches(&event) {
                                return Some((event, receiver));
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // Missed events cannot be recovered from the stream;
                            // end it so the client resubscribes and re-fetches.
                            warn!(entity = %entity, skipped, "Subscriber lagged, closing stream");
                            return None;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!(entity = %entity, "Channel closed, ending stream");
                            return None;
                        }
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

//! Change feed for realtime delivery of record changes.
//!
//! This module contains:
//! - `ChangeEvent`: one insert/update/delete notification for a collection
//! - `FeedTransport` trait: the push-based stream source (server side)
//! - `EventHandler` trait: synchronous consumers invoked on the event loop
//! - `ChangeFeedClient`: per-session subscription manager with silent
//!   resubscription
//! - Implementations: in-memory broadcast channel

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod channel;
pub mod client;
pub mod filter;

pub use channel::ChannelFeed;
pub use client::{ChangeFeedClient, FeedStatus, SubscriptionHandle};
pub use filter::{EventFilter, EventKind};

/// Result type for feed operations.
pub type Result<T> = std::result::Result<T, FeedError>;

/// Errors that can occur on the change feed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("Feed unreachable: {0}")]
    Unreachable(String),

    #[error("Invalid filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("Failed to encode {entity} record: {message}")]
    Encode { entity: String, message: String },

    #[error("Failed to decode {entity} record: {message}")]
    Decode { entity: String, message: String },

    #[error("Feed client is shut down")]
    ClientClosed,

    #[error("Subscription {0} is not open")]
    NotOpen(u64),
}

/// Kind of change carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        })
    }
}

/// One change notification. Ephemeral: consumed once per handler.
///
/// Rows travel as JSON so the feed can evaluate field filters without
/// knowing the record types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity: String,
    pub operation: Operation,
    pub new_value: Option<Value>,
    pub old_value: Option<Value>,
}

impl ChangeEvent {
    pub fn insert<T: Serialize>(entity: &str, record: &T) -> Result<Self> {
        Ok(Self {
            entity: entity.to_string(),
            operation: Operation::Insert,
            new_value: Some(encode(entity, record)?),
            old_value: None,
        })
    }

    pub fn update<T: Serialize>(entity: &str, old: &T, new: &T) -> Result<Self> {
        Ok(Self {
            entity: entity.to_string(),
            operation: Operation::Update,
            new_value: Some(encode(entity, new)?),
            old_value: Some(encode(entity, old)?),
        })
    }

    pub fn delete<T: Serialize>(entity: &str, old: &T) -> Result<Self> {
        Ok(Self {
            entity: entity.to_string(),
            operation: Operation::Delete,
            new_value: None,
            old_value: Some(encode(entity, old)?),
        })
    }

    /// Decode the new row, if the event carries one.
    pub fn new_record<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.new_value
            .as_ref()
            .map(|v| decode(&self.entity, v))
            .transpose()
    }

    /// Decode the old row, if the event carries one.
    pub fn old_record<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.old_value
            .as_ref()
            .map(|v| decode(&self.entity, v))
            .transpose()
    }
}

fn encode<T: Serialize>(entity: &str, record: &T) -> Result<Value> {
    serde_json::to_value(record).map_err(|e| FeedError::Encode {
        entity: entity.to_string(),
        message: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(entity: &str, value: &Value) -> Result<T> {
    T::deserialize(value).map_err(|e| FeedError::Decode {
        entity: entity.to_string(),
        message: e.to_string(),
    })
}

/// Ordered stream of events for one subscription. Ends on disconnect.
pub type EventStream = BoxStream<'static, ChangeEvent>;

/// Server side of the change feed.
///
/// Implementations:
/// - `ChannelFeed`: in-memory broadcast channel
#[async_trait]
pub trait FeedTransport: Send + Sync {
    /// Open a filtered stream of changes for one collection.
    ///
    /// The filter is evaluated by the transport, not the subscriber. The
    /// returned stream ends when the connection drops.
    async fn subscribe(&self, entity: &str, filter: &EventFilter) -> Result<EventStream>;
}

/// Consumer of change events.
///
/// Handlers run on the subscription's event loop and must not block; long
/// work is deferred by spawning.
pub trait EventHandler: Send + Sync {
    /// Process one event. Called in backend delivery order.
    fn handle(&self, event: &ChangeEvent);

    /// Called after the subscription was re-established following a
    /// disconnect. Events emitted while disconnected were not delivered.
    fn on_resubscribed(&self) {}
}

impl<F> EventHandler for F
where
    F: Fn(&ChangeEvent) + Send + Sync,
{
    fn handle(&self, event: &ChangeEvent) {
        self(event)
    }
}

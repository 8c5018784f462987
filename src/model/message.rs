//! Per-service auxiliary message threads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{MessageId, ServiceId, UserId};

/// One message in a service's thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub id: MessageId,
    pub service_ref: ServiceId,
    pub author_ref: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

//! Courier-to-courier handoff requests.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ServiceId, TransferId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Accepted,
    Rejected,
}

impl TransferStatus {
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// The recipient's answer to a transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDecision {
    Accept,
    Reject,
}

impl TransferDecision {
    /// Status a request ends in after this decision.
    pub const fn resulting_status(&self) -> TransferStatus {
        match self {
            Self::Accept => TransferStatus::Accepted,
            Self::Reject => TransferStatus::Rejected,
        }
    }
}

/// A request to hand an in-progress service from one courier to another.
///
/// At most one request per service may be `pending` at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub id: TransferId,
    pub service_ref: ServiceId,
    pub from_courier_ref: UserId,
    pub to_courier_ref: UserId,
    pub status: TransferStatus,
    pub reason: Option<String>,
    pub response_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl TransferRequest {
    pub fn is_pending(&self) -> bool {
        self.status == TransferStatus::Pending
    }
}

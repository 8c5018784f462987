//! Records exchanged with the backend and carried on the change feed.

pub mod identity;
pub mod ids;
pub mod message;
pub mod service;
pub mod transfer;
pub mod zone;

pub use identity::{Role, SessionIdentity};
pub use ids::{BranchId, MessageId, ServiceId, TransferId, UserId, ZoneId};
pub use message::ThreadMessage;
pub use service::{
    NewService, PaymentMethod, Service, ServicePatch, ServiceStatus, ServiceType,
};
pub use transfer::{TransferDecision, TransferRequest, TransferStatus};
pub use zone::{ZoneCapacityConfig, DEFAULT_MAX_CONCURRENT_SERVICES};

/// Collection names used on the change feed.
pub mod entity {
    pub const SERVICES: &str = "services";
    pub const TRANSFER_REQUESTS: &str = "transfer_requests";
    pub const MESSAGES: &str = "service_messages";
    pub const ZONE_CONFIGS: &str = "branch_capacity";
}

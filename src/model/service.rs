//! Delivery job record and its status vocabulary.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::ids::{BranchId, ServiceId, UserId, ZoneId};
use crate::error::ValidationError;

/// Lifecycle status of a service.
///
/// ```text
///  AVAILABLE ──▶ ASSIGNED ──▶ EN_ROUTE ──▶ DELIVERED ──▶ PAID
///      │  ▲          │  │         │
///      │  └──revert──┘  │         │
///      │  ▲─────────────┼──revert─┘
///      ▼                ▼
///  CANCELLED ◀──────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Published by the requester, waiting for a courier.
    Available,
    /// Claimed by or assigned to a courier.
    Assigned,
    /// Courier is on the way with a resolved zone.
    EnRoute,
    /// Handed over at the destination.
    Delivered,
    /// Delivered and settled.
    Paid,
    /// Withdrawn before completion.
    Cancelled,
}

impl ServiceStatus {
    pub const ALL: [ServiceStatus; 6] = [
        Self::Available,
        Self::Assigned,
        Self::EnRoute,
        Self::Delivered,
        Self::Paid,
        Self::Cancelled,
    ];

    /// Terminal statuses never return to the active pool.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Paid | Self::Cancelled)
    }

    /// Statuses in which a courier is actively holding the job.
    ///
    /// These are the statuses counted against a courier's concurrency cap.
    #[must_use]
    pub const fn is_held(&self) -> bool {
        matches!(self, Self::Assigned | Self::EnRoute)
    }

    /// Returns true if the lifecycle allows moving from self to target.
    ///
    /// Reverts to `Available` are listed here but are additionally restricted
    /// to the dispatcher role by the lifecycle machine.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Available => matches!(target, Self::Assigned | Self::Cancelled),
            Self::Assigned => {
                matches!(target, Self::EnRoute | Self::Cancelled | Self::Available)
            }
            Self::EnRoute => matches!(target, Self::Delivered | Self::Available),
            Self::Delivered => matches!(target, Self::Paid),
            Self::Paid | Self::Cancelled => false,
        }
    }

    /// Returns all valid target statuses from the current status.
    #[must_use]
    pub fn valid_transitions(&self) -> Vec<Self> {
        Self::ALL
            .into_iter()
            .filter(|target| self.can_transition_to(*target))
            .collect()
    }

    /// Wire label, identical to the serde representation.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Assigned => "assigned",
            Self::EnRoute => "en_route",
            Self::Delivered => "delivered",
            Self::Paid => "paid",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

impl FromStr for ServiceStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_label() == s)
            .ok_or_else(|| ValidationError::new("status", format!("unknown status '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    #[default]
    Delivery,
    Parcel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    #[default]
    Cash,
    Transfer,
    Prepaid,
}

/// A delivery job as stored by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub status: ServiceStatus,
    pub requester_ref: UserId,
    pub assigned_courier_ref: Option<UserId>,
    pub zone_ref: Option<ZoneId>,
    pub branch_ref: Option<BranchId>,
    pub destination_address: String,
    pub client_phone: String,
    pub client_name: String,
    pub payment_method: PaymentMethod,
    pub amount_to_collect: Decimal,
    pub notes: Option<String>,
    pub service_type: ServiceType,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub cancellation_reason: Option<String>,
}

impl Service {
    /// Build a fresh `available` service from a creation request.
    pub fn from_new(id: ServiceId, requester: UserId, new: NewService, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: ServiceStatus::Available,
            requester_ref: requester,
            assigned_courier_ref: None,
            zone_ref: new.zone_ref,
            branch_ref: new.branch_ref,
            destination_address: new.destination_address,
            client_phone: new.client_phone,
            client_name: new.client_name,
            payment_method: new.payment_method,
            amount_to_collect: new.amount_to_collect,
            notes: new.notes,
            service_type: new.service_type,
            created_at: now,
            assigned_at: None,
            completed_at: None,
            updated_at: now,
            cancellation_reason: None,
        }
    }

    /// Checks the assignee/status pairing.
    ///
    /// `available` and `cancelled` carry no courier, `assigned` and
    /// `en_route` always carry one, and `delivered`/`paid` keep the courier
    /// who completed the job.
    pub fn assignment_consistent(&self) -> bool {
        match self.status {
            ServiceStatus::Available | ServiceStatus::Cancelled => {
                self.assigned_courier_ref.is_none()
            }
            ServiceStatus::Assigned
            | ServiceStatus::EnRoute
            | ServiceStatus::Delivered
            | ServiceStatus::Paid => self.assigned_courier_ref.is_some(),
        }
    }

    /// Returns true if the given courier currently holds this job.
    pub fn is_held_by(&self, courier: UserId) -> bool {
        self.status.is_held() && self.assigned_courier_ref == Some(courier)
    }
}

/// Creation payload submitted by a requester.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewService {
    pub destination_address: String,
    pub client_phone: String,
    pub client_name: String,
    pub payment_method: PaymentMethod,
    pub amount_to_collect: Decimal,
    pub notes: Option<String>,
    pub service_type: ServiceType,
    pub zone_ref: Option<ZoneId>,
    pub branch_ref: Option<BranchId>,
}

impl NewService {
    /// Pre-flight validation; failures never reach the network.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.destination_address.trim().is_empty() {
            return Err(ValidationError::new(
                "destination_address",
                "destination address is required",
            ));
        }
        if self.client_name.trim().is_empty() {
            return Err(ValidationError::new("client_name", "client name is required"));
        }
        validate_phone(&self.client_phone)?;
        if self.amount_to_collect.is_sign_negative() {
            return Err(ValidationError::new(
                "amount_to_collect",
                "amount to collect cannot be negative",
            ));
        }
        Ok(())
    }
}

/// Field-level edit of a non-terminal service. `None` leaves a field as is.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicePatch {
    pub destination_address: Option<String>,
    pub client_phone: Option<String>,
    pub client_name: Option<String>,
    pub payment_method: Option<PaymentMethod>,
    pub amount_to_collect: Option<Decimal>,
    pub notes: Option<String>,
    pub zone_ref: Option<ZoneId>,
}

impl ServicePatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.is_empty() {
            return Err(ValidationError::new("patch", "nothing to update"));
        }
        if let Some(address) = &self.destination_address {
            if address.trim().is_empty() {
                return Err(ValidationError::new(
                    "destination_address",
                    "destination address cannot be blank",
                ));
            }
        }
        if let Some(name) = &self.client_name {
            if name.trim().is_empty() {
                return Err(ValidationError::new("client_name", "client name cannot be blank"));
            }
        }
        if let Some(phone) = &self.client_phone {
            validate_phone(phone)?;
        }
        if let Some(amount) = self.amount_to_collect {
            if amount.is_sign_negative() {
                return Err(ValidationError::new(
                    "amount_to_collect",
                    "amount to collect cannot be negative",
                ));
            }
        }
        Ok(())
    }

    /// Copy the present fields onto a service.
    pub fn apply_to(self, service: &mut Service) {
        if let Some(v) = self.destination_address {
            service.destination_address = v;
        }
        if let Some(v) = self.client_phone {
            service.client_phone = v;
        }
        if let Some(v) = self.client_name {
            service.client_name = v;
        }
        if let Some(v) = self.payment_method {
            service.payment_method = v;
        }
        if let Some(v) = self.amount_to_collect {
            service.amount_to_collect = v;
        }
        if let Some(v) = self.notes {
            service.notes = Some(v);
        }
        if let Some(v) = self.zone_ref {
            service.zone_ref = Some(v);
        }
    }
}

fn validate_phone(phone: &str) -> Result<(), ValidationError> {
    let digits = phone.chars().filter(char::is_ascii_digit).count();
    let allowed = phone
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | ' ' | '-' | '(' | ')'));
    if !allowed || digits < 7 {
        return Err(ValidationError::new(
            "client_phone",
            format!("'{phone}' is not a valid phone number"),
        ));
    }
    Ok(())
}

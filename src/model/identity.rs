//! Session identities and roles.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ids::{BranchId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Store/client creating jobs.
    Requester,
    /// Coordinator assigning, reverting and configuring capacity.
    Dispatcher,
    /// Delivery agent claiming and fulfilling jobs.
    Courier,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Requester => "requester",
            Self::Dispatcher => "dispatcher",
            Self::Courier => "courier",
        })
    }
}

/// Who is acting. Supplied by the external session provider at login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub user_id: UserId,
    pub role: Role,
    pub branch_ref: Option<BranchId>,
}

impl SessionIdentity {
    pub fn new(user_id: UserId, role: Role, branch_ref: Option<BranchId>) -> Self {
        Self {
            user_id,
            role,
            branch_ref,
        }
    }

    pub fn requester(user_id: UserId) -> Self {
        Self::new(user_id, Role::Requester, None)
    }

    pub fn dispatcher(user_id: UserId, branch: BranchId) -> Self {
        Self::new(user_id, Role::Dispatcher, Some(branch))
    }

    pub fn courier(user_id: UserId, branch: BranchId) -> Self {
        Self::new(user_id, Role::Courier, Some(branch))
    }

    pub fn is_dispatcher(&self) -> bool {
        self.role == Role::Dispatcher
    }
}

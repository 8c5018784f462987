//! Role views: which status buckets each role sees and how they are fed.

use crate::bus::EventFilter;
use crate::model::{BranchId, Role, Service, ServiceStatus, SessionIdentity, UserId};
use crate::storage::ServiceQuery;

/// Which services of a status group belong to a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketScope {
    Any,
    InBranch(BranchId),
    AssignedTo(UserId),
    RequestedBy(UserId),
}

impl BucketScope {
    fn matches(&self, service: &Service) -> bool {
        match self {
            Self::Any => true,
            Self::InBranch(branch) => service.branch_ref == Some(*branch),
            Self::AssignedTo(courier) => service.assigned_courier_ref == Some(*courier),
            Self::RequestedBy(requester) => service.requester_ref == *requester,
        }
    }
}

/// A named status grouping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSpec {
    pub name: &'static str,
    pub statuses: Vec<ServiceStatus>,
    pub scope: BucketScope,
}

impl BucketSpec {
    pub fn new(name: &'static str, statuses: &[ServiceStatus], scope: BucketScope) -> Self {
        Self {
            name,
            statuses: statuses.to_vec(),
            scope,
        }
    }

    pub fn matches(&self, service: &Service) -> bool {
        self.statuses.contains(&service.status) && self.scope.matches(service)
    }

    /// Bulk-list query returning this bucket's contents.
    pub fn query(&self) -> ServiceQuery {
        let query = ServiceQuery::with_statuses(&self.statuses);
        match self.scope {
            BucketScope::Any => query,
            BucketScope::InBranch(branch) => query.in_branch(branch),
            BucketScope::AssignedTo(courier) => query.assigned_to(courier),
            BucketScope::RequestedBy(requester) => query.requested_by(requester),
        }
    }
}

/// Role-specific projection over the single normalized record store.
///
/// Buckets are checked in order and a service lands in the first one it
/// matches, so no service can sit in two buckets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleView {
    pub role: Role,
    pub buckets: Vec<BucketSpec>,
    /// Change feed filters on the services collection that keep the
    /// buckets current.
    pub feeds: Vec<EventFilter>,
}

impl RoleView {
    /// A requester's own jobs.
    pub fn requester(requester: UserId) -> Self {
        let scope = BucketScope::RequestedBy(requester);
        Self {
            role: Role::Requester,
            buckets: vec![
                BucketSpec::new("pending", &[ServiceStatus::Available], scope),
                BucketSpec::new(
                    "in_progress",
                    &[ServiceStatus::Assigned, ServiceStatus::EnRoute],
                    scope,
                ),
                BucketSpec::new(
                    "completed",
                    &[ServiceStatus::Delivered, ServiceStatus::Paid],
                    scope,
                ),
            ],
            feeds: vec![EventFilter::all().eq("requester_ref", requester)],
        }
    }

    /// Branch-wide board.
    pub fn dispatcher(branch: BranchId) -> Self {
        let scope = BucketScope::InBranch(branch);
        Self {
            role: Role::Dispatcher,
            buckets: vec![
                BucketSpec::new("available", &[ServiceStatus::Available], scope),
                BucketSpec::new("assigned", &[ServiceStatus::Assigned], scope),
                BucketSpec::new("en_route", &[ServiceStatus::EnRoute], scope),
                BucketSpec::new("delivered", &[ServiceStatus::Delivered], scope),
            ],
            feeds: vec![EventFilter::all().eq("branch_ref", branch)],
        }
    }

    /// The open pool plus the courier's own jobs.
    pub fn courier(courier: UserId, branch: Option<BranchId>) -> Self {
        let (pool_scope, pool_feed) = match branch {
            Some(branch) => (
                BucketScope::InBranch(branch),
                EventFilter::all()
                    .eq("status", ServiceStatus::Available)
                    .eq("branch_ref", branch),
            ),
            None => (
                BucketScope::Any,
                EventFilter::all().eq("status", ServiceStatus::Available),
            ),
        };
        let mine = BucketScope::AssignedTo(courier);
        Self {
            role: Role::Courier,
            buckets: vec![
                BucketSpec::new("available", &[ServiceStatus::Available], pool_scope),
                BucketSpec::new("assigned", &[ServiceStatus::Assigned], mine),
                BucketSpec::new("en_route", &[ServiceStatus::EnRoute], mine),
                BucketSpec::new("delivered", &[ServiceStatus::Delivered], mine),
            ],
            feeds: vec![
                pool_feed,
                EventFilter::all().eq("assigned_courier_ref", courier),
            ],
        }
    }

    pub fn for_identity(identity: &SessionIdentity) -> Self {
        match (identity.role, identity.branch_ref) {
            (Role::Requester, _) => Self::requester(identity.user_id),
            (Role::Dispatcher, Some(branch)) => Self::dispatcher(branch),
            // A dispatcher without a branch sees everything.
            (Role::Dispatcher, None) => {
                let mut view = Self::dispatcher(BranchId::new());
                for bucket in &mut view.buckets {
                    bucket.scope = BucketScope::Any;
                }
                view.feeds = vec![EventFilter::all()];
                view
            }
            (Role::Courier, branch) => Self::courier(identity.user_id, branch),
        }
    }

    /// Name of the bucket `service` belongs to, if any.
    pub fn bucket_for(&self, service: &Service) -> Option<&'static str> {
        self.buckets
            .iter()
            .find(|bucket| bucket.matches(service))
            .map(|bucket| bucket.name)
    }

    pub fn bucket_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.buckets.iter().map(|bucket| bucket.name)
    }
}

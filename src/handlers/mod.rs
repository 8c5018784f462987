//! Change feed handlers that keep local state current.

pub mod projection;
pub mod view;

pub use projection::{
    apply_event, BucketMove, BucketScope, BucketSpec, LocalStateReconciler, ProjectionState,
    RoleView,
};
pub use view::SyncedView;

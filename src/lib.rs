//! Courier Dispatch - realtime delivery job coordination
//!
//! Keeps requesters, dispatchers and couriers looking at the same delivery
//! jobs. Every client holds a local, status-bucketed projection that is fed
//! by a change feed and reconciled against the backend, while claims,
//! transfers and lifecycle transitions are settled by the backend's atomic
//! conditional updates.

pub mod bus;
pub mod cache;
pub mod config;
pub mod error;
pub mod handlers;
pub mod model;
pub mod services;
pub mod session;
pub mod storage;
pub mod utils;

pub use error::{DispatchError, Result};
pub use session::{AppContext, SessionDeps};

//! Step definitions shared by every feature file.

mod claims;
mod lifecycle;
mod transfers;

use std::collections::HashMap;

use courier_dispatch::model::{Service, ServiceId, TransferRequest};
use courier_dispatch::{AppContext, DispatchError};
use cucumber::World;

use crate::common::Harness;

/// One branch with its sessions and the job under test.
#[derive(World)]
#[world(init = Self::new)]
pub struct DispatchWorld {
    harness: Harness,
    requester: Option<AppContext>,
    dispatcher: Option<AppContext>,
    couriers: HashMap<String, AppContext>,
    services: Vec<Service>,
    transfer: Option<TransferRequest>,
    /// Error from the most recent rejected action.
    last_error: Option<DispatchError>,
    /// Outcomes of the most recent concurrent claim, by courier name.
    claims: Vec<(String, Result<Service, DispatchError>)>,
}

impl std::fmt::Debug for DispatchWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchWorld")
            .field("branch", &self.harness.branch)
            .field("couriers", &self.couriers.keys().collect::<Vec<_>>())
            .field("services", &self.services.len())
            .field("last_error", &self.last_error)
            .finish()
    }
}

impl DispatchWorld {
    async fn new() -> Self {
        Self {
            harness: Harness::new(),
            requester: None,
            dispatcher: None,
            couriers: HashMap::new(),
            services: Vec::new(),
            transfer: None,
            last_error: None,
            claims: Vec::new(),
        }
    }

    fn requester(&self) -> &AppContext {
        self.requester.as_ref().expect("requester not logged in")
    }

    fn dispatcher(&self) -> &AppContext {
        self.dispatcher.as_ref().expect("dispatcher not logged in")
    }

    fn courier(&self, name: &str) -> &AppContext {
        self.couriers
            .get(name)
            .unwrap_or_else(|| panic!("courier {name} not logged in"))
    }

    /// The most recently published service.
    fn service_id(&self) -> ServiceId {
        self.services.last().expect("no service published").id
    }

    fn record<T>(&mut self, result: Result<T, DispatchError>) {
        self.last_error = result.err();
    }
}

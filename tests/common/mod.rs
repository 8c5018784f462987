//! Shared fixtures for integration tests.
//!
//! Every test gets its own in-memory backend and change feed; sessions
//! log in against them exactly as the standalone binary does.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use courier_dispatch::bus::ChannelFeed;
use courier_dispatch::cache::{MemoryMessageCache, MessageCache};
use courier_dispatch::config::Config;
use courier_dispatch::model::{BranchId, NewService, ServiceId, SessionIdentity, UserId};
use courier_dispatch::storage::MemoryBackend;
use courier_dispatch::{AppContext, SessionDeps};

pub struct Harness {
    pub feed: Arc<ChannelFeed>,
    pub backend: Arc<MemoryBackend>,
    pub cache: Arc<dyn MessageCache>,
    pub branch: BranchId,
}

impl Harness {
    pub fn new() -> Self {
        let feed = Arc::new(ChannelFeed::new());
        let backend = Arc::new(MemoryBackend::new(Arc::clone(&feed)));
        Self {
            feed,
            backend,
            cache: Arc::new(MemoryMessageCache::new()),
            branch: BranchId::new(),
        }
    }

    pub fn deps(&self) -> SessionDeps {
        SessionDeps {
            api: self.backend.clone(),
            transport: self.feed.clone(),
            cache: Arc::clone(&self.cache),
            config: Config::for_test(),
        }
    }

    pub async fn requester(&self) -> AppContext {
        AppContext::login(SessionIdentity::requester(UserId::new()), self.deps())
            .await
            .expect("requester login")
    }

    pub async fn dispatcher(&self) -> AppContext {
        AppContext::login(
            SessionIdentity::dispatcher(UserId::new(), self.branch),
            self.deps(),
        )
        .await
        .expect("dispatcher login")
    }

    pub async fn courier(&self) -> AppContext {
        AppContext::login(
            SessionIdentity::courier(UserId::new(), self.branch),
            self.deps(),
        )
        .await
        .expect("courier login")
    }

    pub fn job(&self) -> NewService {
        job_in(self.branch)
    }
}

pub fn job_in(branch: BranchId) -> NewService {
    NewService {
        destination_address: "Calle 53 #21-40".to_string(),
        client_phone: "315 555 0160".to_string(),
        client_name: "Valentina Ortiz".to_string(),
        branch_ref: Some(branch),
        ..NewService::default()
    }
}

/// Poll until `condition` holds, for up to two seconds.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Wait until `session` shows `service` in `bucket`.
pub async fn sees_in(session: &AppContext, service: ServiceId, bucket: &str) -> bool {
    eventually(|| session.view().bucket_of(service) == Some(bucket)).await
}

/// Wait until `session` no longer shows `service` at all.
pub async fn loses(session: &AppContext, service: ServiceId) -> bool {
    eventually(|| session.view().bucket_of(service).is_none()).await
}

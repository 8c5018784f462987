//! Publishing and claiming services.

use courier_dispatch::model::ZoneCapacityConfig;
use cucumber::{given, then, when};

use super::DispatchWorld;
use crate::common::sees_in;

#[given("a branch with a requester and a dispatcher")]
async fn given_branch(world: &mut DispatchWorld) {
    world.requester = Some(world.harness.requester().await);
    world.dispatcher = Some(world.harness.dispatcher().await);
}

#[given(expr = "courier {word} is logged in")]
async fn given_courier(world: &mut DispatchWorld, name: String) {
    let session = world.harness.courier().await;
    world.couriers.insert(name, session);
}

#[given(expr = "the branch limits couriers to {int} active services")]
async fn given_capacity(world: &mut DispatchWorld, max: u32) {
    let branch = world.harness.branch;
    let dispatcher = world.dispatcher();
    dispatcher
        .governor()
        .set_config(
            dispatcher.identity(),
            branch,
            ZoneCapacityConfig {
                branch_ref: branch,
                low_demand_enabled: true,
                max_concurrent_services_per_courier: max,
            },
        )
        .await
        .expect("capacity config accepted");
}

#[given("the requester has published a service")]
async fn given_published(world: &mut DispatchWorld) {
    publish(world, 1).await;
}

#[given(expr = "the requester has published {int} services")]
async fn given_published_many(world: &mut DispatchWorld, count: usize) {
    publish(world, count).await;
}

async fn publish(world: &mut DispatchWorld, count: usize) {
    for _ in 0..count {
        let service = world
            .requester()
            .create_service(world.harness.job())
            .await
            .expect("service created");
        assert!(sees_in(world.dispatcher(), service.id, "available").await);
        world.services.push(service);
    }
}

#[given(expr = "courier {word} has claimed the service")]
async fn given_claimed(world: &mut DispatchWorld, name: String) {
    world
        .courier(&name)
        .claim(world.service_id())
        .await
        .expect("claim accepted");
}

#[when(expr = "courier {word} claims the service")]
async fn when_claim(world: &mut DispatchWorld, name: String) {
    let result = world.courier(&name).claim(world.service_id()).await;
    world.record(result);
}

#[when(expr = "couriers {word} and {word} claim the service at the same time")]
async fn when_claim_race(world: &mut DispatchWorld, first: String, second: String) {
    let id = world.service_id();
    let (a, b) = tokio::join!(
        world.courier(&first).claim(id),
        world.courier(&second).claim(id)
    );
    world.claims = vec![(first, a), (second, b)];
}

#[when(expr = "courier {word} claims every published service")]
async fn when_claim_all(world: &mut DispatchWorld, name: String) {
    world.last_error = None;
    let ids: Vec<_> = world.services.iter().map(|s| s.id).collect();
    for id in ids {
        if let Err(e) = world.courier(&name).claim(id).await {
            world.last_error = Some(e);
        }
    }
}

#[then("exactly one claim succeeds")]
async fn then_one_winner(world: &mut DispatchWorld) {
    let winners = world.claims.iter().filter(|(_, r)| r.is_ok()).count();
    assert_eq!(winners, 1, "claims: {:?}", world.claims);
}

#[then("the other claim fails because the service was already taken")]
async fn then_loser_taken(world: &mut DispatchWorld) {
    let loser = world
        .claims
        .iter()
        .find_map(|(_, r)| r.as_ref().err())
        .expect("one claim should fail");
    assert!(loser.is_already_taken(), "got {loser}");
}

#[then(expr = "the action fails with a {word} error")]
async fn then_fails_with(world: &mut DispatchWorld, kind: String) {
    let err = world.last_error.as_ref().expect("expected the action to fail");
    let matches = match kind.as_str() {
        "validation" => err.is_validation(),
        "conflict" => err.is_conflict(),
        "capacity" => err.is_capacity(),
        "not-found" => err.is_not_found(),
        "transport" => err.is_transport(),
        other => panic!("unknown error kind {other}"),
    };
    assert!(matches, "expected a {kind} error, got {err}");
}

#[then("the action succeeds")]
async fn then_succeeds(world: &mut DispatchWorld) {
    assert!(world.last_error.is_none(), "got {:?}", world.last_error);
}

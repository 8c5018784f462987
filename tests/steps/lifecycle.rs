//! Status transitions and what each role sees.

use courier_dispatch::model::ZoneId;
use courier_dispatch::storage::ServiceApi;
use cucumber::{then, when};

use super::DispatchWorld;
use crate::common::{loses, sees_in};

#[when(expr = "courier {word} starts the route")]
async fn when_start_route(world: &mut DispatchWorld, name: String) {
    let result = world
        .courier(&name)
        .start_route(world.service_id(), Some(ZoneId::new()))
        .await;
    world.record(result);
}

#[when(expr = "courier {word} marks the service delivered")]
async fn when_delivered(world: &mut DispatchWorld, name: String) {
    let result = world.courier(&name).mark_delivered(world.service_id()).await;
    world.record(result);
}

#[when("the dispatcher marks the service paid")]
async fn when_paid(world: &mut DispatchWorld) {
    let result = world.dispatcher().mark_paid(world.service_id()).await;
    world.record(result);
}

#[when("the dispatcher reverts the service")]
async fn when_revert(world: &mut DispatchWorld) {
    let result = world.dispatcher().revert(world.service_id()).await;
    world.record(result);
}

#[when(expr = "the requester cancels the service because {string}")]
async fn when_cancel(world: &mut DispatchWorld, reason: String) {
    let result = world.requester().cancel(world.service_id(), reason).await;
    world.record(result);
}

#[then(expr = "the service is {word}")]
async fn then_status(world: &mut DispatchWorld, status: String) {
    let stored = world
        .harness
        .backend
        .get_service(world.service_id())
        .await
        .expect("service exists");
    assert_eq!(stored.status.as_label(), status);
}

#[then(expr = "the service is held by courier {word}")]
async fn then_held_by(world: &mut DispatchWorld, name: String) {
    let stored = world
        .harness
        .backend
        .get_service(world.service_id())
        .await
        .expect("service exists");
    assert_eq!(
        stored.assigned_courier_ref,
        Some(world.courier(&name).identity().user_id)
    );
}

#[then("the service has no courier")]
async fn then_no_courier(world: &mut DispatchWorld) {
    let stored = world
        .harness
        .backend
        .get_service(world.service_id())
        .await
        .expect("service exists");
    assert!(stored.assigned_courier_ref.is_none());
}

#[then(expr = "the dispatcher sees the service in {word}")]
async fn then_dispatcher_sees(world: &mut DispatchWorld, bucket: String) {
    assert!(sees_in(world.dispatcher(), world.service_id(), &bucket).await);
}

#[then(expr = "the requester sees the service in {word}")]
async fn then_requester_sees(world: &mut DispatchWorld, bucket: String) {
    assert!(sees_in(world.requester(), world.service_id(), &bucket).await);
}

#[then(expr = "courier {word} sees the service in {word}")]
async fn then_courier_sees(world: &mut DispatchWorld, name: String, bucket: String) {
    assert!(sees_in(world.courier(&name), world.service_id(), &bucket).await);
}

#[then(expr = "courier {word} does not see the service")]
async fn then_courier_lost(world: &mut DispatchWorld, name: String) {
    assert!(loses(world.courier(&name), world.service_id()).await);
}

#[then("the dispatcher does not see the service")]
async fn then_dispatcher_lost(world: &mut DispatchWorld) {
    assert!(loses(world.dispatcher(), world.service_id()).await);
}

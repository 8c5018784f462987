//! Courier-to-courier hand-offs.

use courier_dispatch::model::TransferDecision;
use cucumber::when;

use super::DispatchWorld;

#[when(expr = "courier {word} asks {word} to take over the service")]
async fn when_request(world: &mut DispatchWorld, from: String, to: String) {
    let to_id = world.courier(&to).identity().user_id;
    let result = world
        .courier(&from)
        .request_transfer(world.service_id(), to_id, Some("vehicle trouble".to_string()))
        .await;
    match result {
        Ok(request) => {
            world.transfer = Some(request);
            world.last_error = None;
        }
        Err(e) => world.last_error = Some(e),
    }
}

#[when(expr = "courier {word} accepts the transfer")]
async fn when_accept(world: &mut DispatchWorld, name: String) {
    respond(world, &name, TransferDecision::Accept).await;
}

#[when(expr = "courier {word} rejects the transfer")]
async fn when_reject(world: &mut DispatchWorld, name: String) {
    respond(world, &name, TransferDecision::Reject).await;
}

async fn respond(world: &mut DispatchWorld, name: &str, decision: TransferDecision) {
    let request = world.transfer.as_ref().expect("no transfer requested").id;
    let result = world
        .courier(name)
        .respond_transfer(request, decision, None)
        .await;
    world.record(result);
}

//! Gherkin scenarios for the delivery job lifecycle.
//!
//! ```bash
//! cargo test --test features
//! ```

mod common;
mod steps;

use cucumber::World;
use steps::DispatchWorld;

#[tokio::main]
async fn main() {
    DispatchWorld::cucumber()
        .fail_on_skipped()
        .run_and_exit("tests/features")
        .await;
}

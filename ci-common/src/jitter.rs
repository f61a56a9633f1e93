use rand::prelude::*;
use std::time::Duration;

/// Adds up to 10s of random jitter to `value`, so that many workers woken by
/// the same schedule do not all retry in lockstep.
pub fn jitter(value: Duration) -> Duration {
    let random: u64 = thread_rng().gen_range(0..10);
    Duration::from_secs(random) + value
}

pub async fn delay_with_jitter(value: Duration) {
    tokio::time::sleep(jitter(value)).await;
}

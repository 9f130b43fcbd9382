// tests/common/mod.rs
#![allow(dead_code)]

use std::time::Duration;
use tokio::time::{sleep, timeout};

use rental_ingest::consumer::ConsumerSettings;
use rental_ingest::retry::RetryPolicy;

pub const QUEUE: &str = "rental-contracts";

pub fn fast_settings() -> ConsumerSettings {
    ConsumerSettings {
        retry: RetryPolicy::exponential(3, 1),
        failure_cooldown: Duration::from_millis(1),
        missing_reference_retries: 1,
        missing_reference_delay: Duration::from_millis(1),
        dead_letter: true,
        consumer_tag: "integration".to_string(),
    }
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let polled = timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {}", what);
}

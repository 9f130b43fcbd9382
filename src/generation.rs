// src/generation.rs
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::generator::RentalGenerator;
use crate::producer::RentalProducer;
use crate::queue::QueueClient;
use crate::shutdown::ShutdownListener;

pub const DEFAULT_GENERATION_COUNT: usize = 10;

/// Outcome of one generation request. A `published_count` below
/// `requested_count` means some publishes failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GenerationResult {
    pub requested_count: usize,
    pub published_count: usize,
    pub message: String,
}

impl GenerationResult {
    pub fn new(requested_count: usize, published_count: usize) -> Self {
        Self {
            requested_count,
            published_count,
            message: format!(
                "Successfully published {} of {} rental contracts",
                published_count, requested_count
            ),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.published_count == self.requested_count
    }
}

/// Generates `count` contracts and publishes them as one batch.
pub async fn generate_and_publish<Q: QueueClient>(
    generator: &RentalGenerator,
    producer: &mut RentalProducer<Q>,
    count: usize,
    shutdown: &ShutdownListener,
) -> GenerationResult {
    info!(count, "Generating rental contracts");
    let contracts = generator.generate(count);
    let published = producer.publish_batch(&contracts, shutdown).await;

    let result = GenerationResult::new(count, published);
    info!(
        published = result.published_count,
        total = result.requested_count,
        "Successfully published rental contracts"
    );
    result
}

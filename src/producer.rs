// src/producer.rs
use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::contract::RentalContract;
use crate::queue::{QueueClient, QueueError};
use crate::retry::RetryPolicy;
use crate::shutdown::ShutdownListener;

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to serialize rental contract: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Failed to publish rental contract: {0}")]
    QueueError(#[from] QueueError),
}

/// Publishes rental contracts to the durable queue. Owns its queue client,
/// and therefore its channel.
pub struct RentalProducer<Q> {
    client: Q,
    retry: RetryPolicy,
}

impl<Q: QueueClient> RentalProducer<Q> {
    pub fn new(client: Q, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    /// Publishes one contract. Every attempt runs the whole ensure-ready and
    /// publish sequence on a fresh channel if the previous one failed.
    pub async fn publish(&mut self, contract: &RentalContract) -> Result<(), ProducerError> {
        let body = contract.encode()?;

        self.retry
            .retry("publish", &mut self.client, |client| {
                let body = body.clone();
                async move {
                    let outcome: Result<(), QueueError> = async {
                        client.ensure_ready().await?;
                        client.publish(&body).await
                    }
                    .await;
                    if outcome.is_err() {
                        client.reset();
                    }
                    outcome
                }
                .boxed()
            })
            .await?;

        debug!(
            client_id = contract.client_id,
            car_id = contract.car_id,
            "Published rental contract"
        );
        Ok(())
    }

    /// Publishes contracts in order, each independently. Failures are logged
    /// and skipped. Stops early, between items, once `shutdown` fires.
    /// Returns how many were published.
    pub async fn publish_batch(
        &mut self,
        contracts: &[RentalContract],
        shutdown: &ShutdownListener,
    ) -> usize {
        let mut published = 0;
        for (index, contract) in contracts.iter().enumerate() {
            if shutdown.is_triggered() {
                info!(
                    published,
                    remaining = contracts.len() - index,
                    "Batch publish cancelled"
                );
                break;
            }

            match self.publish(contract).await {
                Ok(()) => published += 1,
                Err(e) => error!(
                    index,
                    client_id = contract.client_id,
                    car_id = contract.car_id,
                    error = %e,
                    "Failed to publish rental contract"
                ),
            }
        }
        published
    }

    pub async fn close(&mut self) -> Result<(), ProducerError> {
        self.client.close().await?;
        Ok(())
    }
}

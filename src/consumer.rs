// src/consumer.rs
//! Background consumer that drains the rental-contract queue into the write
//! service.
//!
//! Per connection lifetime the consumer moves through
//! `Disconnected -> Connecting -> Consuming`, falling back to `Connecting`
//! whenever the subscription fails. Messages are handled one at a time with
//! manual acknowledgement:
//!
//! * malformed body: ack and drop
//! * rental created: ack
//! * missing client or car: wait, then send it to the back of the queue with
//!   its retry counter bumped; once the counter reaches the bound, reject
//!   without requeue (dead-letter). Without a dead-letter queue it is kept
//!   queued instead.
//! * any other failure: cool down, then nack with requeue
//!
//! Delivery is at least once. A crash between the write and the ack
//! produces a duplicate rental.

use futures::{FutureExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::contract::RentalContract;
use crate::queue::{IncomingMessage, QueueClient, QueueError};
use crate::rentals::{RentalWriteService, WriteError};
use crate::retry::RetryPolicy;
use crate::shutdown::{self, ShutdownListener, ShutdownTrigger};

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Could not connect to the broker: {0}")]
    ConnectionFailed(#[source] QueueError),

    #[error("Consumer task failed: {0}")]
    TaskFailed(String),

    #[error("Consumer did not stop within {0:?}")]
    ShutdownTimedOut(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Consuming,
    Stopped,
}

/// What happened to a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Created { rental_id: u64 },
    DroppedMalformed,
    RequeuedMissingReference { retry_attempts: u32 },
    /// Bound reached with no dead-letter queue to receive it.
    KeptPendingMissingReference,
    DeadLettered,
    RequeuedAfterFailure,
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub retry: RetryPolicy,
    pub failure_cooldown: Duration,
    /// Retries for a missing client or car, counted in the message's own
    /// retry header so broker redeliveries for other reasons do not count.
    pub missing_reference_retries: u32,
    pub missing_reference_delay: Duration,
    /// Whether the queue routes rejected messages to a dead-letter queue.
    pub dead_letter: bool,
    pub consumer_tag: String,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            failure_cooldown: Duration::from_millis(1000),
            missing_reference_retries: 3,
            missing_reference_delay: Duration::from_millis(2000),
            dead_letter: true,
            consumer_tag: format!("rental-consumer-{}", &Uuid::new_v4().simple().to_string()[..8]),
        }
    }
}

/// Applies the per-message protocol. Holds no channel state.
pub struct MessageHandler<W> {
    writer: W,
    failure_cooldown: Duration,
    missing_reference_retries: u32,
    missing_reference_delay: Duration,
    dead_letter: bool,
}

impl<W: RentalWriteService> MessageHandler<W> {
    pub fn new(writer: W, settings: &ConsumerSettings) -> Self {
        Self {
            writer,
            failure_cooldown: settings.failure_cooldown,
            missing_reference_retries: settings.missing_reference_retries,
            missing_reference_delay: settings.missing_reference_delay,
            dead_letter: settings.dead_letter,
        }
    }

    /// Decodes, writes and settles one delivery. An `Err` means the outcome
    /// was decided but could not be reported to the broker; the broker will
    /// redeliver the message.
    pub async fn handle(&self, message: IncomingMessage) -> Result<Disposition, QueueError> {
        let contract = match RentalContract::decode(&message.body) {
            Ok(contract) => contract,
            Err(e) => {
                error!(
                    error = %e,
                    body = %String::from_utf8_lossy(&message.body),
                    "Dropping malformed rental message"
                );
                message.ack().await?;
                return Ok(Disposition::DroppedMalformed);
            }
        };

        match self.writer.create_rental(&contract).await {
            Ok(rental) => {
                info!(
                    rental_id = rental.id,
                    client_id = contract.client_id,
                    car_id = contract.car_id,
                    "Created rental"
                );
                message.ack().await?;
                Ok(Disposition::Created {
                    rental_id: rental.id,
                })
            }
            Err(e @ WriteError::NotFound { .. }) => {
                let attempts = message.retry_attempts;
                if attempts >= self.missing_reference_retries && self.dead_letter {
                    warn!(
                        client_id = contract.client_id,
                        car_id = contract.car_id,
                        retry_attempts = attempts,
                        error = %e,
                        "Dead-lettering rental with missing entity"
                    );
                    message.reject(false).await?;
                    return Ok(Disposition::DeadLettered);
                }

                let disposition = if attempts >= self.missing_reference_retries {
                    warn!(
                        client_id = contract.client_id,
                        car_id = contract.car_id,
                        retry_attempts = attempts,
                        error = %e,
                        "No dead-letter queue for rental with missing entity, keeping it queued"
                    );
                    Disposition::KeptPendingMissingReference
                } else {
                    warn!(
                        client_id = contract.client_id,
                        car_id = contract.car_id,
                        attempt = attempts + 1,
                        max_retries = self.missing_reference_retries,
                        error = %e,
                        "Skipping rental creation due to missing entity, retrying later"
                    );
                    Disposition::RequeuedMissingReference {
                        retry_attempts: attempts + 1,
                    }
                };

                sleep(self.missing_reference_delay).await;
                message.retry_later(attempts.saturating_add(1)).await?;
                Ok(disposition)
            }
            Err(e) => {
                error!(
                    client_id = contract.client_id,
                    car_id = contract.car_id,
                    error = %e,
                    "Unexpected error processing rental message"
                );
                sleep(self.failure_cooldown).await;
                message.nack(true).await?;
                Ok(Disposition::RequeuedAfterFailure)
            }
        }
    }
}

pub struct RentalConsumer<Q, W> {
    client: Q,
    handler: MessageHandler<W>,
    retry: RetryPolicy,
    consumer_tag: String,
    state: watch::Sender<ConsumerState>,
}

impl<Q, W> RentalConsumer<Q, W>
where
    Q: QueueClient + 'static,
    W: RentalWriteService + 'static,
{
    pub fn new(client: Q, writer: W, settings: ConsumerSettings) -> Self {
        let (state, _) = watch::channel(ConsumerState::Disconnected);
        Self {
            client,
            handler: MessageHandler::new(writer, &settings),
            retry: settings.retry,
            consumer_tag: settings.consumer_tag,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }

    /// Starts the consumer on its own task.
    pub fn spawn(self) -> ConsumerHandle {
        let (trigger, listener) = shutdown::channel();
        let state = self.state();
        let task = tokio::spawn(self.run(listener));
        ConsumerHandle {
            trigger,
            state,
            task,
        }
    }

    /// Consumes until `shutdown` fires or the connection cannot be
    /// re-established within the retry policy. Shutdown is only observed
    /// between messages.
    pub async fn run(mut self, mut shutdown: ShutdownListener) -> Result<(), ConsumerError> {
        let outcome = loop {
            if shutdown.is_triggered() {
                break Ok(());
            }

            self.set_state(ConsumerState::Connecting);
            let tag = self.consumer_tag.clone();
            let attempt = tokio::select! {
                result = self.retry.retry("connect", &mut self.client, |client| {
                    let tag = tag.clone();
                    async move {
                        let subscription = client.subscribe(&tag).await;
                        if subscription.is_err() {
                            client.reset();
                        }
                        subscription
                    }
                    .boxed()
                }) => Some(result),
                _ = shutdown.triggered() => None,
            };

            let mut subscription = match attempt {
                None => break Ok(()),
                Some(Ok(subscription)) => subscription,
                Some(Err(e)) => {
                    error!(
                        queue = %self.client.queue_name(),
                        error = %e,
                        "Giving up on broker connection"
                    );
                    break Err(ConsumerError::ConnectionFailed(e));
                }
            };

            self.set_state(ConsumerState::Consuming);
            info!(queue = %self.client.queue_name(), tag = %tag, "Consuming rental contracts");

            let stopping = loop {
                let next = tokio::select! {
                    biased;
                    _ = shutdown.triggered() => None,
                    delivery = subscription.next() => Some(delivery),
                };

                match next {
                    None => break true,
                    Some(Some(Ok(message))) => {
                        if let Err(e) = self.handler.handle(message).await {
                            error!(error = %e, "Failed to settle rental message");
                        }
                    }
                    Some(Some(Err(e))) => {
                        warn!(error = %e, "Subscription failed, reconnecting");
                        break false;
                    }
                    Some(None) => {
                        warn!("Subscription ended, reconnecting");
                        break false;
                    }
                }
            };
            drop(subscription);

            if stopping {
                break Ok(());
            }
            self.client.reset();
            self.set_state(ConsumerState::Disconnected);
        };

        info!(queue = %self.client.queue_name(), "Stopping rental consumer");
        if let Err(e) = self.client.close().await {
            warn!(error = %e, "Failed to close consumer channel");
        }
        self.set_state(ConsumerState::Stopped);
        outcome
    }
}

/// Owns the background consumer task.
pub struct ConsumerHandle {
    trigger: ShutdownTrigger,
    state: watch::Receiver<ConsumerState>,
    task: JoinHandle<Result<(), ConsumerError>>,
}

impl ConsumerHandle {
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConsumerState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signals the consumer to stop and waits up to `grace` for it to
    /// finish its in-flight message. The task is aborted if it overruns.
    pub async fn shutdown(self, grace: Duration) -> Result<(), ConsumerError> {
        self.trigger.trigger();
        let mut task = self.task;
        match timeout(grace, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(ConsumerError::TaskFailed(join_error.to_string())),
            Err(_) => {
                task.abort();
                Err(ConsumerError::ShutdownTimedOut(grace))
            }
        }
    }

    /// Waits for the task to end on its own, e.g. after giving up on the broker.
    pub async fn join(self) -> Result<(), ConsumerError> {
        match self.task.await {
            Ok(result) => result,
            Err(join_error) => Err(ConsumerError::TaskFailed(join_error.to_string())),
        }
    }
}

// src/main.rs
use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rental_ingest::config::AppConfig;
use rental_ingest::consumer::{ConsumerSettings, ConsumerState, RentalConsumer};
use rental_ingest::generation::generate_and_publish;
use rental_ingest::generator::RentalGenerator;
use rental_ingest::producer::RentalProducer;
use rental_ingest::queue::amqp::{ChannelConfig, QueueTopology};
use rental_ingest::queue::AmqpQueueClient;
use rental_ingest::rentals::InMemoryRentalStore;
use rental_ingest::shutdown;

fn queue_client(config: &AppConfig, confirm_mode: bool) -> AmqpQueueClient {
    AmqpQueueClient::new(
        &config.connection.uri,
        config.connection.connect_timeout(),
        QueueTopology {
            name: config.rabbit_mq.queue_name.clone(),
            dead_letter: config.rabbit_mq.dead_letter,
        },
        ChannelConfig {
            prefetch_count: config.rabbit_mq.prefetch_count,
            confirm_mode,
            ..ChannelConfig::default()
        },
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::load().context("Failed to load configuration")?;
    info!(queue = %config.rabbit_mq.queue_name, "Starting rental ingest");

    let store = InMemoryRentalStore::seeded(config.store.seed_clients, config.store.seed_cars);
    let settings = ConsumerSettings {
        retry: config.rabbit_mq.retry_policy(),
        failure_cooldown: config.rabbit_mq.failure_cooldown(),
        missing_reference_retries: config.rabbit_mq.missing_reference_retries,
        missing_reference_delay: config.rabbit_mq.missing_reference_delay(),
        dead_letter: config.rabbit_mq.dead_letter,
        ..ConsumerSettings::default()
    };
    let consumer = RentalConsumer::new(queue_client(&config, false), store.clone(), settings);
    let handle = consumer.spawn();

    let (trigger, mut listener) = shutdown::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        }
        trigger.trigger();
    });

    let mut producer = RentalProducer::new(queue_client(&config, true), config.rabbit_mq.retry_policy());
    if config.generator.startup_count > 0 {
        let generator = RentalGenerator::new(config.generator.clone());
        let result =
            generate_and_publish(&generator, &mut producer, config.generator.startup_count, &listener)
                .await;
        info!(result = %serde_json::to_string(&result)?, "Startup generation finished");
    }

    let mut state = handle.state_receiver();
    tokio::select! {
        _ = listener.triggered() => {}
        _ = state.wait_for(|state| *state == ConsumerState::Stopped) => {
            warn!("Consumer stopped before shutdown was requested");
        }
    }

    if let Err(e) = producer.close().await {
        warn!(error = %e, "Failed to close producer channel");
    }

    match handle.shutdown(config.shutdown_grace()).await {
        Ok(()) => {
            info!(rentals = store.rental_count(), "Rental ingest stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Consumer stopped with an error");
            Err(e.into())
        }
    }
}

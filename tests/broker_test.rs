// tests/broker_test.rs
// Runs against a live RabbitMQ. Point AMQP_ADDR at it and use `--ignored`.
mod common;

use std::env;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use common::wait_until;
use rental_ingest::config::{load_config_file, AppConfig};
use rental_ingest::consumer::{ConsumerSettings, RentalConsumer};
use rental_ingest::generator::RentalGenerator;
use rental_ingest::producer::RentalProducer;
use rental_ingest::queue::amqp::{ChannelConfig, QueueTopology};
use rental_ingest::queue::{dead_letter_queue_name, AmqpQueueClient, QueueClient};
use rental_ingest::rentals::InMemoryRentalStore;
use rental_ingest::shutdown;

fn load_test_config() -> AppConfig {
    let mut config = load_config_file(Path::new("tests/fixtures/broker_config.json"))
        .expect("Failed to read test config");
    config
        .apply_env_overrides(|key| env::var(key).ok())
        .expect("Invalid environment override");
    // a fresh queue per run keeps leftovers from earlier runs out
    config.rabbit_mq.queue_name = format!(
        "{}-{}",
        config.rabbit_mq.queue_name,
        &Uuid::new_v4().simple().to_string()[..8]
    );
    config
}

fn client(config: &AppConfig, confirm_mode: bool) -> AmqpQueueClient {
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

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance
async fn test_round_trip_through_rabbitmq() {
    let config = load_test_config();
    let store = InMemoryRentalStore::seeded(config.store.seed_clients, config.store.seed_cars);
    let generator = RentalGenerator::new(config.generator.clone());
    let mut producer = RentalProducer::new(client(&config, true), config.rabbit_mq.retry_policy());
    let (_trigger, listener) = shutdown::channel();

    let contracts = generator.generate(10);
    assert_eq!(producer.publish_batch(&contracts, &listener).await, 10);

    let settings = ConsumerSettings {
        retry: config.rabbit_mq.retry_policy(),
        failure_cooldown: config.rabbit_mq.failure_cooldown(),
        missing_reference_retries: config.rabbit_mq.missing_reference_retries,
        missing_reference_delay: config.rabbit_mq.missing_reference_delay(),
        dead_letter: config.rabbit_mq.dead_letter,
        ..ConsumerSettings::default()
    };
    let handle = RentalConsumer::new(client(&config, false), store.clone(), settings).spawn();
    wait_until("rentals", || store.rental_count() == 10).await;
    handle.shutdown(Duration::from_secs(5)).await.unwrap();

    let mut admin = client(&config, false);
    let channel = admin.channel().await.expect("Failed to open channel");
    for queue in [
        dead_letter_queue_name(admin.queue_name()),
        admin.queue_name().to_string(),
    ] {
        channel
            .queue_delete(&queue, Default::default())
            .await
            .expect("Failed to delete test queue");
    }
    admin.close().await.expect("Failed to close channel");
}

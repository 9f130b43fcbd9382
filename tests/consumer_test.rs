// tests/consumer_test.rs
mod common;

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{fast_settings, wait_until, QUEUE};
use rental_ingest::consumer::{ConsumerError, ConsumerState, RentalConsumer};
use rental_ingest::contract::{Money, RentalContract};
use rental_ingest::queue::MemoryBroker;
use rental_ingest::rentals::{InMemoryRentalStore, Rental, RentalWriteService, WriteError};
use rental_ingest::retry::RetryPolicy;

fn contract_body(client_id: i32, car_id: i32) -> Vec<u8> {
    RentalContract {
        client_id,
        car_id,
        start_time: Utc::now(),
        duration_hours: 5,
        total_cost: Money::from_cents(12_550),
    }
    .encode()
    .unwrap()
}

/// Fails with a transient error a fixed number of times, then delegates.
struct FlakyWriter {
    store: InMemoryRentalStore,
    failures_left: AtomicU32,
    calls: AtomicU32,
}

impl FlakyWriter {
    fn new(store: InMemoryRentalStore, failures: u32) -> Self {
        Self {
            store,
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl RentalWriteService for FlakyWriter {
    async fn create_rental(&self, contract: &RentalContract) -> Result<Rental, WriteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(WriteError::Other("database unavailable".to_string()));
        }
        self.store.create_rental(contract).await
    }
}

/// Takes a while to write, to keep a message in flight.
struct SlowWriter {
    store: InMemoryRentalStore,
    delay: Duration,
}

#[async_trait]
impl RentalWriteService for SlowWriter {
    async fn create_rental(&self, contract: &RentalContract) -> Result<Rental, WriteError> {
        tokio::time::sleep(self.delay).await;
        self.store.create_rental(contract).await
    }
}

#[tokio::test]
async fn test_valid_message_creates_one_rental_and_acks() {
    let broker = MemoryBroker::new();
    let store = InMemoryRentalStore::seeded(3, 3);
    broker.push_raw(contract_body(2, 3));

    let handle = RentalConsumer::new(broker.client(QUEUE), store.clone(), fast_settings()).spawn();
    wait_until("rental", || store.rental_count() == 1).await;
    wait_until("ack", || broker.acked_count() == 1).await;

    let rentals = store.rentals();
    let rental = &rentals[0];
    assert_eq!((rental.client_id, rental.car_id), (2, 3));
    assert_eq!(rental.total_cost.to_string(), "125.50");

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
    assert_eq!(broker.ready_count(), 0);
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn test_malformed_message_is_acked_once_and_dropped() {
    let broker = MemoryBroker::new();
    let store = InMemoryRentalStore::seeded(3, 3);
    broker.push_raw("definitely not json");
    broker.push_raw(r#"{"ClientId":1,"CarId":1,"StartTime":"2024-01-01T00:00:00Z","DurationHours":0,"TotalCost":10.0}"#);
    broker.push_raw(contract_body(1, 1));

    let handle = RentalConsumer::new(broker.client(QUEUE), store.clone(), fast_settings()).spawn();
    wait_until("all acked", || broker.acked_count() == 3).await;

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
    assert_eq!(store.rental_count(), 1);
    assert_eq!(broker.ready_count(), 0);
    assert!(broker.dead_letters().is_empty());
}

#[tokio::test]
async fn test_transient_failures_are_requeued_until_write_succeeds() {
    let broker = MemoryBroker::new();
    let store = InMemoryRentalStore::seeded(3, 3);
    let writer = Arc::new(FlakyWriter::new(store.clone(), 3));
    broker.push_raw(contract_body(1, 2));

    let handle = RentalConsumer::new(broker.client(QUEUE), Arc::clone(&writer), fast_settings()).spawn();
    wait_until("rental", || store.rental_count() == 1).await;
    wait_until("ack", || broker.acked_count() == 1).await;
    handle.shutdown(Duration::from_secs(1)).await.unwrap();

    assert_eq!(writer.calls.load(Ordering::SeqCst), 4);
    assert!(broker.dead_letters().is_empty());
    assert_eq!(broker.ready_count(), 0);
}

#[tokio::test]
async fn test_missing_client_is_dead_lettered_without_persisting() {
    let broker = MemoryBroker::new();
    let store = InMemoryRentalStore::seeded(3, 3);
    let body = contract_body(999_999, 1);
    broker.push_raw(body.clone());

    let handle = RentalConsumer::new(broker.client(QUEUE), store.clone(), fast_settings()).spawn();
    wait_until("dead letter", || broker.dead_letters().len() == 1).await;
    handle.shutdown(Duration::from_secs(1)).await.unwrap();

    assert_eq!(broker.dead_letters()[0], body);
    // the single retry acks its original delivery when it is republished
    assert_eq!(broker.acked_count(), 1);
    assert_eq!(store.rental_count(), 0);
    assert_eq!(broker.ready_count(), 0);
}

#[tokio::test]
async fn test_missing_car_is_retried_up_to_the_bound() {
    let broker = MemoryBroker::new();
    let store = InMemoryRentalStore::seeded(3, 3);
    let writer = Arc::new(FlakyWriter::new(store.clone(), 0));
    broker.push_raw(contract_body(1, 50));

    let mut settings = fast_settings();
    settings.missing_reference_retries = 2;
    let handle = RentalConsumer::new(broker.client(QUEUE), Arc::clone(&writer), settings).spawn();
    wait_until("dead letter", || broker.dead_letters().len() == 1).await;
    handle.shutdown(Duration::from_secs(1)).await.unwrap();

    assert_eq!(writer.calls.load(Ordering::SeqCst), 3);
    assert_eq!(store.rental_count(), 0);
}

#[tokio::test]
async fn test_transient_failure_leaves_missing_reference_retries_intact() {
    let broker = MemoryBroker::new();
    let store = InMemoryRentalStore::seeded(3, 3);
    let writer = Arc::new(FlakyWriter::new(store.clone(), 1));
    broker.push_raw(contract_body(1, 50));

    let handle = RentalConsumer::new(broker.client(QUEUE), Arc::clone(&writer), fast_settings()).spawn();
    wait_until("dead letter", || broker.dead_letters().len() == 1).await;
    handle.shutdown(Duration::from_secs(1)).await.unwrap();

    // one transient failure, then the first try and one retry for the missing car
    assert_eq!(writer.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_missing_reference_stays_queued_without_dead_letter_queue() {
    let broker = MemoryBroker::new().without_dead_letter();
    let store = InMemoryRentalStore::seeded(3, 3);
    let writer = Arc::new(FlakyWriter::new(store.clone(), 0));
    broker.push_raw(contract_body(999_999, 1));

    let mut settings = fast_settings();
    settings.dead_letter = false;
    let handle = RentalConsumer::new(broker.client(QUEUE), Arc::clone(&writer), settings).spawn();
    wait_until("several retries", || writer.calls.load(Ordering::SeqCst) >= 4).await;
    handle.shutdown(Duration::from_secs(1)).await.unwrap();

    assert_eq!(broker.discarded_count(), 0);
    assert!(broker.dead_letters().is_empty());
    assert_eq!(broker.ready_count(), 1);
    assert_eq!(store.rental_count(), 0);
}

#[tokio::test]
async fn test_consumer_reconnects_after_broker_drops_channel() {
    let broker = MemoryBroker::new();
    let store = InMemoryRentalStore::seeded(3, 3);
    broker.push_raw(contract_body(1, 1));

    let handle = RentalConsumer::new(broker.client(QUEUE), store.clone(), fast_settings()).spawn();
    wait_until("first rental", || store.rental_count() == 1).await;
    wait_until("first ack", || broker.acked_count() == 1).await;

    broker.fail_next_connects(2);
    broker.disconnect_all();
    broker.push_raw(contract_body(2, 2));

    wait_until("second rental", || store.rental_count() == 2).await;
    wait_until("consuming again", || handle.state() == ConsumerState::Consuming).await;
    assert_eq!(broker.connect_count(), 2);

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_consumer_gives_up_when_broker_stays_down() {
    let broker = MemoryBroker::new();
    broker.fail_next_connects(100);
    let mut settings = fast_settings();
    settings.retry = RetryPolicy::exponential(2, 1);

    let handle = RentalConsumer::new(broker.client(QUEUE), InMemoryRentalStore::new(), settings).spawn();
    let mut state = handle.state_receiver();
    let result = handle.join().await;

    assert!(matches!(result, Err(ConsumerError::ConnectionFailed(ref e)) if e.is_connection()));
    assert_eq!(*state.borrow_and_update(), ConsumerState::Stopped);
    assert_eq!(broker.connect_count(), 0);
}

#[tokio::test]
async fn test_shutdown_while_connecting_returns_promptly() {
    let broker = MemoryBroker::new();
    broker.fail_next_connects(100);
    let mut settings = fast_settings();
    settings.retry = RetryPolicy::exponential(10, 60_000);

    let handle = RentalConsumer::new(broker.client(QUEUE), InMemoryRentalStore::new(), settings).spawn();
    wait_until("connecting", || handle.state() == ConsumerState::Connecting).await;

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_lets_in_flight_message_finish() {
    let broker = MemoryBroker::new();
    let store = InMemoryRentalStore::seeded(3, 3);
    let writer = SlowWriter {
        store: store.clone(),
        delay: Duration::from_millis(200),
    };
    broker.push_raw(contract_body(1, 1));
    broker.push_raw(contract_body(2, 2));

    let handle = RentalConsumer::new(broker.client(QUEUE), writer, fast_settings()).spawn();
    wait_until("in flight", || broker.unacked_count() == 1).await;

    handle.shutdown(Duration::from_secs(2)).await.unwrap();

    assert_eq!(store.rental_count(), 1);
    assert_eq!(broker.acked_count(), 1);
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.ready_count(), 1);
}

#[tokio::test]
async fn test_shutdown_times_out_on_stuck_write() {
    let broker = MemoryBroker::new();
    let writer = SlowWriter {
        store: InMemoryRentalStore::seeded(1, 1),
        delay: Duration::from_secs(30),
    };
    broker.push_raw(contract_body(1, 1));

    let handle = RentalConsumer::new(broker.client(QUEUE), writer, fast_settings()).spawn();
    wait_until("in flight", || broker.unacked_count() == 1).await;

    let result = handle.shutdown(Duration::from_millis(50)).await;
    assert!(matches!(result, Err(ConsumerError::ShutdownTimedOut(_))));
}

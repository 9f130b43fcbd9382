// src/lib.rs
//! Asynchronous ingestion of rental contracts through a durable RabbitMQ queue.
//!
//! A generator produces synthetic contracts, the producer publishes them and
//! a background consumer turns each one into a persisted rental.

pub mod config;
pub mod consumer;
pub mod contract;
pub mod generation;
pub mod generator;
pub mod producer;
pub mod queue;
pub mod rentals;
pub mod retry;
pub mod shutdown;

pub use config::AppConfig;
pub use consumer::{ConsumerHandle, ConsumerSettings, ConsumerState, RentalConsumer};
pub use contract::{Money, RentalContract};
pub use generation::{generate_and_publish, GenerationResult};
pub use generator::RentalGenerator;
pub use producer::RentalProducer;
pub use rentals::{InMemoryRentalStore, Rental, RentalWriteService, WriteError};

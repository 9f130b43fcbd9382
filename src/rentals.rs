// src/rentals.rs
// Boundary to the rental write path used by the consumer, plus an in-memory store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

use crate::contract::{Money, RentalContract};

/// A persisted rental with its store-assigned identifier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Rental {
    pub id: u64,
    pub client_id: i32,
    pub car_id: i32,
    pub start_time: DateTime<Utc>,
    pub duration_hours: u32,
    pub total_cost: Money,
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("{entity} with id {id} does not exist")]
    NotFound { entity: &'static str, id: i32 },

    #[error("Rental write failed: {0}")]
    Other(String),
}

impl WriteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, WriteError::NotFound { .. })
    }
}

/// Validates references and persists a rental. Not required to deduplicate.
#[async_trait]
pub trait RentalWriteService: Send + Sync {
    async fn create_rental(&self, contract: &RentalContract) -> Result<Rental, WriteError>;
}

#[async_trait]
impl<T: RentalWriteService + ?Sized> RentalWriteService for Arc<T> {
    async fn create_rental(&self, contract: &RentalContract) -> Result<Rental, WriteError> {
        (**self).create_rental(contract).await
    }
}

#[derive(Debug, Default)]
struct StoreState {
    clients: BTreeSet<i32>,
    cars: BTreeSet<i32>,
    rentals: Vec<Rental>,
}

/// Rental store kept in process memory. Clones share state.
#[derive(Clone, Debug, Default)]
pub struct InMemoryRentalStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryRentalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with clients `1..=clients` and cars `1..=cars`.
    pub fn seeded(clients: i32, cars: i32) -> Self {
        let store = Self::new();
        for id in 1..=clients {
            store.add_client(id);
        }
        for id in 1..=cars {
            store.add_car(id);
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_client(&self, id: i32) {
        self.lock().clients.insert(id);
    }

    pub fn add_car(&self, id: i32) {
        self.lock().cars.insert(id);
    }

    pub fn rentals(&self) -> Vec<Rental> {
        self.lock().rentals.clone()
    }

    pub fn rental_count(&self) -> usize {
        self.lock().rentals.len()
    }
}

#[async_trait]
impl RentalWriteService for InMemoryRentalStore {
    async fn create_rental(&self, contract: &RentalContract) -> Result<Rental, WriteError> {
        let mut state = self.lock();

        if !state.clients.contains(&contract.client_id) {
            return Err(WriteError::NotFound {
                entity: "Client",
                id: contract.client_id,
            });
        }
        if !state.cars.contains(&contract.car_id) {
            return Err(WriteError::NotFound {
                entity: "Car",
                id: contract.car_id,
            });
        }

        let id = state.rentals.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        let rental = Rental {
            id,
            client_id: contract.client_id,
            car_id: contract.car_id,
            start_time: contract.start_time,
            duration_hours: contract.duration_hours,
            total_cost: contract.total_cost,
        };
        state.rentals.push(rental.clone());
        debug!(rental_id = id, "Stored rental");
        Ok(rental)
    }
}

// src/generator.rs
use chrono::{TimeDelta, Utc};
use rand::Rng;

use crate::config::GeneratorOptions;
use crate::contract::{Money, RentalContract};

const SECONDS_PER_DAY: i64 = 86_400;

/// Produces synthetic rental contracts with every field drawn independently
/// from the configured ranges. Ranges are assumed valid; see `AppConfig::validate`.
#[derive(Debug, Clone)]
pub struct RentalGenerator {
    options: GeneratorOptions,
}

impl RentalGenerator {
    pub fn new(options: GeneratorOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &GeneratorOptions {
        &self.options
    }

    pub fn generate(&self, count: usize) -> Vec<RentalContract> {
        self.generate_with(&mut rand::rng(), count)
    }

    pub fn generate_with<R: Rng + ?Sized>(&self, rng: &mut R, count: usize) -> Vec<RentalContract> {
        (0..count).map(|_| self.generate_one(rng)).collect()
    }

    fn generate_one<R: Rng + ?Sized>(&self, rng: &mut R) -> RentalContract {
        let opts = &self.options;

        let client_id = rng.random_range(opts.min_client_id..=opts.max_client_id);
        let car_id = rng.random_range(opts.min_car_id..=opts.max_car_id);
        let duration_hours = rng.random_range(opts.min_duration_hours..=opts.max_duration_hours);

        let max_offset = i64::from(opts.max_days_in_past) * SECONDS_PER_DAY;
        let offset = rng.random_range(0..=max_offset);
        let start_time = Utc::now() - TimeDelta::seconds(offset);

        let rate = rng.random_range(opts.min_hourly_rate..=opts.max_hourly_rate);
        let total_cost = Money::saturating_from_f64(f64::from(duration_hours) * rate);

        RentalContract {
            client_id,
            car_id,
            start_time,
            duration_hours,
            total_cost,
        }
    }
}

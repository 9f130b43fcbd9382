// src/contract.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

// 2^63, the first cent value past `i64::MAX`.
const CENTS_LIMIT: f64 = 9_223_372_036_854_775_808.0;

/// A monetary amount with two implied decimal places, stored as whole cents.
///
/// On the wire it is a plain JSON number (`123.45`), which is what the
/// rental write path expects for `TotalCost`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Money {
    cents: i64,
}

impl Money {
    pub const ZERO: Money = Money { cents: 0 };

    pub fn from_cents(cents: i64) -> Self {
        Money { cents }
    }

    /// Rounds to the nearest cent, half away from zero. Fails for NaN,
    /// infinities and amounts whose cent value does not fit in an `i64`.
    pub fn try_from_f64(amount: f64) -> Result<Self, MoneyError> {
        if !amount.is_finite() {
            return Err(MoneyError::NotFinite);
        }
        let cents = (amount * 100.0).round();
        if cents.abs() >= CENTS_LIMIT {
            return Err(MoneyError::OutOfRange(amount));
        }
        Ok(Money {
            cents: cents as i64,
        })
    }

    /// Like [`Money::try_from_f64`] but clamps to the representable range.
    /// NaN becomes zero.
    pub fn saturating_from_f64(amount: f64) -> Self {
        Money::try_from_f64(amount).unwrap_or(if amount.is_nan() {
            Money::ZERO
        } else if amount < 0.0 {
            Money { cents: i64::MIN }
        } else {
            Money { cents: i64::MAX }
        })
    }

    pub fn cents(&self) -> i64 {
        self.cents
    }

    pub fn as_f64(&self) -> f64 {
        self.cents as f64 / 100.0
    }

    pub fn is_negative(&self) -> bool {
        self.cents < 0
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.cents < 0 { "-" } else { "" };
        let abs = self.cents.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

/// Amounts on the wire are never negative. The sign is checked before
/// rounding so sub-cent negatives cannot pass as zero.
impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let amount = f64::deserialize(deserializer)?;
        if amount < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "amount must not be negative, got {}",
                amount
            )));
        }
        Money::try_from_f64(amount).map_err(serde::de::Error::custom)
    }
}

/// A rental intent travelling over the queue. It has no identity until the
/// write service persists it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RentalContract {
    pub client_id: i32,
    pub car_id: i32,
    pub start_time: DateTime<Utc>,
    pub duration_hours: u32,
    pub total_cost: Money,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MoneyError {
    #[error("amount must be a finite number")]
    NotFinite,

    #[error("amount {0} is too large to represent in cents")]
    OutOfRange(f64),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Message body is not a valid rental contract: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("DurationHours must be greater than zero")]
    NonPositiveDuration,

    #[error("TotalCost must not be negative, got {0}")]
    NegativeCost(Money),
}

impl RentalContract {
    /// Serializes the contract to the JSON body published on the queue.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parses a queue body and checks the field invariants. Any failure here
    /// is permanent for that message.
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let contract: RentalContract = serde_json::from_slice(body)?;
        contract.validate()?;
        Ok(contract)
    }

    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.duration_hours == 0 {
            return Err(DecodeError::NonPositiveDuration);
        }
        if self.total_cost.is_negative() {
            return Err(DecodeError::NegativeCost(self.total_cost));
        }
        Ok(())
    }
}

//! Domain models: people, rides, debts and price settings.
//!
//! Field names serialize in camelCase so the persisted JSON matches the shape
//! other clients of the same store read and write.

use crate::decimal::Money;
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A member of the ride group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    /// Stable unique identifier.
    pub id: String,

    /// Display name.
    pub name: String,

    /// Personal price per kilometer, used instead of the group default when
    /// this person drives.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub price_per_km: Option<Decimal>,
}

impl Person {
    /// Creates a person without a personal price override.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Person {
            id: id.into(),
            name: name.into(),
            price_per_km: None,
        }
    }

    /// Builder-style helper to attach a personal price.
    pub fn with_price(mut self, price_per_km: Decimal) -> Self {
        self.price_per_km = Some(price_per_km);
        self
    }

    /// Price this person charges per kilometer when driving.
    pub fn effective_price(&self, default_price_per_km: Decimal) -> Decimal {
        match self.price_per_km {
            Some(price) => price,
            None => default_price_per_km,
        }
    }
}

/// A single shared ride.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ride {
    pub id: String,

    pub driver_id: String,

    /// Everyone in the car except the driver. Order carries no meaning.
    pub passengers: Vec<String>,

    /// Kilometers driven.
    #[serde(with = "rust_decimal::serde::float")]
    pub distance: Decimal,

    pub date: DateTime<Utc>,
}

impl Ride {
    /// Number of people splitting the cost, driver included.
    pub fn share_count(&self) -> usize {
        self.passengers.len() + 1
    }

    /// Returns `true` if the person drove or rode along.
    pub fn involves(&self, person_id: &str) -> bool {
        self.driver_id == person_id || self.passengers.iter().any(|p| p == person_id)
    }
}

/// A directed obligation: `from_user_id` owes `to_user_id` the given amount.
///
/// Used both for raw per-ride debts and for netted settlement payments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Debt {
    pub from_user_id: String,
    pub to_user_id: String,
    pub amount: Money,
}

impl Debt {
    pub fn new(from: impl Into<String>, to: impl Into<String>, amount: Money) -> Self {
        Debt {
            from_user_id: from.into(),
            to_user_id: to.into(),
            amount,
        }
    }
}

/// Group-wide price configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Default price per kilometer for drivers without a personal price.
    #[serde(with = "rust_decimal::serde::float")]
    pub price_per_km: Decimal,

    /// Distance pre-filled for new rides. Not used in any computation.
    #[serde(with = "rust_decimal::serde::float")]
    pub default_distance: Decimal,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            price_per_km: Decimal::ONE,
            default_distance: Decimal::from(30),
        }
    }
}

/// Rejects zero and negative values for distances and prices.
pub fn require_positive(value: Decimal, what: &str) -> Result<Decimal> {
    if value <= Decimal::ZERO {
        return Err(LedgerError::invalid(format!(
            "{} must be greater than 0, got {}",
            what, value
        )));
    }
    Ok(value)
}

/// Raw ride row as read from CSV.
///
/// `passengers` holds ids or names separated by `;`. `date` is optional and
/// defaults to the import time.
#[derive(Debug, Deserialize)]
pub struct RideRecord {
    pub driver: String,

    pub passengers: String,

    pub distance: String,

    #[serde(default)]
    pub date: Option<String>,
}

/// A parsed ride row whose people are still unresolved references.
#[derive(Debug, Clone)]
pub struct ParsedRide {
    pub driver: String,
    pub passengers: Vec<String>,
    pub distance: Decimal,
    pub date: Option<DateTime<Utc>>,
}

impl RideRecord {
    /// Parses the raw CSV record into a typed ride.
    pub fn parse(&self) -> Result<ParsedRide> {
        let driver = self.driver.trim();
        if driver.is_empty() {
            return Err(LedgerError::invalid("missing driver"));
        }

        let passengers: Vec<String> = self
            .passengers
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();

        let distance = Decimal::from_str(self.distance.trim())
            .map_err(|e| LedgerError::invalid(format!("bad distance {:?}: {}", self.distance, e)))?;

        let date = match self.date.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| LedgerError::invalid(format!("bad date {:?}: {}", raw, e)))?
                    .with_timezone(&Utc),
            ),
        };

        Ok(ParsedRide {
            driver: driver.to_string(),
            passengers,
            distance,
            date,
        })
    }
}

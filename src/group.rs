//! The group's persisted state and the roster/ride mutations on it.
//!
//! `GroupState` is a plain value: callers load it, mutate it, and hand it back
//! to a store. Every mutation validates its input up front so that nothing
//! invalid ever reaches the ledger.

use crate::error::{LedgerError, Result};
use crate::model::{require_positive, Person, Ride, Settings};
use chrono::{DateTime, Utc};
use log::info;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Snapshot of everything the group persists.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupState {
    /// Bumped by the store on every successful write.
    #[serde(default)]
    pub revision: u64,

    #[serde(default)]
    pub users: Vec<Person>,

    /// Active rides, counted toward the next settlement.
    #[serde(default)]
    pub rides: Vec<Ride>,

    /// Rides already settled.
    #[serde(default)]
    pub historic_rides: Vec<Ride>,

    #[serde(default)]
    pub settings: Settings,
}

impl GroupState {
    /// Creates an empty group with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks a person up by id.
    pub fn person(&self, id: &str) -> Result<&Person> {
        self.users
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| LedgerError::PersonNotFound(id.to_string()))
    }

    /// Resolves a reference that is either an id or an exact display name.
    pub fn resolve_person(&self, reference: &str) -> Result<&Person> {
        let reference = reference.trim();
        self.users
            .iter()
            .find(|p| p.id == reference)
            .or_else(|| self.users.iter().find(|p| p.name == reference))
            .ok_or_else(|| LedgerError::PersonNotFound(reference.to_string()))
    }

    /// Display name for an id, falling back to the id itself.
    pub fn display_name<'a>(&'a self, id: &'a str) -> &'a str {
        self.users
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.name.as_str())
            .unwrap_or(id)
    }

    /// Registers a new person and returns their id.
    pub fn add_person(&mut self, name: &str) -> Result<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(LedgerError::invalid("name must not be empty"));
        }

        let person = Person::new(Uuid::new_v4().to_string(), name);
        let id = person.id.clone();
        self.users.push(person);
        info!("{} joined the ride group", name);
        Ok(id)
    }

    /// Removes a person and every trace of them.
    ///
    /// Rides they drove are dropped, they are taken off passenger lists, and
    /// rides left with nobody to share the cost are dropped as well. This
    /// applies to active and settled rides alike.
    pub fn remove_person(&mut self, id: &str) -> Result<Person> {
        let index = self
            .users
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| LedgerError::PersonNotFound(id.to_string()))?;
        let removed = self.users.remove(index);

        for rides in [&mut self.rides, &mut self.historic_rides] {
            rides.retain(|r| r.driver_id != id);
            for ride in rides.iter_mut() {
                ride.passengers.retain(|p| p != id);
            }
            rides.retain(|r| !r.passengers.is_empty());
        }

        info!("{} has been removed from the group", removed.name);
        Ok(removed)
    }

    /// Sets or clears a person's personal price per kilometer.
    pub fn set_person_price(&mut self, id: &str, price_per_km: Option<Decimal>) -> Result<()> {
        let price = price_per_km
            .map(|p| require_positive(p, "price per km"))
            .transpose()?;

        let person = self
            .users
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| LedgerError::PersonNotFound(id.to_string()))?;
        person.price_per_km = price;
        Ok(())
    }

    /// Sets the group default price per kilometer.
    pub fn set_price_per_km(&mut self, price: Decimal) -> Result<()> {
        self.settings.price_per_km = require_positive(price, "price per km")?;
        Ok(())
    }

    /// Sets the distance pre-filled for new rides.
    pub fn set_default_distance(&mut self, distance: Decimal) -> Result<()> {
        self.settings.default_distance = require_positive(distance, "default distance")?;
        Ok(())
    }

    /// Validates and records a new active ride, returning its id.
    pub fn add_ride(
        &mut self,
        driver_id: &str,
        passengers: &[String],
        distance: Decimal,
        date: DateTime<Utc>,
    ) -> Result<String> {
        self.person(driver_id)?;

        if passengers.is_empty() {
            return Err(LedgerError::invalid("a ride needs at least one passenger"));
        }

        let mut seen = HashSet::new();
        for passenger in passengers {
            if passenger == driver_id {
                return Err(LedgerError::invalid("the driver cannot also be a passenger"));
            }
            if !seen.insert(passenger.as_str()) {
                return Err(LedgerError::invalid(format!(
                    "passenger {} listed twice",
                    passenger
                )));
            }
            self.person(passenger)?;
        }

        let distance = require_positive(distance, "distance")?;

        let ride = Ride {
            id: Uuid::new_v4().to_string(),
            driver_id: driver_id.to_string(),
            passengers: passengers.to_vec(),
            distance,
            date,
        };
        let id = ride.id.clone();
        self.rides.push(ride);
        Ok(id)
    }

    /// Active rides, newest first.
    pub fn sorted_rides(&self) -> Vec<&Ride> {
        newest_first(&self.rides)
    }

    /// Settled rides, newest first.
    pub fn sorted_archive(&self) -> Vec<&Ride> {
        newest_first(&self.historic_rides)
    }

    /// Number of active rides the person took part in.
    pub fn ride_count_for(&self, person_id: &str) -> usize {
        self.rides.iter().filter(|r| r.involves(person_id)).count()
    }

    /// Total kilometers across active rides.
    pub fn total_distance(&self) -> Decimal {
        self.rides.iter().map(|r| r.distance).sum()
    }
}

fn newest_first(rides: &[Ride]) -> Vec<&Ride> {
    let mut sorted: Vec<&Ride> = rides.iter().collect();
    sorted.sort_by(|a, b| b.date.cmp(&a.date));
    sorted
}

//! Ledger builder: turns a ride log into raw per-ride debts.
//!
//! Each passenger owes the driver an equal share of the ride's cost; the driver
//! keeps their own share, so no debt is emitted for it.

use crate::decimal::Money;
use crate::error::{LedgerError, Result};
use crate::model::{require_positive, Debt, Person, Ride};
use log::debug;
use rust_decimal::Decimal;

/// Price per kilometer the ride's driver charges.
///
/// A driver absent from the roster falls back to the group default.
pub fn effective_price(ride: &Ride, people: &[Person], default_price_per_km: Decimal) -> Decimal {
    people
        .iter()
        .find(|p| p.id == ride.driver_id)
        .map(|driver| driver.effective_price(default_price_per_km))
        .unwrap_or(default_price_per_km)
}

/// Each participant's share of a ride, rounded to cents.
///
/// Fails with [`LedgerError::InvalidInput`] when the cost does not fit in a
/// `Decimal`.
pub fn per_person_share(ride: &Ride, price_per_km: Decimal) -> Result<Money> {
    ride.distance
        .checked_mul(price_per_km)
        .and_then(|total_cost| total_cost.checked_div(Decimal::from(ride.share_count())))
        .map(Money::new)
        .ok_or_else(|| {
            LedgerError::invalid(format!(
                "ride {}: {} km at {}/km is out of range",
                ride.id, ride.distance, price_per_km
            ))
        })
}

/// Rejects a ride that could not have passed [`GroupState::add_ride`], e.g.
/// one written by another client of the shared store.
///
/// [`GroupState::add_ride`]: crate::group::GroupState::add_ride
fn check_ride(ride: &Ride, price_per_km: Decimal) -> Result<()> {
    if ride.passengers.is_empty() {
        return Err(LedgerError::invalid(format!(
            "ride {} has no passengers",
            ride.id
        )));
    }
    if ride.passengers.contains(&ride.driver_id) {
        return Err(LedgerError::invalid(format!(
            "ride {}: driver {} is also listed as a passenger",
            ride.id, ride.driver_id
        )));
    }
    require_positive(ride.distance, &format!("ride {} distance", ride.id))?;
    require_positive(price_per_km, &format!("ride {} price per km", ride.id))?;
    Ok(())
}

/// Computes one raw debt per (passenger, ride), in ride order then passenger order.
///
/// A ride so short that the share rounds to zero cents produces no debts.
///
/// Rides that break the ride invariants (no passengers, the driver riding
/// along, a non-positive distance or price) are rejected, not skipped.
pub fn compute_raw_debts(
    rides: &[Ride],
    people: &[Person],
    default_price_per_km: Decimal,
) -> Result<Vec<Debt>> {
    let mut raw_debts = Vec::with_capacity(rides.iter().map(|r| r.passengers.len()).sum());

    for ride in rides {
        let price = effective_price(ride, people, default_price_per_km);
        check_ride(ride, price)?;
        let share = per_person_share(ride, price)?;

        debug!(
            "Ride {}: {} km at {}/km split {} ways, {} each",
            ride.id,
            ride.distance,
            price,
            ride.share_count(),
            share
        );

        if share.is_zero() {
            debug!("Ride {}: share rounds to zero, no debts", ride.id);
            continue;
        }

        for passenger in &ride.passengers {
            raw_debts.push(Debt::new(passenger.clone(), ride.driver_id.clone(), share));
        }
    }

    Ok(raw_debts)
}

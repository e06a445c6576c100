//! Lifecycle controller: computes debts over the active rides and moves rides
//! between the active and settled collections.
//!
//! Computed debts are only ever the result of the most recent computation.
//! Any change to rides, prices or the roster throws them away.

use crate::decimal::Money;
use crate::error::{LedgerError, Result};
use crate::group::GroupState;
use crate::ledger::compute_raw_debts;
use crate::model::{Debt, RideRecord};
use crate::settlement::{net_balances, settle_balances, Balance};
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, Trim};
use log::{debug, info, warn};
use rust_decimal::Decimal;
use std::io::{Read, Write};

/// Where the group stands relative to its next settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Active rides may exist, no debts computed.
    Unsettled,

    /// Debts reflect the current active rides.
    Computed,

    /// Active rides were just archived and debts cleared.
    Settled,
}

/// Owns one group snapshot plus the transient debt computation over it.
///
/// # Ownership
///
/// The snapshot goes in through [`Lifecycle::new`] and comes back out through
/// [`Lifecycle::into_state`]; persisting it is the caller's job.
#[derive(Debug)]
pub struct Lifecycle {
    state: GroupState,
    raw_debts: Vec<Debt>,
    balances: Vec<Balance>,
    debts: Vec<Debt>,
    phase: Phase,
}

impl Lifecycle {
    /// Wraps a loaded snapshot. Nothing is computed yet.
    pub fn new(state: GroupState) -> Self {
        Lifecycle {
            state,
            raw_debts: Vec::new(),
            balances: Vec::new(),
            debts: Vec::new(),
            phase: Phase::Unsettled,
        }
    }

    pub fn state(&self) -> &GroupState {
        &self.state
    }

    /// Hands the snapshot back for persisting.
    pub fn into_state(self) -> GroupState {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Per-ride debts from the last computation.
    pub fn raw_debts(&self) -> &[Debt] {
        &self.raw_debts
    }

    /// Settlement payments from the last computation.
    pub fn debts(&self) -> &[Debt] {
        &self.debts
    }

    /// Net balances from the last computation, in roster order.
    pub fn balances(&self) -> &[Balance] {
        &self.balances
    }

    fn invalidate(&mut self) {
        if self.phase == Phase::Computed {
            debug!("Discarding computed debts");
        }
        self.raw_debts.clear();
        self.balances.clear();
        self.debts.clear();
        self.phase = Phase::Unsettled;
    }

    /// Recomputes raw and settlement debts from the active rides.
    ///
    /// Fails with [`LedgerError::NoActiveRides`] when there is nothing to
    /// compute; callers treat that as a no-op.
    pub fn recompute(&mut self) -> Result<&[Debt]> {
        self.invalidate();

        if self.state.rides.is_empty() {
            return Err(LedgerError::NoActiveRides);
        }

        let raw = compute_raw_debts(
            &self.state.rides,
            &self.state.users,
            self.state.settings.price_per_km,
        )?;
        let balances = net_balances(&raw, &self.state.users)?;
        let debts = settle_balances(&balances);

        info!(
            "Computed {} payments from {} raw debts over {} rides",
            debts.len(),
            raw.len(),
            self.state.rides.len()
        );

        self.raw_debts = raw;
        self.balances = balances;
        self.debts = debts;
        self.phase = Phase::Computed;
        Ok(self.debts.as_slice())
    }

    /// Archives every active ride and clears the debts.
    ///
    /// Requires a computation with at least one payment; otherwise fails with
    /// [`LedgerError::NothingToSettle`]. Returns the number of rides archived.
    pub fn confirm_settlement(&mut self) -> Result<usize> {
        if self.phase != Phase::Computed || self.debts.is_empty() {
            return Err(LedgerError::NothingToSettle);
        }

        let settled = self.state.rides.len();
        let rides = std::mem::take(&mut self.state.rides);
        self.state.historic_rides.extend(rides);

        self.invalidate();
        self.phase = Phase::Settled;

        info!("All debts have been settled, {} rides archived", settled);
        Ok(settled)
    }

    /// Moves one settled ride back to the active set.
    pub fn reverse_settlement(&mut self, ride_id: &str) -> Result<()> {
        let index = self
            .state
            .historic_rides
            .iter()
            .position(|r| r.id == ride_id)
            .ok_or_else(|| LedgerError::RideNotFound(ride_id.to_string()))?;

        let ride = self.state.historic_rides.remove(index);
        self.state.rides.push(ride);
        self.invalidate();

        info!("Ride {} moved back to active", ride_id);
        Ok(())
    }

    /// Registers a person. See [`GroupState::add_person`].
    pub fn add_person(&mut self, name: &str) -> Result<String> {
        let id = self.state.add_person(name)?;
        self.invalidate();
        Ok(id)
    }

    /// Removes a person with cascade. See [`GroupState::remove_person`].
    pub fn remove_person(&mut self, id: &str) -> Result<()> {
        self.state.remove_person(id)?;
        self.invalidate();
        Ok(())
    }

    pub fn set_person_price(&mut self, id: &str, price_per_km: Option<Decimal>) -> Result<()> {
        self.state.set_person_price(id, price_per_km)?;
        self.invalidate();
        Ok(())
    }

    pub fn set_price_per_km(&mut self, price: Decimal) -> Result<()> {
        self.state.set_price_per_km(price)?;
        self.invalidate();
        Ok(())
    }

    pub fn set_default_distance(&mut self, distance: Decimal) -> Result<()> {
        self.state.set_default_distance(distance)?;
        self.invalidate();
        Ok(())
    }

    /// Records an active ride. See [`GroupState::add_ride`].
    pub fn add_ride(
        &mut self,
        driver_id: &str,
        passengers: &[String],
        distance: Decimal,
        date: DateTime<Utc>,
    ) -> Result<String> {
        let id = self.state.add_ride(driver_id, passengers, distance, date)?;
        self.invalidate();
        Ok(id)
    }

    /// Imports rides from CSV in streaming fashion.
    ///
    /// Expects a `driver,passengers,distance[,date]` header. People may be
    /// given by id or name. Invalid rows are logged at warn level and skipped.
    /// Returns the number of rides added.
    pub fn process_csv<R: Read>(&mut self, reader: R) -> Result<usize> {
        let mut csv_reader = ReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .from_reader(reader);

        let mut added = 0;
        for (row_idx, result) in csv_reader.deserialize::<RideRecord>().enumerate() {
            let row_num = row_idx + 2; // 1-indexed, accounting for header row

            match result {
                Ok(record) => match self.import_record(&record) {
                    Ok(ride_id) => {
                        debug!("Row {}: Added ride {}", row_num, ride_id);
                        added += 1;
                    }
                    Err(e) => warn!("Row {}: {}", row_num, e),
                },
                Err(e) => {
                    warn!("Row {}: CSV parse error: {}", row_num, e);
                }
            }
        }

        if added > 0 {
            self.invalidate();
        }
        Ok(added)
    }

    fn import_record(&mut self, record: &RideRecord) -> Result<String> {
        let parsed = record.parse()?;

        let driver = self.state.resolve_person(&parsed.driver)?.id.clone();
        let passengers = parsed
            .passengers
            .iter()
            .map(|p| self.state.resolve_person(p).map(|person| person.id.clone()))
            .collect::<Result<Vec<_>>>()?;

        self.state.add_ride(
            &driver,
            &passengers,
            parsed.distance,
            parsed.date.unwrap_or_else(Utc::now),
        )
    }

    /// Writes the settlement payments as CSV with display names.
    pub fn write_debts<W: Write>(&self, writer: W) -> Result<()> {
        write_debts_csv(writer, &self.state, &self.debts)
    }

    /// Writes the per-ride debts as CSV with display names.
    pub fn write_raw_debts<W: Write>(&self, writer: W) -> Result<()> {
        write_debts_csv(writer, &self.state, &self.raw_debts)
    }

    /// Writes each person's net balance as CSV, in roster order.
    pub fn write_balances<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record(["person", "balance"])?;
        for balance in self.balances() {
            csv_writer.write_record([
                self.state.display_name(&balance.person_id),
                balance.amount.to_string().as_str(),
            ])?;
        }

        csv_writer.flush()?;
        Ok(())
    }

    /// Sum of all settlement payments.
    pub fn total_to_settle(&self) -> Money {
        self.debts.iter().map(|d| d.amount).sum()
    }
}

/// Writes `debts` as `from,to,amount` CSV, naming people as `state` knows them.
pub fn write_debts_csv<W: Write>(writer: W, state: &GroupState, debts: &[Debt]) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);

    csv_writer.write_record(["from", "to", "amount"])?;
    for debt in debts {
        csv_writer.write_record([
            state.display_name(&debt.from_user_id),
            state.display_name(&debt.to_user_id),
            debt.amount.to_string().as_str(),
        ])?;
    }

    csv_writer.flush()?;
    Ok(())
}

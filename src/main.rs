//! Ride-Share Ledger CLI
//!
//! Keeps the group in a JSON file and prints results as CSV on stdout.
//!
//! # Usage
//!
//! ```bash
//! rideshare-ledger add-person Dana
//! rideshare-ledger add-ride --driver Dana --passenger Avi --passenger Ben --distance 30
//! rideshare-ledger debts
//! rideshare-ledger settle
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Set to `debug` or `warn` to control logging verbosity
//! - `RIDESHARE_STATE`, `RIDESHARE_RETRIES`, `RIDESHARE_BACKOFF_MS`,
//!   `RIDESHARE_STALE_LOCK_SECS`: see `--help`

use chrono::Utc;
use clap::{Parser, Subcommand};
use rideshare_ledger::lifecycle::write_debts_csv;
use rideshare_ledger::{
    update, CachingStore, GroupState, JsonFileStore, Lifecycle, Result, RetryPolicy, StateStore,
};
use rust_decimal::Decimal;
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "rideshare-ledger", version, about = "Split ride costs and settle up")]
struct Cli {
    /// JSON file holding the group
    #[arg(long, env = "RIDESHARE_STATE", default_value = "rideShareData.json")]
    state: PathBuf,

    /// Attempts for a write that loses a race with another writer
    #[arg(long, env = "RIDESHARE_RETRIES", default_value_t = 3)]
    retries: u32,

    /// Base backoff between attempts, doubled each time
    #[arg(long, env = "RIDESHARE_BACKOFF_MS", default_value_t = 50)]
    backoff_ms: u64,

    /// Age after which a leftover lock file is treated as abandoned
    #[arg(long, env = "RIDESHARE_STALE_LOCK_SECS", default_value_t = 30)]
    stale_lock_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register a person
    AddPerson { name: String },

    /// Remove a person along with their rides
    RemovePerson { person: String },

    /// Set the group's default price per km
    SetPrice { price: Decimal },

    /// Set a driver's own price per km; omit the price to clear it
    SetPersonPrice { person: String, price: Option<Decimal> },

    /// Set the distance used when a ride is added without one
    SetDistance { distance: Decimal },

    /// Record a ride
    AddRide {
        #[arg(long)]
        driver: String,

        #[arg(long = "passenger", required = true)]
        passengers: Vec<String>,

        /// Kilometers; defaults to the group's default distance
        #[arg(long)]
        distance: Option<Decimal>,
    },

    /// Import rides from a `driver,passengers,distance[,date]` CSV file
    Import { file: PathBuf },

    /// List the roster
    People,

    /// List rides, newest first
    Rides {
        /// Show settled rides instead of active ones
        #[arg(long)]
        archived: bool,
    },

    /// Compute what everyone owes for the active rides
    Debts {
        /// Print per-ride debts instead of settlement payments
        #[arg(long, conflicts_with = "balances")]
        raw: bool,

        /// Print net balances instead of settlement payments
        #[arg(long)]
        balances: bool,
    },

    /// Settle up: archive the active rides and print the payments
    Settle,

    /// Move a settled ride back to the active rides
    Unsettle { ride_id: String },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => {}
        Err(e) if e.is_recoverable_noop() => eprintln!("{}", e),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let policy = RetryPolicy::new(cli.retries, Duration::from_millis(cli.backoff_ms));
    let store = CachingStore::new(
        JsonFileStore::with_lock_policy(&cli.state, policy.clone())
            .with_stale_lock_after(Duration::from_secs(cli.stale_lock_secs)),
    );

    let stdout = io::stdout();
    let mut out = stdout.lock();

    match cli.command {
        Command::AddPerson { name } => {
            let (id, _) = update(&store, &policy, |l| l.add_person(&name))?;
            writeln!(out, "{}", id)?;
        }
        Command::RemovePerson { person } => {
            update(&store, &policy, |l| {
                let id = l.state().resolve_person(&person)?.id.clone();
                l.remove_person(&id)
            })?;
        }
        Command::SetPrice { price } => {
            update(&store, &policy, |l| l.set_price_per_km(price))?;
        }
        Command::SetPersonPrice { person, price } => {
            update(&store, &policy, |l| {
                let id = l.state().resolve_person(&person)?.id.clone();
                l.set_person_price(&id, price)
            })?;
        }
        Command::SetDistance { distance } => {
            update(&store, &policy, |l| l.set_default_distance(distance))?;
        }
        Command::AddRide {
            driver,
            passengers,
            distance,
        } => {
            let (id, _) = update(&store, &policy, |l| {
                let state = l.state();
                let driver_id = state.resolve_person(&driver)?.id.clone();
                let passenger_ids = passengers
                    .iter()
                    .map(|p| state.resolve_person(p).map(|person| person.id.clone()))
                    .collect::<Result<Vec<_>>>()?;
                let distance = distance.unwrap_or(state.settings.default_distance);
                l.add_ride(&driver_id, &passenger_ids, distance, Utc::now())
            })?;
            writeln!(out, "{}", id)?;
        }
        Command::Import { file } => {
            let (added, _) = update(&store, &policy, |l| {
                let reader = BufReader::new(File::open(&file)?);
                l.process_csv(reader)
            })?;
            writeln!(out, "Imported {} rides", added)?;
        }
        Command::People => write_people(&mut out, &store.load()?)?,
        Command::Rides { archived } => write_rides(&mut out, &store.load()?, archived)?,
        Command::Debts { raw, balances } => {
            let mut lifecycle = Lifecycle::new(store.load()?);
            lifecycle.recompute()?;
            if raw {
                lifecycle.write_raw_debts(&mut out)?;
            } else if balances {
                lifecycle.write_balances(&mut out)?;
            } else {
                lifecycle.write_debts(&mut out)?;
            }
        }
        Command::Settle => {
            let ((debts, settled), state) = update(&store, &policy, |l| {
                l.recompute()?;
                let debts = l.debts().to_vec();
                let settled = l.confirm_settlement()?;
                Ok((debts, settled))
            })?;
            write_debts_csv(&mut out, &state, &debts)?;
            eprintln!("Settled {} rides", settled);
        }
        Command::Unsettle { ride_id } => {
            update(&store, &policy, |l| l.reverse_settlement(&ride_id))?;
        }
    }

    out.flush()?;
    Ok(())
}

fn write_people<W: Write>(out: W, state: &GroupState) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(out);

    csv_writer.write_record(["id", "name", "price_per_km", "active_rides"])?;
    for person in &state.users {
        csv_writer.write_record([
            person.id.clone(),
            person.name.clone(),
            person
                .price_per_km
                .map(|p| p.to_string())
                .unwrap_or_default(),
            state.ride_count_for(&person.id).to_string(),
        ])?;
    }

    csv_writer.flush()?;
    Ok(())
}

fn write_rides<W: Write>(out: W, state: &GroupState, archived: bool) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(out);
    let rides = if archived {
        state.sorted_archive()
    } else {
        state.sorted_rides()
    };

    csv_writer.write_record(["id", "date", "driver", "passengers", "distance"])?;
    for ride in rides {
        let passengers: Vec<&str> = ride
            .passengers
            .iter()
            .map(|p| state.display_name(p))
            .collect();
        csv_writer.write_record([
            ride.id.clone(),
            ride.date.to_rfc3339(),
            state.display_name(&ride.driver_id).to_string(),
            passengers.join(";"),
            ride.distance.to_string(),
        ])?;
    }

    csv_writer.flush()?;
    Ok(())
}

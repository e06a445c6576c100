//! # Ride-Share Ledger
//!
//! Tracks shared-ride costs within a small group and settles who owes whom.
//!
//! ## Design Principles
//!
//! - **Fixed-point arithmetic**: Money uses 2 decimal places via `rust_decimal`
//! - **Pure computation**: raw debts and settlements are functions of their inputs
//! - **Explicit state**: the group snapshot is a value callers load, change and save
//! - **Deterministic output**: results follow roster and ride order only
//!
//! ## Pipeline
//!
//! [`ledger::compute_raw_debts`] splits each ride's cost among the people in
//! the car; [`settlement::simplify`] nets those per person and matches debtors
//! to creditors; [`Lifecycle`] runs both over the active rides and archives
//! them once the group settles up.
//!
//! ## Example
//!
//! ```
//! use rideshare_ledger::{GroupState, Lifecycle};
//! use rust_decimal::Decimal;
//!
//! let mut lifecycle = Lifecycle::new(GroupState::new());
//! let dana = lifecycle.add_person("Dana").unwrap();
//! let avi = lifecycle.add_person("Avi").unwrap();
//! lifecycle
//!     .add_ride(&dana, &[avi], Decimal::from(30), chrono::Utc::now())
//!     .unwrap();
//!
//! let debts = lifecycle.recompute().unwrap();
//! assert_eq!(debts[0].amount.to_string(), "15.00");
//! ```

pub mod decimal;
pub mod error;
pub mod group;
pub mod ledger;
pub mod lifecycle;
pub mod model;
pub mod settlement;
pub mod store;

pub use decimal::Money;
pub use error::{LedgerError, Result};
pub use group::GroupState;
pub use ledger::compute_raw_debts;
pub use lifecycle::{Lifecycle, Phase};
pub use model::{Debt, Person, Ride, RideRecord, Settings};
pub use settlement::{net_balances, settle_balances, simplify, Balance};
pub use store::{update, CachingStore, JsonFileStore, MemoryStore, RetryPolicy, StateStore};

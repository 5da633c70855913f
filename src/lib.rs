//! Remédio: offline cache and medication-reminder worker.
//!
//! This crate is the background half of a medication-tracking web app. It
//! runs beside the foreground UI and:
//!
//! - **Caches** the app shell and API responses in versioned generations so
//!   the app keeps working offline ([`cache`]).
//! - **Schedules** medication reminders and fires them as notifications with
//!   "taken" and "snooze" actions, even while the UI is closed ([`alarms`]).
//! - **Routes** messages between app instances and the worker ([`host`]).
//!
//! [`worker::Worker`] owns one instance of each component. Hosts that run the
//! worker out of process talk to it through the `remedio-host` binary.

pub mod alarms;
pub mod cache;
pub mod config;
pub mod error;
pub mod host;
pub mod worker;

pub use config::WorkerConfig;
pub use error::{Result, WorkerError};
pub use worker::Worker;

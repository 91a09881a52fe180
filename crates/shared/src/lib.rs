#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Membra shared infrastructure
//!
//! Database pool construction, embedded migrations and tracing setup used by
//! both the API server and the background worker.

pub mod db;
pub mod telemetry;

pub use db::{create_pool, run_migrations, DbConfig};
pub use telemetry::{init_tracing, LogFormat};

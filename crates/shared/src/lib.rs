//! Shared infrastructure for the billsync workspace.

pub mod db;

pub use db::{create_pool, run_migrations};

//! Postgres persistence for the job queue.

pub mod postgres;

#[cfg(test)]
mod integration_tests;

pub use postgres::PostgresJobStore;

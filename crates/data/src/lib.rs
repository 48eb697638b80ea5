//! `PostgreSQL` persistence for the lifecycle engine.
//!
//! This crate provides:
//! - Database client with retry-on-connect and pooled connections
//! - The Postgres ledger store backing live runs
//! - Audit repositories for regime and breaker history

pub mod audit;
pub mod database;
pub mod store;

pub use audit::{BreakerAuditRepository, RegimeAuditRepository};
pub use database::DatabaseClient;
pub use store::PgStore;

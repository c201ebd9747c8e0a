//! Persistence implementations

pub mod memory;
#[cfg(feature = "postgres")]
pub mod database;
#[cfg(feature = "postgres")]
pub mod call_repository;

pub use memory::{HealthLogEntry, InMemoryCallRepository};
#[cfg(feature = "postgres")]
pub use database::{create_pool, run_migrations, DatabaseConfig};
#[cfg(feature = "postgres")]
pub use call_repository::PgCallRepository;

//! Infrastructure layer: configuration and the allocation store adapters.
//!
//! - [`config`]: environment-driven settings (`.env` aware).
//! - [`memory`]: in-process store for tests and local runs.
//! - [`postgres`]: the SQLx/Postgres store.

pub mod config;
pub mod error;
pub mod memory;
pub mod postgres;

pub use config::{AllocationConfig, ConfigError};
pub use error::StoreError;
pub use memory::{InMemoryAllocationStore, MemoryUnitOfWork};
pub use postgres::{PgAllocationStore, PgUnitOfWork};

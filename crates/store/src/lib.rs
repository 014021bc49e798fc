//! Repository contracts for the billing core plus an in-memory DashMap
//! implementation.
//!
//! The contracts are what the services program against; `MemoryStore`
//! provides the same API surface for development and testing. Production:
//! replace with PostgreSQL (sqlx) behind the same traits.

pub mod contracts;
pub mod memory;

pub use memory::MemoryStore;

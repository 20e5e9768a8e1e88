//! Kiln Store
//!
//! Persistence of training jobs, their epoch history, model status and
//! deployment attempts behind the [`JobStore`] trait, with SQLite and
//! in-memory implementations.

// SQL strings don't need hash-less raw strings
#![allow(clippy::needless_raw_string_hashes)]

pub mod database;
pub mod error;
pub mod memory;
pub mod sqlite;
pub mod store;

pub use database::Database;
pub use error::{StoreError, StoreResult};
pub use memory::InMemoryJobStore;
pub use sqlite::SqliteJobStore;
pub use store::{JobStore, JobStores};

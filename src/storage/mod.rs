//! Durable key-value storage for persisted cache state.
//!
//! - SQLite is the primary engine, with a per-entry write-time index
//! - A single JSON file is the fallback when SQLite can't be opened
//! - All failures are contained by [`DurableStore`]; callers never see them

mod durable;
mod file;
mod sqlite;
mod traits;

pub use durable::{DurableStore, StoreLocation};
pub use file::JsonFileEngine;
pub use sqlite::SqliteEngine;
pub use traits::{NoopEngine, StorageEngine};

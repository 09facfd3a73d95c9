//! SQLite persistence for the key/value storage port.

pub mod database;
pub mod error;
pub mod kv;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
pub use kv::SqliteKvStore;

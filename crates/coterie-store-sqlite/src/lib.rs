//! SQLite backend for the Coterie membership engine.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated
//! thread without blocking the async runtime. Every
//! [`coterie_core::store::MembershipStore::transact`] call is one SQLite
//! transaction.

mod encode;
mod query;
mod schema;
mod store;

pub mod error;
pub mod settings;

pub use error::{Error, Result};
pub use settings::StoreSettings;
pub use store::SqliteStore;

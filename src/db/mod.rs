//! Database module: entity models, SQL repositories and the listing store.
//!
//! This module is split into three submodules:
//! - `model`: organization and session rows that only the database layer owns.
//! - `repo`: SQL-only functions that map rows into entities.
//! - `store`: the `ListingStore` implementation the sync driver writes through.
//!
//! External modules should import from `gbp_sync::db`; the repository API and
//! the row models are re-exported here.

pub mod model;
pub mod repo;
pub mod store;

pub use repo::*;

pub use model::{Organization, Session};
pub use store::SqliteListingStore;

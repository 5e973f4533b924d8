//! Database module: view models and SQL repositories.
//!
//! - `model`: query-shaped structs that don't belong to the domain layer.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! Callers import from `immo_watch::db`; the repository API is re-exported
//! here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{ResultFilter, SearchSummary};

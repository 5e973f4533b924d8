//! View models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use crate::model::{Acceptance, Search};

/// Per-search counters used by `searches list`.
#[derive(Debug, Clone)]
pub struct SearchSummary {
    pub search: Search,
    pub results: i64,
    pub alive: i64,
    pub undecided: i64,
}

/// Narrowing applied by `list_results`. The default returns everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultFilter {
    pub alive_only: bool,
    pub acceptance: Option<Acceptance>,
}

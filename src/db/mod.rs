//! Storage module for UpsWatch.
//!
//! Model types, the SQLite sample store, and on-demand aggregation.

mod metrics;
mod models;
mod store;

pub use metrics::*;
pub use models::*;
pub use store::*;

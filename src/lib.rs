pub mod api;
pub mod config;
pub mod error;
pub mod observability;
pub mod price_infra;
pub mod types;
pub mod utils;

pub use error::{Error, OracleError, Result};
pub use price_infra::{AggregateRequest, CancelSignal, FeedAdapter, OracleService, OracleServiceBuilder};

pub mod metrics;
pub mod tracing;

pub use metrics::register_metrics;
pub use self::tracing::init_tracing;

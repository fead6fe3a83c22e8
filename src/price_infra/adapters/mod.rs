pub mod fixed;
pub mod mock;

use async_trait::async_trait;
use crate::error::Result;
use crate::price_infra::FetchContext;
use crate::types::ids::FeedId;
use crate::types::observation::Observation;

pub use fixed::FixedPriceAdapter;
pub use mock::{MockAdapter, MockResponse};

/// One external price provider.
///
/// Implementations should give up once `ctx.deadline` passes or
/// `ctx.cancel` fires; the service also drops the future at that point.
/// Transport failures and timeouts are reported as `Error::Network` or
/// `Error::Timeout`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeedAdapter: Send + Sync {
    fn source_name(&self) -> &str;
    async fn fetch(&self, ctx: &FetchContext, feed_id: &FeedId) -> Result<Observation>;
}

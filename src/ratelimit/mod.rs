//! Rate-limiting algorithms and the public limiter contract.

mod cache;
mod limiter;
pub mod metrics;
mod sliding_window;
mod token_bucket;

pub use cache::DecisionCache;
pub use limiter::{build, Algorithm, RateLimiter};
pub use metrics::{InMemoryMetrics, MetricsSink, OperationTiming};
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;

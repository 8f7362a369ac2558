pub mod jobs;
pub mod limiter;
pub mod tokens;

pub use limiter::{LimitDecision, Limiter, SlidingWindowLimiter};
pub use tokens::{fingerprint, Identity, InMemoryTokenStore, PostgresTokenStore, TokenStore};

//! Resource limits: parser subprocess concurrency, parse timeouts and LLM
//! request/token budgets.

pub mod rate_limiter;
pub mod subprocess;

pub use rate_limiter::{estimate_tokens, LlmRateLimiter, TokenBucket};
pub use subprocess::SubprocessLimiter;

//! Session runtime for conversational agents.

pub mod agent;
pub mod cli;
pub mod config;
pub mod conversation;
pub mod coordinator;
pub mod pool;
pub mod ratelimit;
pub mod router;
pub mod stream;
pub mod tokens;

pub use session_runtime_error::{ErrorType, ProblemDetails, RateLimitScope, RuntimeError};

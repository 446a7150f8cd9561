//! # Error Handling Framework
//!
//! Error taxonomy and resilience primitives shared by every crate of the
//! diagnostic consensus orchestrator.
//!
//! ## Features
//!
//! - A single typed error enum carrying fingerprint, dependency and tenant context
//! - Structured logging with task-scoped correlation IDs
//! - Per-dependency circuit breakers with atomic state transitions
//! - Caller-side retry policy with exponential backoff and jitter
//!

pub mod types;
pub mod logging;
pub mod circuit_breaker;
pub mod retry;

// Re-export commonly used types
pub use types::{Error, ErrorKind, Result};
pub use logging::{current_correlation_id, init_logging, with_correlation_id, LoggingConfig};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitHealth, CircuitState, CircuitTransition,
};
pub use retry::{RetryConfig, RetryPolicy};

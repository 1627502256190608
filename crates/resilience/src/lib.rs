#![warn(missing_docs)]

//! # Archflow Resilience
//!
//! Bounded retries with exponential backoff and optional output validation:
//!
//! - [`RetryConfig`] / [`StrictRetryPolicy`] — validated retry parameters
//! - [`OutputSchema`] — declarative result validation
//! - [`execute_with_retry`] — the retry loop itself, cancellation-aware,
//!   with an [`Attempt`] record per try and a [`RetryListener`] for
//!   observers
//!
//! Each retry is independent: no state carries between attempts beyond what
//! the retried operation manages itself.

pub mod retry;
pub mod schema;

pub use retry::{
    Attempt, NoopListener, RetryConfig, RetryError, RetryListener, RetryOutcome,
    StrictRetryPolicy, execute_with_retry,
};
pub use schema::{OutputSchema, PropertyRule, SchemaType};

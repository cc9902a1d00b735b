//! Shared utilities for subset-forge.
//!
//! Retry handling for transient failures and the cancellation flag shared
//! by encoder and fold workers.

pub mod cancel;
pub mod retry;

pub use cancel::CancellationFlag;
pub use retry::{retry, Backoff, RetryError, RetryPolicy};

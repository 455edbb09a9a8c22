//! Reliability patterns for result delivery
//!
//! This module provides:
//! - [`RetryPolicy`] - Bounded attempts with fixed or exponential delays
//! - [`retry`] - Drive a fallible async operation under a policy

mod retry;

pub use retry::{retry, RetryPolicy};

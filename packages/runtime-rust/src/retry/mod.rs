//! Redelivery of messages that failed on the consuming side.

pub mod listener;
pub mod strategy;

pub use listener::SendFailedMessageForRetryListener;
pub use strategy::{MultiplierRetryStrategy, RetryStrategy};

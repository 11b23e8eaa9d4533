//! Iterator based retry strategies.
//!
//! A strategy is an `Iterator<Item = Duration>` describing how long to cool
//! off before the next attempt. Retry loops drive the iterator manually so
//! they can select the cool-off sleep against a cancellation signal, which a
//! self-contained retry future cannot do.

pub mod strategy;

pub use strategy::exponential::Exponential;
pub use strategy::fixed::Fixed;

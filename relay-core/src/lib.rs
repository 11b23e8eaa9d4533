//! The delivery-guarantee core of a stream-processing runtime: everything
//! between a source reader and a sink writer that makes sure each message
//! acquired upstream is either positively acknowledged exactly once or
//! redelivered until it succeeds, across connection loss, sink failure,
//! partial-batch failure, and graceful shutdown.
//!
//! The two engines are the [source::AutoRetryReader], which buffers and
//! re-serves nacked reads at the source boundary, and the [sink::SinkWriter],
//! which drives a bounded pool of writers with reconnect-and-backoff over a
//! transaction channel. [forwarder::Forwarder] wires them together, with
//! [processor] stages and the [tracker::TrackerHandle] in between when
//! batches are split along the way.

pub mod batch;
pub mod config;
mod error;
pub mod forwarder;
pub mod mapper;
pub mod message;
pub mod metrics;
pub mod processor;
pub mod shutdown;
pub mod sink;
pub mod source;
pub mod tracker;

pub use crate::error::{Error, Result};

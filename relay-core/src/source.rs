//! The source boundary. A [SourceReader] is the capability contract a
//! transport must honor to feed the core: connect, read a batch paired with
//! its once-callable ack, and close cooperatively. The [retry] module wraps
//! any reader with in-memory nack buffering so downstream consumers can
//! reject work and have it re-served before anything new is read.

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::message::{AckFn, Batch};

pub mod retry;

pub use retry::AutoRetryReader;

/// Set of read related items a transport has to implement to become a
/// source.
#[trait_variant::make(SourceReader: Send)]
pub trait LocalSourceReader {
    /// Name of the source type.
    fn name(&self) -> &'static str;

    /// Establishes the connection. Idempotent; returns
    /// [crate::Error::NotConnected] when the target is unreachable.
    async fn connect(&mut self, cln_token: &CancellationToken) -> Result<()>;

    /// Reads the next batch together with its ack callback. Returns
    /// [crate::Error::NotConnected], [crate::Error::TypeClosed],
    /// [crate::Error::Timeout], or a transport error.
    async fn read(&mut self, cln_token: &CancellationToken) -> Result<(Batch, AckFn)>;

    /// Cooperative shutdown of the transport.
    async fn close(&mut self, cln_token: &CancellationToken) -> Result<()>;
}

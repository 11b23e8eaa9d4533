use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::message::Batch;
use crate::sink::AsyncSink;

/// A sink that prints each part it receives, the semantic equivalent of
/// writing to stdout.
pub struct LogSink;

impl AsyncSink for LogSink {
    async fn connect(&self, _cln_token: CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn write(&self, _cln_token: CancellationToken, batch: Batch) -> Result<()> {
        for part in batch.iter() {
            tracing::info!(
                payload = %String::from_utf8_lossy(part.value()),
                metadata = part.metadata().len(),
                "log sink"
            );
        }
        Ok(())
    }

    fn close_async(&self) {}

    async fn wait_for_close(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::message::Batch;
use crate::sink::AsyncSink;

/// A sink that accepts and discards everything, the semantic equivalent of
/// `/dev/null`.
pub struct BlackholeSink;

impl AsyncSink for BlackholeSink {
    async fn connect(&self, _cln_token: CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn write(&self, _cln_token: CancellationToken, _batch: Batch) -> Result<()> {
        Ok(())
    }

    fn close_async(&self) {}

    async fn wait_for_close(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

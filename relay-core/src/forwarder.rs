//! Orchestrates data movement from the source boundary to a transaction
//! channel consumed by a sink driver. The forward-a-chunk loop runs until a
//! shutdown signal is received:
//! - read a batch (with its ack) through the [AutoRetryReader]
//! - run the optional processors over it
//! - hand the result to the transaction channel, splitting the upstream ack
//!   through the [TrackerHandle] when processing produced several batches
//!
//! Every read is eventually acked upstream exactly once: by the downstream
//! consumer of the transaction, by the tracker once all split transactions
//! resolved, or directly here when processing dropped or failed the batch.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::message::sort_group::SortGroup;
use crate::message::{AckFn, Batch, Transaction};
use crate::processor::{execute_all, Processor};
use crate::source::{AutoRetryReader, SourceReader};
use crate::tracker::TrackerHandle;

pub struct ForwarderBuilder<R> {
    source: AutoRetryReader<R>,
    transactions: mpsc::Sender<Transaction>,
    cln_token: CancellationToken,
    processors: Vec<Box<dyn Processor>>,
}

impl<R: SourceReader> ForwarderBuilder<R> {
    pub fn new(
        source: AutoRetryReader<R>,
        transactions: mpsc::Sender<Transaction>,
        cln_token: CancellationToken,
    ) -> Self {
        Self {
            source,
            transactions,
            cln_token,
            processors: Vec::new(),
        }
    }

    pub fn processor(mut self, processor: Box<dyn Processor>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn build(self) -> Forwarder<R> {
        Forwarder {
            source: self.source,
            transactions: self.transactions,
            cln_token: self.cln_token,
            processors: self.processors,
            tracker: TrackerHandle::new(),
        }
    }
}

pub struct Forwarder<R> {
    source: AutoRetryReader<R>,
    processors: Vec<Box<dyn Processor>>,
    transactions: mpsc::Sender<Transaction>,
    tracker: TrackerHandle,
    cln_token: CancellationToken,
}

impl<R: SourceReader> Forwarder<R> {
    /// Runs the forward loop until cancellation or the source reporting it
    /// was closed.
    pub async fn start(&mut self) -> Result<()> {
        info!(source = self.source.name(), "Starting forwarder");
        loop {
            if self.cln_token.is_cancelled() {
                break;
            }
            match self.source.read(&self.cln_token).await {
                Ok((batch, ack)) => self.forward(batch, ack).await?,
                Err(Error::TypeClosed) => break,
                Err(Error::Timeout) => {
                    if self.cln_token.is_cancelled() {
                        break;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        info!(source = self.source.name(), "Forwarder stopped");
        Ok(())
    }

    async fn forward(&mut self, batch: Batch, ack: AckFn) -> Result<()> {
        if self.processors.is_empty() {
            return self.send(Transaction::new(batch, ack)).await;
        }

        let (group, tagged) = SortGroup::tag(batch);
        let results = match execute_all(&self.processors, tagged.clone()).await {
            Ok(results) => results,
            Err(err) => {
                // nack; the buffer re-serves the batch
                warn!(%err, "Processors failed, nacking batch");
                if let Err(ack_err) = ack.resolve(Some(err)).await {
                    error!(%ack_err, "Failed to nack batch");
                }
                return Ok(());
            }
        };

        let mut results: Vec<Batch> = results.into_iter().filter(|b| !b.is_empty()).collect();
        match results.len() {
            0 => {
                // every part was dropped deliberately, a positive ack
                if let Err(err) = ack.resolve(None).await {
                    error!(%err, "Failed to ack dropped batch");
                }
                Ok(())
            }
            1 => {
                let batch = results.pop().unwrap_or_default();
                self.send(Transaction::new(batch, ack)).await
            }
            _ => {
                let children = self
                    .tracker
                    .split_by_group(Transaction::new(tagged, ack), &group, results)
                    .await?;
                for child in children {
                    self.send(child).await?;
                }
                Ok(())
            }
        }
    }

    async fn send(&self, transaction: Transaction) -> Result<()> {
        // a closed channel means the sink driver is gone
        self.transactions
            .send(transaction)
            .await
            .map_err(|_| Error::TypeClosed)
    }
}

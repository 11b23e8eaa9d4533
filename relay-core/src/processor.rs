//! Batch processors that sit between the source boundary and the sink
//! driver. Processors never ack; they transform batches, surfacing per-part
//! failures through the error slot.

use async_trait::async_trait;

use crate::error::Result;
use crate::message::Batch;

pub mod branch;
pub mod switch;

pub use branch::Branch;
pub use switch::{Case, Switch};

#[async_trait]
pub trait Processor: Send + Sync {
    /// Processes one batch into zero or more resulting batches.
    async fn process(&self, batch: Batch) -> Result<Vec<Batch>>;
}

/// Feeds a batch through a chain of processors, flattening intermediate
/// results.
pub async fn execute_all(processors: &[Box<dyn Processor>], batch: Batch) -> Result<Vec<Batch>> {
    let mut batches = vec![batch];
    for processor in processors {
        let mut next = Vec::new();
        for batch in batches {
            next.extend(processor.process(batch).await?);
        }
        batches = next;
    }
    Ok(batches)
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::message::Part;

    /// Uppercases every payload, preserving count and order.
    pub(crate) struct Uppercase;

    #[async_trait]
    impl Processor for Uppercase {
        async fn process(&self, batch: Batch) -> Result<Vec<Batch>> {
            let parts = batch
                .into_parts()
                .into_iter()
                .map(|mut part| {
                    let upper = String::from_utf8_lossy(part.value()).to_uppercase();
                    part.set_value(upper.into_bytes());
                    part
                })
                .collect::<Vec<Part>>();
            Ok(vec![Batch::from(parts)])
        }
    }

    /// Drops the first part of every batch, violating count preservation.
    pub(crate) struct DropFirst;

    #[async_trait]
    impl Processor for DropFirst {
        async fn process(&self, batch: Batch) -> Result<Vec<Batch>> {
            let parts: Vec<Part> = batch.into_parts().into_iter().skip(1).collect();
            Ok(vec![Batch::from(parts)])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::Uppercase;
    use super::*;

    #[tokio::test]
    async fn execute_all_chains_processors() {
        let processors: Vec<Box<dyn Processor>> = vec![Box::new(Uppercase), Box::new(Uppercase)];
        let batches = execute_all(&processors, Batch::from_payloads(["ab", "cd"]))
            .await
            .unwrap();
        assert_eq!(batches.len(), 1);
        let values: Vec<&[u8]> = batches[0].iter().map(|p| p.value().as_ref()).collect();
        assert_eq!(values, vec![b"AB".as_ref(), b"CD".as_ref()]);
    }
}

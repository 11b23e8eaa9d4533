//! Fan-out/fan-in of a single upstream ack across N downstream outcomes.
//! When a batch is split across several transactions (cases, sub-pipelines,
//! parallel writers) the upstream ack must fire exactly once, after every
//! subset has resolved. The [Tracker] actor counts outstanding subsets per
//! batch; any failure short-circuits the entry into partial-failure state and
//! the final upstream signal carries the merged [BatchError] with child
//! indices translated back to parent indices. Parent indices not handed to
//! any subset were dropped deliberately and count as success.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::{mpsc, oneshot};
use tracing::error;

use crate::batch::BatchError;
use crate::error::{Error, Result};
use crate::message::sort_group::SortGroup;
use crate::message::{AckFn, Batch, Transaction};

/// Parent index per child part; `None` for parts without parent identity.
type Subset = Vec<Option<usize>>;

enum ActorMessage {
    Insert {
        batch: Batch,
        ack: AckFn,
        subsets: Vec<Subset>,
        respond_to: oneshot::Sender<u64>,
    },
    Resolve {
        id: u64,
        slot: usize,
        cause: Option<Error>,
    },
    #[cfg(test)]
    IsEmpty {
        respond_to: oneshot::Sender<bool>,
    },
}

struct TrackerEntry {
    batch: Batch,
    upstream: Option<AckFn>,
    subsets: Vec<Subset>,
    resolved: Vec<bool>,
    pending: usize,
    failed: BTreeMap<usize, Error>,
    overall: Option<Error>,
}

/// The aggregator actor. One per input stream is enough; entries are keyed by
/// an internal id.
struct Tracker {
    entries: HashMap<u64, TrackerEntry>,
    next_id: u64,
    receiver: mpsc::Receiver<ActorMessage>,
}

impl Tracker {
    fn new(receiver: mpsc::Receiver<ActorMessage>) -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 0,
            receiver,
        }
    }

    async fn run(mut self) {
        while let Some(message) = self.receiver.recv().await {
            self.handle_message(message);
        }
        // the handle and all child acks are gone, nack whatever is left so
        // upstream sees shutdown
        for (_, entry) in self.entries.drain() {
            if let Some(ack) = entry.upstream {
                tokio::spawn(async move {
                    if let Err(err) = ack.resolve(Some(Error::TypeClosed)).await {
                        error!(%err, "Failed to nack tracked batch at shutdown");
                    }
                });
            }
        }
    }

    fn handle_message(&mut self, message: ActorMessage) {
        match message {
            ActorMessage::Insert {
                batch,
                ack,
                subsets,
                respond_to,
            } => {
                let id = self.next_id;
                self.next_id += 1;
                let pending = subsets.len();
                self.entries.insert(
                    id,
                    TrackerEntry {
                        batch,
                        upstream: Some(ack),
                        resolved: vec![false; pending],
                        subsets,
                        pending,
                        failed: BTreeMap::new(),
                        overall: None,
                    },
                );
                let _ = respond_to.send(id);
            }
            ActorMessage::Resolve { id, slot, cause } => self.handle_resolve(id, slot, cause),
            #[cfg(test)]
            ActorMessage::IsEmpty { respond_to } => {
                let _ = respond_to.send(self.entries.is_empty());
            }
        }
    }

    fn handle_resolve(&mut self, id: u64, slot: usize, cause: Option<Error>) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if slot >= entry.resolved.len() || entry.resolved[slot] {
            return;
        }
        entry.resolved[slot] = true;
        entry.pending -= 1;

        match cause {
            None => {}
            Some(Error::Batch(child_err)) => {
                for (child_index, cause) in child_err.indexed_errors() {
                    if let Some(Some(parent)) = entry.subsets[slot].get(child_index) {
                        entry.failed.entry(*parent).or_insert_with(|| cause.clone());
                    }
                }
                if entry.overall.is_none() {
                    entry.overall = Some(child_err.overall().clone());
                }
            }
            Some(err) => {
                for parent in entry.subsets[slot].iter().flatten() {
                    entry.failed.entry(*parent).or_insert_with(|| err.clone());
                }
                if entry.overall.is_none() {
                    entry.overall = Some(err);
                }
            }
        }

        if entry.pending == 0 {
            if let Some(entry) = self.entries.remove(&id) {
                Self::fire(entry);
            }
        }
    }

    /// Every subset has resolved; deliver the merged outcome upstream. The
    /// ack runs in its own task because upstream acks may block.
    fn fire(entry: TrackerEntry) {
        let TrackerEntry {
            batch,
            upstream,
            failed,
            overall,
            ..
        } = entry;
        let Some(ack) = upstream else {
            return;
        };

        let cause = if failed.is_empty() {
            None
        } else {
            let overall =
                overall.unwrap_or_else(|| Error::Sink("downstream rejected batch".to_string()));
            let mut batch_err = BatchError::new(batch, overall);
            for (index, err) in failed {
                batch_err.failed(index, err);
            }
            Some(Error::batch(batch_err))
        };

        tokio::spawn(async move {
            if let Err(err) = ack.resolve(cause).await {
                error!(%err, "Failed to deliver aggregated ack upstream");
            }
        });
    }
}

/// Handle to the tracker actor.
#[derive(Clone)]
pub struct TrackerHandle {
    sender: mpsc::Sender<ActorMessage>,
}

impl TrackerHandle {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel(100);
        tokio::spawn(Tracker::new(receiver).run());
        Self { sender }
    }

    /// Splits a transaction into child transactions over the given parent
    /// index subsets. The original ack fires once every child has acked:
    /// positively when all succeeded, otherwise with the merged [BatchError].
    /// Indices absent from every subset count as success. Out-of-range
    /// indices are ignored.
    pub async fn split(
        &self,
        transaction: Transaction,
        subsets: Vec<Vec<usize>>,
    ) -> Result<Vec<Transaction>> {
        let (batch, ack) = transaction.into_parts();
        let children = subsets
            .into_iter()
            .map(|subset| {
                let parts: Vec<_> = subset
                    .iter()
                    .filter_map(|&index| batch.get(index).cloned())
                    .collect();
                let subset = subset
                    .into_iter()
                    .filter(|&index| index < batch.len())
                    .map(Some)
                    .collect();
                (Batch::from(parts), subset)
            })
            .collect();
        self.fan_out(batch, ack, children).await
    }

    /// Splits a transaction into the given child batches, recovering each
    /// part's parent index through the sort group that tagged the original
    /// batch. Parts the group does not recognise carry no parent identity.
    pub async fn split_by_group(
        &self,
        transaction: Transaction,
        group: &SortGroup,
        children: Vec<Batch>,
    ) -> Result<Vec<Transaction>> {
        let (batch, ack) = transaction.into_parts();
        let children = children
            .into_iter()
            .map(|child| {
                let subset = child.iter().map(|part| group.get_index(part)).collect();
                (child, subset)
            })
            .collect();
        self.fan_out(batch, ack, children).await
    }

    async fn fan_out(
        &self,
        batch: Batch,
        ack: AckFn,
        children: Vec<(Batch, Subset)>,
    ) -> Result<Vec<Transaction>> {
        if children.is_empty() {
            // nothing downstream will ever resolve, the batch was dropped in
            // its entirety
            return ack.resolve(None).await.map(|_| Vec::new());
        }

        let (batches, subsets): (Vec<Batch>, Vec<Subset>) = children.into_iter().unzip();

        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(ActorMessage::Insert {
                batch,
                ack,
                subsets,
                respond_to,
            })
            .await
            .map_err(|e| Error::Tracker(format!("{e:?}")))?;
        let id = response
            .await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))?;

        Ok(batches
            .into_iter()
            .enumerate()
            .map(|(slot, child)| {
                let sender = self.sender.clone();
                let ack = AckFn::new(move |cause| async move {
                    sender
                        .send(ActorMessage::Resolve { id, slot, cause })
                        .await
                        .map_err(|e| Error::Tracker(format!("{e:?}")))
                });
                Transaction::new(child, ack)
            })
            .collect())
    }

    /// Checks that no batches are being tracked. Used by tests to make sure
    /// every ack was delivered.
    #[cfg(test)]
    pub(crate) async fn is_empty(&self) -> Result<bool> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(ActorMessage::IsEmpty { respond_to })
            .await
            .map_err(|e| Error::Tracker(format!("{e:?}")))?;
        response
            .await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))
    }
}

impl Default for TrackerHandle {
    fn default() -> Self {
        Self::new()
    }
}

//! In-memory nack buffering for a [SourceReader]. Every batch read through
//! the wrapper is retained (tagged with a [SortGroup]) until its consumer
//! acks it positively; a nack re-queues the retained copy so it is re-served
//! before anything new is read from the wrapped reader. A nack carrying a
//! [BatchError] collapses the retained copy down to just the failed parts,
//! located by identity rather than position, so acked parts are never
//! redelivered.
//!
//! The upstream ack is invoked exactly once per retained batch: with success
//! once every served copy has resolved positively, or never, if the buffer is
//! closed first (the upstream is expected to redeliver on reconnect).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use backoff::Exponential;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::batch::BatchError;
use crate::config::RetryBufferConfig;
use crate::error::{Error, Result};
use crate::message::sort_group::SortGroup;
use crate::message::{AckFn, Batch};
use crate::source::SourceReader;

/// Wraps a reader so nacked batches are redelivered automatically.
pub struct AutoRetryReader<R> {
    inner: R,
    shared: Arc<Shared>,
    next_seq: u64,
}

struct Shared {
    queue: Mutex<ResendState>,
}

struct ResendState {
    /// Nacked entries eligible for re-serving, kept sorted by sequence
    /// number so redelivery follows insertion order.
    entries: VecDeque<Arc<RetryEntry>>,
    /// Delay applied before each re-serve; reset on positive ack.
    backoff: Exponential,
}

struct RetryEntry {
    seq: u64,
    state: Mutex<EntryState>,
}

struct EntryState {
    /// The retained tagged copy, collapsed down as parts get acked.
    batch: Batch,
    group: SortGroup,
    upstream: Option<AckFn>,
    /// Served copies that have not resolved yet.
    outstanding: usize,
}

impl<R: SourceReader> AutoRetryReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_config(inner, RetryBufferConfig::default())
    }

    pub fn with_config(inner: R, config: RetryBufferConfig) -> Self {
        Self {
            inner,
            shared: Arc::new(Shared {
                queue: Mutex::new(ResendState {
                    entries: VecDeque::new(),
                    backoff: config.retry_backoff.strategy(),
                }),
            }),
            next_seq: 0,
        }
    }

    /// Serves a copy of the retained batch with a fresh ack callback bound to
    /// the shared entry.
    fn serve(&self, entry: Arc<RetryEntry>) -> (Batch, AckFn) {
        let copy = {
            let mut state = entry.state.lock();
            state.outstanding += 1;
            state.batch.clone()
        };
        let shared = Arc::clone(&self.shared);
        let ack = AckFn::new(move |cause| resolve_served(shared, entry, cause));
        (copy, ack)
    }
}

impl<R: SourceReader> SourceReader for AutoRetryReader<R> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn connect(&mut self, cln_token: &CancellationToken) -> Result<()> {
        self.inner.connect(cln_token).await
    }

    async fn read(&mut self, cln_token: &CancellationToken) -> Result<(Batch, AckFn)> {
        let resend_delay = {
            let mut queue = self.shared.queue.lock();
            if queue.entries.is_empty() {
                None
            } else {
                queue.backoff.next()
            }
        };

        if let Some(delay) = resend_delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cln_token.cancelled() => return Err(Error::Timeout),
            }
            // Pop after the sleep: a nack that lands mid-delay may have
            // requeued an earlier entry, which then goes first.
            if let Some(entry) = self.shared.queue.lock().entries.pop_front() {
                return Ok(self.serve(entry));
            }
        }

        let (batch, upstream) = self.inner.read(cln_token).await?;
        let (group, tagged) = SortGroup::tag(batch);
        let seq = self.next_seq;
        self.next_seq += 1;
        let entry = Arc::new(RetryEntry {
            seq,
            state: Mutex::new(EntryState {
                batch: tagged,
                group,
                upstream: Some(upstream),
                outstanding: 0,
            }),
        });
        Ok(self.serve(entry))
    }

    async fn close(&mut self, cln_token: &CancellationToken) -> Result<()> {
        // Entries still pending are dropped without acking; the upstream
        // redelivers them on reconnect.
        self.shared.queue.lock().entries.clear();
        self.inner.close(cln_token).await
    }
}

/// Resolves one served copy of an entry.
async fn resolve_served(
    shared: Arc<Shared>,
    entry: Arc<RetryEntry>,
    cause: Option<Error>,
) -> Result<()> {
    match cause {
        None => finish_copy(shared, entry).await,
        Some(Error::Batch(batch_err)) => {
            let remainder = {
                let mut state = entry.state.lock();
                state.batch = collapse_failed(&state.batch, &state.group, &batch_err);
                state.batch.len()
            };
            if remainder == 0 {
                // every index was acked, equivalent to a positive ack
                finish_copy(shared, entry).await
            } else {
                nack_copy(&shared, entry);
                Ok(())
            }
        }
        Some(_) => {
            nack_copy(&shared, entry);
            Ok(())
        }
    }
}

/// Positive resolution: once no served copies remain outstanding the
/// upstream ack fires exactly once and the entry is dropped.
async fn finish_copy(shared: Arc<Shared>, entry: Arc<RetryEntry>) -> Result<()> {
    let upstream = {
        let mut state = entry.state.lock();
        state.outstanding -= 1;
        if state.outstanding == 0 {
            state.upstream.take()
        } else {
            None
        }
    };
    shared.queue.lock().backoff.reset();
    match upstream {
        // The mutexes are released before invoking the upstream ack; it may
        // block arbitrarily long.
        Some(upstream) => upstream.resolve(None).await,
        None => Ok(()),
    }
}

/// Negative resolution: the entry goes back into the resend queue, ordered
/// by sequence number.
fn nack_copy(shared: &Shared, entry: Arc<RetryEntry>) {
    entry.state.lock().outstanding -= 1;
    let mut queue = shared.queue.lock();
    let pos = queue.entries.partition_point(|e| e.seq < entry.seq);
    queue.entries.insert(pos, entry);
}

/// Projects a [BatchError] back onto the retained copy, keeping only the
/// failed parts. Order follows the error's own failed-index order; each part
/// is located in the retained copy by sort-group identity. A failed part the
/// group has never seen is redelivered as-is.
fn collapse_failed(retained: &Batch, group: &SortGroup, err: &BatchError) -> Batch {
    let positions: HashMap<usize, usize> = retained
        .iter()
        .enumerate()
        .filter_map(|(pos, part)| group.get_index(part).map(|original| (original, pos)))
        .collect();

    let mut parts = Vec::with_capacity(err.failed_len());
    err.walk_parts(|_, part, _| {
        match group
            .get_index(part)
            .and_then(|original| positions.get(&original))
        {
            Some(pos) => {
                if let Some(original) = retained.get(*pos) {
                    parts.push(original.clone());
                }
            }
            None => parts.push(part.clone()),
        }
        true
    });
    Batch::from(parts)
}

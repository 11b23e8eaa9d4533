//! The message model that moves between the source boundary and the sink
//! drivers. A [Part] is one unit of data, a [Batch] is an ordered sequence of
//! parts that is acknowledged as a whole, and a [Transaction] pairs a batch
//! with the [AckFn] that reports its terminal disposition back toward the
//! source. The ack callback travels forward through channels with the batch;
//! whoever finally takes responsibility for the batch must invoke it exactly
//! once (enforced by move semantics).

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use tracing::Span;

use crate::error::{Error, Result};
use crate::message::sort_group::SortTag;

pub mod sort_group;

/// One payload cell within a [Batch].
///
/// NOTE: It is cheap to clone; the payload and metadata are shared.
#[derive(Debug, Clone)]
pub struct Part {
    /// Raw byte payload.
    value: Bytes,
    /// String metadata travelling alongside the payload.
    metadata: Arc<HashMap<String, String>>,
    /// Optional structured view of the payload.
    structured: Option<Arc<serde_json::Value>>,
    /// Optional tracing span attached while the part is in flight.
    span: Option<Span>,
    /// Error slot set when a stage fails this part without failing the whole
    /// batch.
    error: Option<Error>,
    /// Identity tags assigned by sort groups, stable across copy and reorder.
    sort_tags: Vec<SortTag>,
    /// Number of original messages this part was collapsed from, 1 for
    /// ordinary parts.
    collapsed: usize,
}

impl Default for Part {
    fn default() -> Self {
        Self {
            value: Bytes::new(),
            metadata: Arc::new(HashMap::new()),
            structured: None,
            span: None,
            error: None,
            sort_tags: Vec::new(),
            collapsed: 1,
        }
    }
}

impl Part {
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn set_value(&mut self, value: impl Into<Bytes>) {
        self.value = value.into();
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn metadata_insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        Arc::make_mut(&mut self.metadata).insert(key.into(), value.into());
    }

    pub fn structured(&self) -> Option<&serde_json::Value> {
        self.structured.as_deref()
    }

    pub fn set_structured(&mut self, value: serde_json::Value) {
        self.structured = Some(Arc::new(value));
    }

    pub fn span(&self) -> Option<&Span> {
        self.span.as_ref()
    }

    pub fn set_span(&mut self, span: Span) {
        self.span = Some(span);
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn set_error(&mut self, error: Option<Error>) {
        self.error = error;
    }

    /// Number of upstream messages represented by this part.
    pub fn collapsed_count(&self) -> usize {
        self.collapsed
    }

    pub fn set_collapsed_count(&mut self, count: usize) {
        self.collapsed = count.max(1);
    }

    pub(crate) fn push_sort_tag(&mut self, tag: SortTag) {
        self.sort_tags.push(tag);
    }

    pub(crate) fn sort_tags(&self) -> &[SortTag] {
        &self.sort_tags
    }
}

/// An ordered sequence of parts acknowledged as one unit.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    parts: Vec<Part>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a batch of plain parts from raw payloads.
    pub fn from_payloads<I, B>(payloads: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            parts: payloads.into_iter().map(Part::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Part> {
        self.parts.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Part> {
        self.parts.get_mut(index)
    }

    pub fn push(&mut self, part: Part) {
        self.parts.push(part);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Part> {
        self.parts.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Part> {
        self.parts.iter_mut()
    }

    pub fn into_parts(self) -> Vec<Part> {
        self.parts
    }

    /// Total number of upstream messages in the batch, counting parts that
    /// were collapsed from several originals.
    pub fn message_count(&self) -> usize {
        self.parts.iter().map(Part::collapsed_count).sum()
    }
}

impl From<Vec<Part>> for Batch {
    fn from(parts: Vec<Part>) -> Self {
        Self { parts }
    }
}

impl FromIterator<Part> for Batch {
    fn from_iter<I: IntoIterator<Item = Part>>(iter: I) -> Self {
        Self {
            parts: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Batch {
    type Item = Part;
    type IntoIter = std::vec::IntoIter<Part>;

    fn into_iter(self) -> Self::IntoIter {
        self.parts.into_iter()
    }
}

/// The once-callable acknowledgement attached to every read and every
/// transaction. A `None` cause is a positive ack, an [Error::Batch] cause is
/// a partial failure, and any other cause fails the whole batch. The returned
/// error is whatever the upstream itself reported while processing the ack
/// (e.g. a broker nack failure).
pub struct AckFn {
    inner: Box<dyn FnOnce(Option<Error>) -> BoxFuture<'static, Result<()>> + Send>,
}

impl AckFn {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(Option<Error>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            inner: Box::new(move |cause| Box::pin(f(cause))),
        }
    }

    /// An ack that discards the outcome, for batches nobody is waiting on.
    pub fn noop() -> Self {
        Self::new(|_| async { Ok(()) })
    }

    /// Reports the terminal disposition upstream, consuming the callback.
    pub async fn resolve(self, cause: Option<Error>) -> Result<()> {
        (self.inner)(cause).await
    }
}

impl fmt::Debug for AckFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckFn").finish_non_exhaustive()
    }
}

/// A batch paired with the ack callback that must be invoked exactly once
/// with its terminal disposition.
#[derive(Debug)]
pub struct Transaction {
    pub batch: Batch,
    ack: AckFn,
}

impl Transaction {
    pub fn new(batch: Batch, ack: AckFn) -> Self {
        Self { batch, ack }
    }

    pub fn into_parts(self) -> (Batch, AckFn) {
        (self.batch, self.ack)
    }

    /// Acknowledges the transaction with its final outcome.
    pub async fn ack(self, cause: Option<Error>) -> Result<()> {
        self.ack.resolve(cause).await
    }
}

//! A sparse per-part failure set attached to an acknowledged batch. Sinks
//! that can fail individual parts of a write report a [BatchError] as the ack
//! cause; the source boundary then redelivers only the failed parts.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::Error;
use crate::message::{Batch, Part};

/// An error wrapping a batch with a mapping of part index to failure cause.
///
/// An empty failed set is equivalent to a positive ack, a failed set covering
/// every index is equivalent to failing the whole batch with the overall
/// cause, and anything in between is a partial failure.
#[derive(Debug, Clone)]
pub struct BatchError {
    batch: Batch,
    overall: Box<Error>,
    failed: BTreeMap<usize, Error>,
}

impl BatchError {
    pub fn new(batch: Batch, overall: Error) -> Self {
        Self {
            batch,
            overall: Box::new(overall),
            failed: BTreeMap::new(),
        }
    }

    /// Marks the part at `index` as failed. Indices beyond the batch length
    /// are ignored.
    pub fn failed(&mut self, index: usize, cause: Error) {
        if index < self.batch.len() {
            self.failed.insert(index, cause);
        }
    }

    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    pub fn overall(&self) -> &Error {
        &self.overall
    }

    /// Number of failed indices.
    pub fn failed_len(&self) -> usize {
        self.failed.len()
    }

    /// True when no index is marked failed, which upstream observers treat as
    /// a positive ack.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// True when every index is marked failed, which upstream observers treat
    /// as a whole-batch failure with the overall cause.
    pub fn is_whole_batch(&self) -> bool {
        self.failed.len() == self.batch.len()
    }

    /// Failed indices and their causes in ascending index order.
    pub fn indexed_errors(&self) -> impl Iterator<Item = (usize, &Error)> {
        self.failed.iter().map(|(index, cause)| (*index, cause))
    }

    /// Visits each failed part in ascending index order until the visitor
    /// returns false.
    pub fn walk_parts<F>(&self, mut f: F)
    where
        F: FnMut(usize, &Part, &Error) -> bool,
    {
        for (index, cause) in &self.failed {
            let Some(part) = self.batch.get(*index) else {
                continue;
            };
            if !f(*index, part, cause) {
                return;
            }
        }
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.overall.fmt(f)
    }
}

impl std::error::Error for BatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.overall)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Batch;

    #[test]
    fn empty_failed_set_is_success() {
        let err = BatchError::new(
            Batch::from_payloads(["a", "b"]),
            Error::Sink("overall".to_string()),
        );
        assert!(err.is_success());
        assert!(!err.is_whole_batch());
        assert_eq!(err.indexed_errors().count(), 0);
    }

    #[test]
    fn full_failed_set_is_whole_batch() {
        let mut err = BatchError::new(
            Batch::from_payloads(["a", "b"]),
            Error::Sink("overall".to_string()),
        );
        err.failed(0, Error::Sink("first".to_string()));
        err.failed(1, Error::Sink("second".to_string()));
        assert!(err.is_whole_batch());
        assert!(!err.is_success());
    }

    #[test]
    fn out_of_bounds_marks_are_ignored() {
        let mut err = BatchError::new(
            Batch::from_payloads(["a"]),
            Error::Sink("overall".to_string()),
        );
        err.failed(3, Error::Sink("nope".to_string()));
        assert!(err.is_success());
    }

    #[test]
    fn walk_visits_failed_parts_in_index_order() {
        let mut err = BatchError::new(
            Batch::from_payloads(["a", "b", "c", "d"]),
            Error::Sink("overall".to_string()),
        );
        err.failed(3, Error::Sink("late".to_string()));
        err.failed(1, Error::Sink("early".to_string()));

        let mut seen = Vec::new();
        err.walk_parts(|index, part, _cause| {
            seen.push((index, part.value().clone()));
            true
        });
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, 1);
        assert_eq!(seen[0].1.as_ref(), b"b");
        assert_eq!(seen[1].0, 3);
        assert_eq!(seen[1].1.as_ref(), b"d");
    }

    #[test]
    fn displays_overall_cause() {
        let err = BatchError::new(
            Batch::from_payloads(["a"]),
            Error::Sink("overall".to_string()),
        );
        assert_eq!(err.to_string(), "Sink Error - overall");
    }
}

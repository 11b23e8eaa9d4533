//! A branch maps each part of a batch into a request, runs child processors
//! over the requests, and overlays the results back onto the original parts.
//! The request map may delete a part (the branch skips it) or fail (the part
//! gets an error slot); the child processors must preserve part count and
//! ordering, so the results can be re-aligned with the original batch by
//! re-inserting gaps at skipped and failed indices. A count mismatch is fatal
//! for the branch and is reported as an error on every part of the original
//! batch.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use crate::error::{Error, Result};
use crate::mapper::{PartMapper, ResultMapper};
use crate::message::{Batch, Part};
use crate::processor::{execute_all, Processor};

pub struct Branch {
    request_map: Option<Arc<dyn PartMapper>>,
    result_map: Option<Arc<dyn ResultMapper>>,
    children: Vec<Box<dyn Processor>>,
}

impl Branch {
    pub fn new(children: Vec<Box<dyn Processor>>) -> Result<Self> {
        if children.is_empty() {
            return Err(Error::Config(
                "the branch processor requires at least one child processor".to_string(),
            ));
        }
        Ok(Self {
            request_map: None,
            result_map: None,
            children,
        })
    }

    /// Mapping that turns each original part into a request for the children.
    /// Without one the children receive exact copies.
    pub fn request_map(mut self, mapper: Arc<dyn PartMapper>) -> Self {
        self.request_map = Some(mapper);
        self
    }

    /// Mapping that overlays each child result onto the original part.
    /// Without one the original parts remain unchanged.
    pub fn result_map(mut self, mapper: Arc<dyn ResultMapper>) -> Self {
        self.result_map = Some(mapper);
        self
    }
}

#[async_trait]
impl Processor for Branch {
    async fn process(&self, batch: Batch) -> Result<Vec<Batch>> {
        let original_len = batch.len();

        // build the request payload; skipped and failed indices leave gaps
        let mut skipped = Vec::new();
        let mut map_errs: Vec<(usize, Error)> = Vec::new();
        let mut requests: Vec<Part> = Vec::new();
        for (index, part) in batch.iter().enumerate() {
            // errors are not propagated into the branch
            let mut clean = part.clone();
            clean.set_error(None);
            match &self.request_map {
                Some(mapper) => match mapper.map_part(index, &clean) {
                    Ok(Some(request)) => requests.push(request),
                    Ok(None) => skipped.push(index),
                    Err(err) => map_errs.push((
                        index,
                        Error::Mapping(format!("request mapping failed: {err}")),
                    )),
                },
                None => requests.push(clean),
            }
        }
        let failed: Vec<usize> = map_errs.iter().map(|(index, _)| *index).collect();

        let mut results: Vec<Batch> = Vec::new();
        if !requests.is_empty() {
            match execute_all(&self.children, Batch::from(requests)).await {
                Ok(batches) if batches.iter().any(|b| !b.is_empty()) => results = batches,
                Ok(_) => {
                    return Ok(vec![fail_all(
                        batch,
                        map_errs,
                        Error::Processor("child processors resulted in zero parts".to_string()),
                    )]);
                }
                Err(err) => {
                    return Ok(vec![fail_all(
                        batch,
                        map_errs,
                        Error::Processor(format!("child processors failed: {err}")),
                    )]);
                }
            }
        }

        let mut aligned = match align_branch_result(original_len, &skipped, &failed, results) {
            Ok(aligned) => aligned,
            Err(err) => {
                error!(
                    %err,
                    "Failed to align branch result. Avoid using filters or any processor that \
                     changes the number of parts within a branch"
                );
                return Ok(vec![fail_all(batch, map_errs, err)]);
            }
        };

        // per-part failures from the children surface as branch errors
        for (index, slot) in aligned.iter_mut().enumerate() {
            let child_err = slot.as_ref().and_then(|part| part.error().cloned());
            if let Some(cause) = child_err {
                *slot = None;
                map_errs.push((
                    index,
                    Error::Processor(format!("processors failed: {cause}")),
                ));
            }
        }

        let mut parts: Vec<Part> = batch.into_parts();
        if let Some(result_map) = &self.result_map {
            for (index, slot) in aligned.iter().enumerate() {
                let Some(result) = slot else { continue };
                match result_map.overlay(index, &parts[index], result) {
                    Ok(part) => parts[index] = part,
                    Err(err) => map_errs.push((
                        index,
                        Error::Mapping(format!("result mapping failed: {err}")),
                    )),
                }
            }
        }
        for (index, err) in map_errs {
            if let Some(part) = parts.get_mut(index) {
                part.set_error(Some(err));
            }
        }
        Ok(vec![Batch::from(parts)])
    }
}

/// Fails every part of the batch with the branch-wide cause, keeping any more
/// specific per-part errors.
fn fail_all(batch: Batch, map_errs: Vec<(usize, Error)>, err: Error) -> Batch {
    let mut parts = batch.into_parts();
    for part in parts.iter_mut() {
        part.set_error(Some(err.clone()));
    }
    for (index, specific) in map_errs {
        if let Some(part) = parts.get_mut(index) {
            part.set_error(Some(specific));
        }
    }
    Batch::from(parts)
}

/// Re-aligns child results with the original batch by re-inserting a gap at
/// every skipped or failed index. The number of returned parts plus gaps must
/// equal the original length.
fn align_branch_result(
    length: usize,
    skipped: &[usize],
    failed: &[usize],
    results: Vec<Batch>,
) -> Result<Vec<Option<Part>>> {
    let result_parts: Vec<Part> = results.into_iter().flat_map(Batch::into_parts).collect();

    let mut gaps: Vec<usize> = skipped.iter().chain(failed).copied().collect();
    gaps.sort_unstable();

    if result_parts.len() + gaps.len() != length {
        return Err(Error::Processor(format!(
            "part count from branch processors does not match request, started with {length} \
             parts, finished with {}",
            result_parts.len() + gaps.len()
        )));
    }

    let mut aligned: Vec<Option<Part>> = vec![None; length];
    let mut gap_index = 0;
    for (i, part) in result_parts.into_iter().enumerate() {
        while gap_index < gaps.len() && gaps[gap_index] == i + gap_index {
            gap_index += 1;
        }
        aligned[i + gap_index] = Some(part);
    }
    Ok(aligned)
}

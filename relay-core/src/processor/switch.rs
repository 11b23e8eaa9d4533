//! A switch re-splits one input batch across case buckets, processes each
//! bucket independently (and concurrently), then reorders the union back into
//! input order through a [SortGroup]. Downstream observers see original
//! positions even though cases ran in any order.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::sort_group::SortGroup;
use crate::message::{Batch, Part};
use crate::processor::{execute_all, Processor};

type CheckFn = Arc<dyn Fn(&Part) -> bool + Send + Sync>;

pub struct Case {
    check: CheckFn,
    processors: Vec<Box<dyn Processor>>,
}

impl Case {
    pub fn new<F>(check: F, processors: Vec<Box<dyn Processor>>) -> Self
    where
        F: Fn(&Part) -> bool + Send + Sync + 'static,
    {
        Self {
            check: Arc::new(check),
            processors,
        }
    }
}

pub struct Switch {
    cases: Vec<Case>,
}

impl Switch {
    pub fn new(cases: Vec<Case>) -> Self {
        Self { cases }
    }
}

#[async_trait]
impl Processor for Switch {
    async fn process(&self, batch: Batch) -> Result<Vec<Batch>> {
        let (group, tagged) = SortGroup::tag(batch);

        // parts land in the bucket of the first matching case
        let mut buckets: Vec<Vec<Part>> = (0..self.cases.len()).map(|_| Vec::new()).collect();
        let mut passthrough: Vec<Part> = Vec::new();
        for part in tagged {
            match self.cases.iter().position(|case| (case.check)(&part)) {
                Some(index) => buckets[index].push(part),
                None => passthrough.push(part),
            }
        }

        let tasks = self
            .cases
            .iter()
            .zip(buckets)
            .filter(|(_, bucket)| !bucket.is_empty())
            .map(|(case, bucket)| execute_all(&case.processors, Batch::from(bucket)));
        let results = futures::future::try_join_all(tasks).await?;

        let mut union: Vec<Part> = results
            .into_iter()
            .flatten()
            .flat_map(Batch::into_parts)
            .collect();
        union.extend(passthrough);

        Ok(vec![Batch::from(group.order(union))])
    }
}

//! Identity tagging for batches whose parts may be reordered, filtered, or
//! regrouped downstream. A [SortGroup] hands every part of a batch a
//! process-unique token; given any permutation or subset of those parts the
//! group recovers each part's original index, so results can be projected
//! back onto the source batch by identity rather than by position.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::message::{Batch, Part};

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

/// A token tying a part to its original index within one group. Cheap to
/// copy; parts keep their tokens across clone and reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SortTag {
    group: u64,
    index: usize,
}

/// A process-unique identity group over the parts of one batch.
#[derive(Debug, Clone)]
pub struct SortGroup {
    id: u64,
    len: usize,
}

impl SortGroup {
    /// Tags every part of the batch with a fresh token from a new group and
    /// returns the group alongside the tagged batch.
    pub fn tag(batch: Batch) -> (SortGroup, Batch) {
        let id = NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed);
        let mut parts = batch.into_parts();
        for (index, part) in parts.iter_mut().enumerate() {
            part.push_sort_tag(SortTag { group: id, index });
        }
        (
            SortGroup {
                id,
                len: parts.len(),
            },
            Batch::from(parts),
        )
    }

    /// Number of parts tagged by this group.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The original index of a part within this group, or `None` if the part
    /// was never tagged by it. When a part was re-tagged through nested
    /// stages the most recent tag of this group wins.
    pub fn get_index(&self, part: &Part) -> Option<usize> {
        part.sort_tags()
            .iter()
            .rev()
            .find(|tag| tag.group == self.id)
            .map(|tag| tag.index)
    }

    /// Re-sorts an arbitrary permutation or subset of this group's parts back
    /// into original index order. Untagged parts sort after all tagged parts;
    /// on duplicate tokens the part earlier in the input wins the earlier
    /// position.
    pub fn order(&self, parts: Vec<Part>) -> Vec<Part> {
        let mut keyed: Vec<(usize, Part)> = parts
            .into_iter()
            .map(|part| (self.get_index(&part).unwrap_or(usize::MAX), part))
            .collect();
        keyed.sort_by_key(|(index, _)| *index);
        keyed.into_iter().map(|(_, part)| part).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payloads(batch: &Batch) -> Vec<&[u8]> {
        batch.iter().map(|p| p.value().as_ref()).collect()
    }

    #[test]
    fn round_trip_recovers_original_indexes() {
        let batch = Batch::from_payloads(["a", "b", "c", "d", "e"]);
        let (group, tagged) = SortGroup::tag(batch);

        let mut shuffled: Vec<Part> = tagged.clone().into_parts();
        shuffled.swap(0, 3);
        shuffled.swap(1, 4);
        shuffled.swap(2, 0);

        for (pos, part) in shuffled.iter().enumerate() {
            let original = group.get_index(part).unwrap();
            assert_eq!(
                tagged.get(original).unwrap().value(),
                shuffled[pos].value()
            );
        }

        let restored = Batch::from(group.order(shuffled));
        assert_eq!(payloads(&restored), payloads(&tagged));
    }

    #[test]
    fn survives_copies() {
        let (group, tagged) = SortGroup::tag(Batch::from_payloads(["x", "y"]));
        let copy = tagged.get(1).unwrap().clone();
        assert_eq!(group.get_index(&copy), Some(1));
    }

    #[test]
    fn foreign_parts_are_absent() {
        let (group, _tagged) = SortGroup::tag(Batch::from_payloads(["x"]));
        let (_other, other_tagged) = SortGroup::tag(Batch::from_payloads(["y"]));

        assert_eq!(group.get_index(&Part::new("plain")), None);
        assert_eq!(group.get_index(other_tagged.get(0).unwrap()), None);
    }

    #[test]
    fn nested_tagging_resolves_to_most_recent() {
        let (outer, tagged) = SortGroup::tag(Batch::from_payloads(["a", "b"]));
        // reverse, then re-tag with an inner group
        let reversed: Vec<Part> = tagged.into_parts().into_iter().rev().collect();
        let (inner, inner_tagged) = SortGroup::tag(Batch::from(reversed));

        let first = inner_tagged.get(0).unwrap();
        assert_eq!(inner.get_index(first), Some(0));
        assert_eq!(outer.get_index(first), Some(1));
    }

    #[test]
    fn order_keeps_subsets_sorted_and_untagged_last() {
        let (group, tagged) = SortGroup::tag(Batch::from_payloads(["a", "b", "c"]));
        let subset = vec![
            tagged.get(2).unwrap().clone(),
            Part::new("untagged"),
            tagged.get(0).unwrap().clone(),
        ];
        let ordered = group.order(subset);
        let values: Vec<&[u8]> = ordered.iter().map(|p| p.value().as_ref()).collect();
        assert_eq!(values, vec![b"a".as_ref(), b"c".as_ref(), b"untagged".as_ref()]);
    }
}

//! Pluggable page merges over keyed bucket iterables.
//!
//! A `PagingIterator` consumes one page at a time — one bucket per upstream,
//! tagged with the upstream index — and yields a merged row sequence. When
//! it cannot emit further rows without risking an ordering violation it
//! pauses and reports which upstream ran dry, so the caller can refill just
//! that one.

use std::collections::{BTreeMap, VecDeque};

use harrier_common::datum::{compare_rows_by_columns, Bucket, OwnedRow};

/// A bucket tagged with the originating upstream index. The key attributes
/// exhaustion and breaks ties in ordered merges.
#[derive(Debug, Clone)]
pub struct KeyIterable {
    key: usize,
    bucket: Bucket,
}

impl KeyIterable {
    pub fn new(key: usize, bucket: Bucket) -> Self {
        Self { key, bucket }
    }

    pub fn key(&self) -> usize {
        self.key
    }

    pub fn bucket(&self) -> &Bucket {
        &self.bucket
    }

    pub fn into_bucket(self) -> Bucket {
        self.bucket
    }
}

/// Merge discipline over pages of keyed buckets.
pub trait PagingIterator: Send {
    /// Feed the next page. Clears any pause caused by a drained upstream.
    fn merge(&mut self, page: Vec<KeyIterable>);

    /// No further pages will arrive; emit everything still buffered.
    fn finish(&mut self);

    /// The upstream this iterator is paused on, if any. `None` means the
    /// next refill should come from all upstreams.
    fn exhausted_key(&self) -> Option<usize>;

    /// The next merged row, or `None` when paused or drained.
    fn next_row(&mut self) -> Option<OwnedRow>;
}

/// Concatenates buckets in upstream-index order within each page. Never
/// pauses on a specific upstream.
#[derive(Default)]
pub struct PassThroughPagingIterator {
    queue: VecDeque<OwnedRow>,
    finished: bool,
}

impl PassThroughPagingIterator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PagingIterator for PassThroughPagingIterator {
    fn merge(&mut self, mut page: Vec<KeyIterable>) {
        page.sort_by_key(KeyIterable::key);
        for keyed in page {
            self.queue.extend(keyed.into_bucket());
        }
    }

    fn finish(&mut self) {
        self.finished = true;
    }

    fn exhausted_key(&self) -> Option<usize> {
        None
    }

    fn next_row(&mut self) -> Option<OwnedRow> {
        self.queue.pop_front()
    }
}

/// K-way ordered merge assuming every upstream delivers rows sorted by
/// `sort_columns` across its pages.
///
/// A row is only emitted while the upstream it last emitted from still has
/// buffered rows; once that upstream runs dry the merge pauses (a smaller
/// row could still arrive on its next page) until `merge` or `finish`.
pub struct SortedPagingIterator {
    sources: BTreeMap<usize, VecDeque<OwnedRow>>,
    sort_columns: Vec<(usize, bool)>,
    finished: bool,
    last_emitted: Option<usize>,
    paused_on: Option<usize>,
}

impl SortedPagingIterator {
    pub fn new(sort_columns: Vec<(usize, bool)>) -> Self {
        Self {
            sources: BTreeMap::new(),
            sort_columns,
            finished: false,
            last_emitted: None,
            paused_on: None,
        }
    }

    fn min_source(&self) -> Option<usize> {
        let mut best: Option<(usize, &OwnedRow)> = None;
        for (&key, queue) in &self.sources {
            let Some(head) = queue.front() else { continue };
            best = match best {
                None => Some((key, head)),
                Some((_, best_head))
                    if compare_rows_by_columns(head, best_head, &self.sort_columns).is_lt() =>
                {
                    Some((key, head))
                }
                other => other,
            };
        }
        best.map(|(key, _)| key)
    }
}

impl PagingIterator for SortedPagingIterator {
    fn merge(&mut self, page: Vec<KeyIterable>) {
        for keyed in page {
            let queue = self.sources.entry(keyed.key()).or_default();
            queue.extend(keyed.into_bucket());
        }
        // The refill either brought rows for the drained upstream or that
        // upstream is exhausted for good; either way emission may resume.
        self.last_emitted = None;
        self.paused_on = None;
    }

    fn finish(&mut self) {
        self.finished = true;
        self.paused_on = None;
    }

    fn exhausted_key(&self) -> Option<usize> {
        self.paused_on
    }

    fn next_row(&mut self) -> Option<OwnedRow> {
        if !self.finished {
            if let Some(key) = self.last_emitted {
                let drained = self.sources.get(&key).map_or(true, VecDeque::is_empty);
                if drained {
                    self.paused_on = Some(key);
                    return None;
                }
            }
        }
        let key = self.min_source()?;
        let row = self.sources.get_mut(&key).and_then(VecDeque::pop_front);
        if row.is_some() {
            self.last_emitted = Some(key);
        }
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harrier_common::datum::Datum;

    fn row(v: i64) -> OwnedRow {
        OwnedRow::new(vec![Datum::Int64(v)])
    }

    fn bucket(vals: &[i64]) -> Bucket {
        vals.iter().map(|&v| row(v)).collect()
    }

    fn drain(it: &mut dyn PagingIterator) -> Vec<i64> {
        let mut out = Vec::new();
        while let Some(r) = it.next_row() {
            out.push(r.get(0).and_then(Datum::as_i64).unwrap());
        }
        out
    }

    #[test]
    fn test_pass_through_concatenates_in_key_order() {
        let mut it = PassThroughPagingIterator::new();
        it.merge(vec![
            KeyIterable::new(1, bucket(&[3, 4])),
            KeyIterable::new(0, bucket(&[1, 2])),
        ]);
        assert_eq!(drain(&mut it), vec![1, 2, 3, 4]);
        assert_eq!(it.exhausted_key(), None);
    }

    #[test]
    fn test_pass_through_across_pages() {
        let mut it = PassThroughPagingIterator::new();
        it.merge(vec![KeyIterable::new(0, bucket(&[1]))]);
        assert_eq!(drain(&mut it), vec![1]);
        it.merge(vec![KeyIterable::new(0, bucket(&[2]))]);
        it.finish();
        assert_eq!(drain(&mut it), vec![2]);
    }

    #[test]
    fn test_sorted_merge_single_page() {
        let mut it = SortedPagingIterator::new(vec![(0, true)]);
        it.merge(vec![
            KeyIterable::new(0, bucket(&[1, 4])),
            KeyIterable::new(1, bucket(&[2, 3])),
        ]);
        it.finish();
        assert_eq!(drain(&mut it), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_sorted_merge_pauses_on_drained_source() {
        let mut it = SortedPagingIterator::new(vec![(0, true)]);
        it.merge(vec![
            KeyIterable::new(0, bucket(&[1, 5])),
            KeyIterable::new(1, bucket(&[3])),
        ]);
        // 1 from upstream 0, 3 from upstream 1, then upstream 1 is dry:
        // 4 could still arrive on its next page, so the merge must pause.
        assert_eq!(drain(&mut it), vec![1, 3]);
        assert_eq!(it.exhausted_key(), Some(1));

        it.merge(vec![KeyIterable::new(1, bucket(&[4]))]);
        assert_eq!(it.exhausted_key(), None);
        assert_eq!(drain(&mut it), vec![4]);
        assert_eq!(it.exhausted_key(), Some(1));

        // Upstream 1 is done for good: the refill is empty.
        it.merge(vec![KeyIterable::new(1, Bucket::empty())]);
        it.finish();
        assert_eq!(drain(&mut it), vec![5]);
    }

    #[test]
    fn test_sorted_merge_descending() {
        let mut it = SortedPagingIterator::new(vec![(0, false)]);
        it.merge(vec![
            KeyIterable::new(0, bucket(&[9, 7])),
            KeyIterable::new(1, bucket(&[8, 6])),
        ]);
        it.finish();
        assert_eq!(drain(&mut it), vec![9, 8, 7, 6]);
    }

    #[test]
    fn test_sorted_merge_tie_breaks_by_key() {
        let mut it = SortedPagingIterator::new(vec![(0, true)]);
        it.merge(vec![
            KeyIterable::new(1, bucket(&[1])),
            KeyIterable::new(0, bucket(&[1])),
        ]);
        it.finish();
        // Equal rows: the lower upstream index wins.
        let first = it.next_row().unwrap();
        assert_eq!(first.get(0).and_then(Datum::as_i64), Some(1));
        assert!(it.next_row().is_some());
        assert!(it.next_row().is_none());
    }

    #[test]
    fn test_finish_ignores_pause() {
        let mut it = SortedPagingIterator::new(vec![(0, true)]);
        it.merge(vec![
            KeyIterable::new(0, bucket(&[1])),
            KeyIterable::new(1, bucket(&[2, 3])),
        ]);
        assert_eq!(drain(&mut it), vec![1]);
        it.finish();
        assert_eq!(drain(&mut it), vec![2, 3]);
    }
}

//! Adapter from a `PagingIterator` to the batch-iterator protocol.
//!
//! Pulls a page, yields its merged rows, then asks for the next page via
//! the `fetch_more` callback — passing along which upstream the merge is
//! paused on so only that upstream gets refilled. Completion and errors are
//! reported through a one-shot completion sink on close.

use harrier_common::datum::OwnedRow;
use harrier_common::error::{HarrierError, HarrierResult};
use harrier_common::future::{KillSwitch, SharedFuture};

use crate::batch::{BatchIterator, CompletionSink};
use crate::paging::{KeyIterable, PagingIterator};

/// Asks the page source for more data; the argument is the upstream the
/// merge is paused on, `None` to refill all upstreams.
pub type FetchMoreFn = Box<dyn Fn(Option<usize>) -> SharedFuture<Vec<KeyIterable>> + Send>;

/// `true` once every upstream delivered its final bucket.
pub type UpstreamsExhaustedFn = Box<dyn Fn() -> bool + Send>;

pub struct BatchPagingIterator {
    paging: Box<dyn PagingIterator>,
    fetch_more: FetchMoreFn,
    upstreams_exhausted: UpstreamsExhaustedFn,
    on_close: Option<CompletionSink>,
    pending: Option<SharedFuture<Vec<KeyIterable>>>,
    current: Option<OwnedRow>,
    kill: KillSwitch,
    closed: bool,
}

impl BatchPagingIterator {
    pub fn new(
        paging: Box<dyn PagingIterator>,
        fetch_more: FetchMoreFn,
        upstreams_exhausted: UpstreamsExhaustedFn,
        on_close: CompletionSink,
        kill: KillSwitch,
    ) -> Self {
        Self {
            paging,
            fetch_more,
            upstreams_exhausted,
            on_close: Some(on_close),
            pending: None,
            current: None,
            kill,
            closed: false,
        }
    }

    /// Merge an arrived page into the paging iterator; once the last
    /// upstream is exhausted the merge may flush withheld rows.
    fn merge_pending(&mut self) -> HarrierResult<()> {
        let Some(pending) = &self.pending else {
            return Ok(());
        };
        let Some(result) = pending.peek() else {
            return Ok(());
        };
        self.pending = None;
        let page = result?;
        self.paging.merge(page);
        if (self.upstreams_exhausted)() {
            self.paging.finish();
        }
        Ok(())
    }
}

impl BatchIterator for BatchPagingIterator {
    fn move_next(&mut self) -> HarrierResult<bool> {
        if self.closed {
            return Err(HarrierError::illegal_state("iterator is closed"));
        }
        self.kill.check()?;
        self.merge_pending()?;
        match self.paging.next_row() {
            Some(row) => {
                self.current = Some(row);
                Ok(true)
            }
            None => {
                self.current = None;
                Ok(false)
            }
        }
    }

    fn current_row(&self) -> Option<&OwnedRow> {
        self.current.as_ref()
    }

    fn all_loaded(&self) -> bool {
        (self.upstreams_exhausted)()
    }

    fn load_next_batch(&mut self) -> HarrierResult<SharedFuture<()>> {
        if self.closed {
            return Err(HarrierError::illegal_state("iterator is closed"));
        }
        if self.all_loaded() {
            return Err(HarrierError::illegal_state("all batches already loaded"));
        }
        let page_future = match &self.pending {
            Some(pending) => pending.clone(),
            None => {
                let page_future = (self.fetch_more)(self.paging.exhausted_key());
                self.pending = Some(page_future.clone());
                page_future
            }
        };
        let loaded = SharedFuture::new();
        let signal = loaded.clone();
        page_future.on_done(move |res| match res {
            Ok(_) => {
                signal.complete(());
            }
            Err(e) => {
                signal.fail(e.clone());
            }
        });
        Ok(loaded)
    }

    fn move_to_start(&mut self) -> HarrierResult<()> {
        Err(HarrierError::illegal_state(
            "a paged merge cannot be rewound; materialize upstream instead",
        ))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Some(sink) = self.on_close.take() {
                sink(self.kill.cause());
            }
        }
    }

    fn kill_handle(&self) -> KillSwitch {
        self.kill.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::PassThroughPagingIterator;
    use harrier_common::datum::{Bucket, Datum};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn bucket(vals: &[i64]) -> Bucket {
        vals.iter()
            .map(|&v| OwnedRow::new(vec![Datum::Int64(v)]))
            .collect()
    }

    struct PageSource {
        pages: Mutex<Vec<Vec<KeyIterable>>>,
        exhausted: Arc<AtomicBool>,
    }

    fn iterator_over(pages: Vec<Vec<KeyIterable>>) -> (BatchPagingIterator, Arc<AtomicBool>, Arc<Mutex<Option<Option<HarrierError>>>>) {
        let exhausted = Arc::new(AtomicBool::new(false));
        let source = Arc::new(PageSource {
            pages: Mutex::new(pages),
            exhausted: Arc::clone(&exhausted),
        });
        let completion: Arc<Mutex<Option<Option<HarrierError>>>> = Arc::new(Mutex::new(None));
        let completion2 = Arc::clone(&completion);
        let exhausted_flag = Arc::clone(&exhausted);
        let it = BatchPagingIterator::new(
            Box::new(PassThroughPagingIterator::new()),
            Box::new(move |_| {
                let mut pages = source.pages.lock();
                let page = pages.remove(0);
                if pages.is_empty() {
                    source.exhausted.store(true, Ordering::SeqCst);
                }
                SharedFuture::completed(page)
            }),
            Box::new(move || exhausted_flag.load(Ordering::SeqCst)),
            Box::new(move |cause| *completion2.lock() = Some(cause)),
            KillSwitch::new(),
        );
        (it, exhausted, completion)
    }

    fn drain(it: &mut BatchPagingIterator) -> Vec<i64> {
        let mut out = Vec::new();
        while it.move_next().unwrap() {
            out.push(it.current_row().unwrap().get(0).and_then(Datum::as_i64).unwrap());
        }
        out
    }

    #[test]
    fn test_pages_flow_until_exhausted() {
        let (mut it, _, completion) = iterator_over(vec![
            vec![KeyIterable::new(0, bucket(&[1, 2]))],
            vec![KeyIterable::new(0, bucket(&[3]))],
        ]);
        let mut rows = Vec::new();
        loop {
            rows.extend(drain(&mut it));
            if it.all_loaded() {
                break;
            }
            it.load_next_batch().unwrap().wait().unwrap();
        }
        it.close();
        assert_eq!(rows, vec![1, 2, 3]);
        assert!(completion.lock().as_ref().unwrap().is_none());
    }

    #[test]
    fn test_load_after_exhausted_is_protocol_error() {
        let (mut it, exhausted, _) = iterator_over(vec![vec![KeyIterable::new(0, bucket(&[1]))]]);
        exhausted.store(true, Ordering::SeqCst);
        assert!(it.load_next_batch().unwrap_err().is_protocol_violation());
    }

    #[test]
    fn test_kill_fails_move_next_and_close_reports_cause() {
        let (mut it, _, completion) = iterator_over(vec![vec![KeyIterable::new(0, bucket(&[1]))]]);
        it.kill_handle().kill(HarrierError::job_killed());
        assert!(it.move_next().unwrap_err().is_cancellation());
        it.close();
        let guard = completion.lock();
        let cause = guard.as_ref().unwrap();
        assert!(cause.as_ref().unwrap().is_cancellation());
    }

    #[test]
    fn test_failed_page_future_surfaces_on_move_next() {
        let completion: Arc<Mutex<Option<Option<HarrierError>>>> = Arc::new(Mutex::new(None));
        let completion2 = Arc::clone(&completion);
        let mut it = BatchPagingIterator::new(
            Box::new(PassThroughPagingIterator::new()),
            Box::new(|_| SharedFuture::failed(HarrierError::Upstream("peer died".into()))),
            Box::new(|| false),
            Box::new(move |cause| *completion2.lock() = Some(cause)),
            KillSwitch::new(),
        );
        let loaded = it.load_next_batch().unwrap();
        assert!(loaded.wait().is_err());
        let err = it.move_next().unwrap_err();
        assert_eq!(err.kind(), harrier_common::error::ErrorKind::Upstream);
    }

    #[test]
    fn test_move_to_start_unsupported() {
        let (mut it, _, _) = iterator_over(vec![vec![]]);
        assert!(it.move_to_start().unwrap_err().is_protocol_violation());
    }
}

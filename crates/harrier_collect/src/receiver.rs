//! Page-synchronized merging of upstream bucket streams.
//!
//! N upstream peers each push one bucket per page; a page is complete once
//! every upstream contributed. Complete pages are handed to a pluggable
//! `PagingIterator` feeding a `BatchIterator` the downstream consumer
//! drives. The first page is pushed before anyone pulls; from the first
//! `fetch_more` on, upstreams only send when asked (backpressure).
//!
//! Two locks guard the state: the membership lock covers which upstreams
//! exist and their backpressure listeners; the page lock covers the current
//! page and the exhaustion set. They are never held at the same time, and
//! listener callbacks run outside both.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use harrier_common::datum::Bucket;
use harrier_common::error::{HarrierError, ProtocolError};
use harrier_common::future::{KillSwitch, SharedFuture};
use harrier_common::types::PhaseId;
use harrier_executor::batch::{BatchIterator, InMemoryBatchIterator, RowConsumer};
use harrier_executor::batch_paging::BatchPagingIterator;
use harrier_executor::paging::{KeyIterable, PagingIterator};
use harrier_executor::pool::ThreadPool;

use crate::streamer::Streamer;

/// Backpressure callback of one upstream. `need_more(true)` asks for the
/// next page, `need_more(false)` permanently releases the upstream.
pub trait PageResultListener: Send {
    fn need_more(&self, need_more: bool);
}

/// The receiving end of a distributed result stream, exposed to the
/// transport layer.
pub trait PageBucketReceiver: Send + Sync {
    fn set_bucket(
        &self,
        bucket_idx: usize,
        rows: Bucket,
        is_last: bool,
        listener: Box<dyn PageResultListener>,
    );

    /// Wire encoders for this phase's output types, treated opaquely.
    fn streamers(&self) -> &[Streamer];

    /// Resolves when the phase is terminal.
    fn completion_future(&self) -> SharedFuture<()>;

    /// Retained for interface symmetry; rows are consumed by the downstream
    /// consumer driving the batch iterator.
    fn consume_rows(&self) {}

    fn kill(&self, cause: HarrierError);
}

struct Membership {
    /// Every upstream index that ever sent a bucket.
    buckets: BTreeSet<usize>,
    /// Backpressure listeners of upstreams that are not exhausted.
    listeners: HashMap<usize, Box<dyn PageResultListener>>,
    /// Terminal cause, set on kill. Late buckets are released immediately.
    last_error: Option<HarrierError>,
}

struct PageState {
    /// The current page: upstream index → bucket. Exhausted upstreams keep
    /// an empty placeholder so the completion predicate still fires.
    buckets_by_idx: BTreeMap<usize, Bucket>,
    /// Upstreams that sent their final bucket. Monotonic.
    exhausted: BTreeSet<usize>,
}

pub struct CumulativePageBucketReceiver {
    node_name: String,
    phase_id: PhaseId,
    executor: Arc<ThreadPool>,
    streamers: Vec<Streamer>,
    num_buckets: usize,
    membership: Mutex<Membership>,
    page: Mutex<PageState>,
    processing_future: SharedFuture<()>,
    current_loading_page: Mutex<SharedFuture<Vec<KeyIterable>>>,
    /// True until the downstream first requests more; models the push→pull
    /// transition of the first page.
    first_fetch_more: AtomicBool,
    kill_switch: KillSwitch,
}

impl CumulativePageBucketReceiver {
    /// Wires the merge pipeline and hands the batch iterator to
    /// `row_consumer`. With `num_buckets == 0` the consumer receives an
    /// already-exhausted iterator whose close resolves the processing
    /// future.
    pub fn new(
        node_name: impl Into<String>,
        phase_id: PhaseId,
        executor: Arc<ThreadPool>,
        streamers: Vec<Streamer>,
        row_consumer: Arc<dyn RowConsumer>,
        paging_iterator: Box<dyn PagingIterator>,
        num_buckets: usize,
    ) -> Arc<Self> {
        let receiver = Arc::new(Self {
            node_name: node_name.into(),
            phase_id,
            executor,
            streamers,
            num_buckets,
            membership: Mutex::new(Membership {
                buckets: BTreeSet::new(),
                listeners: HashMap::new(),
                last_error: None,
            }),
            page: Mutex::new(PageState {
                buckets_by_idx: BTreeMap::new(),
                exhausted: BTreeSet::new(),
            }),
            processing_future: SharedFuture::new(),
            current_loading_page: Mutex::new(SharedFuture::new()),
            first_fetch_more: AtomicBool::new(true),
            kill_switch: KillSwitch::new(),
        });

        // No upstream may wait for a signal once the stream is terminal.
        let weak: Weak<Self> = Arc::downgrade(&receiver);
        receiver.processing_future.on_done(move |_| {
            if let Some(recv) = weak.upgrade() {
                recv.release_remaining_listeners();
            }
        });

        let iterator: Box<dyn BatchIterator> = if num_buckets == 0 {
            let processing = receiver.processing_future.clone();
            Box::new(
                InMemoryBatchIterator::empty().with_completion_sink(Box::new(move |cause| {
                    match cause {
                        None => {
                            processing.complete(());
                        }
                        Some(e) => {
                            processing.fail(e);
                        }
                    }
                })),
            )
        } else {
            let fetch = Arc::clone(&receiver);
            let gate = Arc::clone(&receiver);
            let processing = receiver.processing_future.clone();
            Box::new(BatchPagingIterator::new(
                paging_iterator,
                Box::new(move |exhausted_bucket| fetch.fetch_more(exhausted_bucket)),
                Box::new(move || gate.all_upstreams_exhausted()),
                Box::new(move |cause| match cause {
                    None => {
                        processing.complete(());
                    }
                    Some(e) => {
                        processing.fail(e);
                    }
                }),
                receiver.kill_switch.clone(),
            ))
        };
        row_consumer.accept(Ok(iterator));
        receiver
    }

    /// Snapshot the completed page. Exhausted upstreams leave an empty
    /// placeholder behind (they contribute nothing more but must keep the
    /// completion predicate satisfiable); live upstreams vacate their slot
    /// for the next page.
    fn snapshot_page(&self) -> Vec<KeyIterable> {
        let mut page_state = self.page.lock();
        let indexes: Vec<usize> = page_state.buckets_by_idx.keys().copied().collect();
        let mut page = Vec::with_capacity(indexes.len());
        for idx in indexes {
            let taken = if page_state.exhausted.contains(&idx) {
                page_state.buckets_by_idx.insert(idx, Bucket::empty())
            } else {
                page_state.buckets_by_idx.remove(&idx)
            };
            if let Some(bucket) = taken {
                page.push(KeyIterable::new(idx, bucket));
            }
        }
        page
    }

    fn all_upstreams_exhausted(&self) -> bool {
        // The gate keeps this false until the downstream observed page one.
        self.page.lock().exhausted.len() == self.num_buckets
            && !self.first_fetch_more.load(Ordering::SeqCst)
    }

    /// Called by the batch iterator when the merge consumed what it can.
    fn fetch_more(&self, exhausted_bucket: Option<usize>) -> SharedFuture<Vec<KeyIterable>> {
        // The first page is pushed without the merge requesting any data;
        // switch to pull mode by handing out the page already loading.
        if self
            .first_fetch_more
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return self.current_loading_page.lock().clone();
        }
        let next_page = SharedFuture::new();
        *self.current_loading_page.lock() = next_page.clone();
        let refill_all = match exhausted_bucket {
            None => true,
            Some(idx) => self.page.lock().exhausted.contains(&idx),
        };
        if refill_all {
            self.fetch_from_unexhausted();
        } else if let Some(idx) = exhausted_bucket {
            self.fetch_exhausted(idx);
        }
        next_page
    }

    /// Refill one specific upstream the merge drained.
    fn fetch_exhausted(&self, exhausted_bucket: usize) {
        let listener = {
            let mut membership = self.membership.lock();
            let others: Vec<usize> = membership
                .buckets
                .iter()
                .copied()
                .filter(|&idx| idx != exhausted_bucket)
                .collect();
            let listener = membership.listeners.remove(&exhausted_bucket);
            drop(membership);

            // Only one upstream is asked for data; fill in the other slots
            // so the single arriving bucket completes the page.
            let mut page_state = self.page.lock();
            for idx in others {
                page_state.buckets_by_idx.entry(idx).or_insert_with(Bucket::empty);
            }
            listener
        };
        match listener {
            Some(listener) => listener.need_more(true),
            None => tracing::error!(
                phase_id = %self.phase_id,
                bucket = exhausted_bucket,
                "no listener for refill of drained upstream"
            ),
        }
    }

    /// Ask every non-exhausted upstream for its next page.
    fn fetch_from_unexhausted(&self) {
        let listeners: Vec<Box<dyn PageResultListener>> = {
            let mut membership = self.membership.lock();
            membership.listeners.drain().map(|(_, l)| l).collect()
        };
        for listener in listeners {
            listener.need_more(true);
        }
    }

    fn release_remaining_listeners(&self) {
        let listeners: Vec<Box<dyn PageResultListener>> = {
            let mut membership = self.membership.lock();
            membership.listeners.drain().map(|(_, l)| l).collect()
        };
        for listener in listeners {
            listener.need_more(false);
        }
    }
}

impl PageBucketReceiver for CumulativePageBucketReceiver {
    fn set_bucket(
        &self,
        bucket_idx: usize,
        rows: Bucket,
        is_last: bool,
        listener: Box<dyn PageResultListener>,
    ) {
        let released = {
            let mut membership = self.membership.lock();
            membership.buckets.insert(bucket_idx);
            if !is_last && membership.last_error.is_none() {
                membership.listeners.insert(bucket_idx, listener);
                None
            } else {
                Some(listener)
            }
        };
        if let Some(listener) = released {
            listener.need_more(false);
        }

        tracing::trace!(phase_id = %self.phase_id, bucket = bucket_idx, "set_bucket");

        let (duplicate, page_complete) = {
            let mut page_state = self.page.lock();
            let duplicate = page_state.buckets_by_idx.contains_key(&bucket_idx);
            if !duplicate {
                page_state.buckets_by_idx.insert(bucket_idx, rows);
            }
            if is_last {
                page_state.exhausted.insert(bucket_idx);
            }
            (duplicate, page_state.buckets_by_idx.len() == self.num_buckets)
        };

        if duplicate {
            let err: HarrierError = ProtocolError::DuplicateBucket {
                node: self.node_name.clone(),
                phase_id: self.phase_id,
                bucket: bucket_idx,
            }
            .into();
            tracing::error!(phase_id = %self.phase_id, bucket = bucket_idx, "duplicate bucket within a page");
            self.processing_future.fail(err.clone());
            // Unpark a consumer waiting on the never-completing page.
            self.current_loading_page.lock().clone().fail(err);
        }

        if page_complete {
            let page = self.snapshot_page();
            let future = self.current_loading_page.lock().clone();
            let job = Box::new(move || {
                future.complete(page);
            });
            if let Err(job) = self.executor.submit(job) {
                // Forward progress outweighs strict off-thread completion.
                tracing::debug!(
                    phase_id = %self.phase_id,
                    "page-completion dispatch rejected; completing inline"
                );
                job();
            }
        }
    }

    fn streamers(&self) -> &[Streamer] {
        &self.streamers
    }

    fn completion_future(&self) -> SharedFuture<()> {
        self.processing_future.clone()
    }

    fn kill(&self, cause: HarrierError) {
        self.membership.lock().last_error = Some(cause.clone());
        self.kill_switch.kill(cause.clone());
        self.processing_future.fail(cause.clone());
        self.current_loading_page.lock().clone().fail(cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harrier_common::datum::{Datum, OwnedRow};
    use harrier_executor::consumer::CollectingRowConsumer;
    use harrier_executor::paging::PassThroughPagingIterator;
    use harrier_executor::pool::{ThreadPool, ThreadPoolName};
    use std::time::Duration;

    struct RecordingListener {
        signals: Arc<Mutex<Vec<bool>>>,
    }

    impl RecordingListener {
        fn new() -> (Arc<Mutex<Vec<bool>>>, Box<dyn PageResultListener>) {
            let signals = Arc::new(Mutex::new(Vec::new()));
            let listener = RecordingListener {
                signals: Arc::clone(&signals),
            };
            (signals, Box::new(listener))
        }
    }

    impl PageResultListener for RecordingListener {
        fn need_more(&self, need_more: bool) {
            self.signals.lock().push(need_more);
        }
    }

    fn row(v: i64) -> OwnedRow {
        OwnedRow::new(vec![Datum::Int64(v)])
    }

    fn bucket(vals: &[i64]) -> Bucket {
        vals.iter().map(|&v| row(v)).collect()
    }

    fn receiver_with(
        num_buckets: usize,
    ) -> (Arc<CumulativePageBucketReceiver>, Arc<CollectingRowConsumer>) {
        let pool = ThreadPool::new(ThreadPoolName::Search, 2, 64);
        let consumer = CollectingRowConsumer::new();
        let receiver = CumulativePageBucketReceiver::new(
            "n1",
            PhaseId(1),
            pool,
            Vec::new(),
            consumer.clone(),
            Box::new(PassThroughPagingIterator::new()),
            num_buckets,
        );
        (receiver, consumer)
    }

    fn await_done(consumer: &CollectingRowConsumer) -> Result<(), HarrierError> {
        consumer
            .completion_future()
            .wait_timeout(Duration::from_secs(5))
            .expect("consumer did not finish in time")
    }

    #[test]
    fn test_single_page_single_upstream() {
        let (receiver, consumer) = receiver_with(1);
        let (signals, listener) = RecordingListener::new();
        receiver.set_bucket(0, bucket(&[1, 2, 3]), true, listener);
        await_done(&consumer).unwrap();
        assert_eq!(consumer.rows().len(), 3);
        assert_eq!(&*signals.lock(), &[false]);
        assert!(receiver.completion_future().peek().unwrap().is_ok());
    }

    #[test]
    fn test_two_upstreams_two_pages() {
        let (receiver, consumer) = receiver_with(2);
        let (s0, l0) = RecordingListener::new();
        let (s1, l1) = RecordingListener::new();
        receiver.set_bucket(0, bucket(&[1, 2]), false, l0);
        receiver.set_bucket(1, bucket(&[3, 4]), false, l1);

        // Wait for the pull: both listeners must be asked for page two.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while s0.lock().is_empty() || s1.lock().is_empty() {
            assert!(std::time::Instant::now() < deadline, "no backpressure signal");
            std::thread::yield_now();
        }
        assert_eq!(&*s0.lock(), &[true]);
        assert_eq!(&*s1.lock(), &[true]);

        let (s0b, l0b) = RecordingListener::new();
        let (s1b, l1b) = RecordingListener::new();
        receiver.set_bucket(0, bucket(&[5]), true, l0b);
        receiver.set_bucket(1, bucket(&[6]), true, l1b);

        await_done(&consumer).unwrap();
        let mut values: Vec<i64> = consumer
            .rows()
            .iter()
            .map(|r| r.get(0).and_then(Datum::as_i64).unwrap())
            .collect();
        values.sort_unstable();
        assert_eq!(values, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(&*s0b.lock(), &[false]);
        assert_eq!(&*s1b.lock(), &[false]);
    }

    #[test]
    fn test_duplicate_bucket_fails_stream() {
        let (receiver, consumer) = receiver_with(2);
        let (_, l0) = RecordingListener::new();
        let (_, l0b) = RecordingListener::new();
        receiver.set_bucket(0, bucket(&[1]), false, l0);
        receiver.set_bucket(0, bucket(&[2]), false, l0b);

        let err = receiver.completion_future().wait().unwrap_err();
        match err {
            HarrierError::Protocol(ProtocolError::DuplicateBucket { bucket, .. }) => {
                assert_eq!(bucket, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(await_done(&consumer).is_err());
        assert!(consumer.rows().is_empty(), "partial page must not be delivered");
    }

    #[test]
    fn test_kill_unblocks_and_releases_late_buckets() {
        let (receiver, consumer) = receiver_with(2);
        receiver.kill(HarrierError::job_killed());

        let err = receiver.completion_future().wait().unwrap_err();
        assert!(err.is_cancellation());
        assert!(await_done(&consumer).is_err());

        // A bucket arriving after the kill is released immediately.
        let (signals, listener) = RecordingListener::new();
        receiver.set_bucket(0, bucket(&[1]), false, listener);
        assert_eq!(&*signals.lock(), &[false]);
        assert!(consumer.rows().is_empty());
    }

    #[test]
    fn test_zero_upstreams_completes_empty() {
        let (receiver, consumer) = receiver_with(0);
        await_done(&consumer).unwrap();
        assert!(consumer.rows().is_empty());
        assert!(receiver.completion_future().peek().unwrap().is_ok());
    }

    #[test]
    fn test_listener_kept_until_completion_then_released() {
        let (receiver, consumer) = receiver_with(2);
        let (s0, l0) = RecordingListener::new();
        receiver.set_bucket(0, bucket(&[1]), false, l0);
        assert!(s0.lock().is_empty(), "listener must be stashed, not signalled");

        let (s1, l1) = RecordingListener::new();
        receiver.set_bucket(1, bucket(&[2]), true, l1);
        assert_eq!(&*s1.lock(), &[false], "final bucket never gets a listener slot");

        // Merge drains upstream 1 (exhausted) and pauses; the refill goes to
        // upstream 0 only. Exhaust it so the stream completes.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while s0.lock().is_empty() {
            assert!(std::time::Instant::now() < deadline, "upstream 0 never asked for more");
            std::thread::yield_now();
        }
        assert_eq!(&*s0.lock(), &[true]);
        let (s0b, l0b) = RecordingListener::new();
        receiver.set_bucket(0, bucket(&[3]), true, l0b);
        await_done(&consumer).unwrap();
        assert_eq!(consumer.rows().len(), 3);
        assert_eq!(&*s0b.lock(), &[false]);
    }

    #[test]
    fn test_streamers_exposed() {
        let pool = ThreadPool::new(ThreadPoolName::Search, 1, 8);
        let consumer = CollectingRowConsumer::new();
        let receiver = CumulativePageBucketReceiver::new(
            "n1",
            PhaseId(9),
            pool,
            crate::streamer::streamers_for(&[harrier_common::types::DataType::Int64]),
            consumer,
            Box::new(PassThroughPagingIterator::new()),
            0,
        );
        assert_eq!(receiver.streamers().len(), 1);
    }
}

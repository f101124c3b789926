//! The pull-based batch-iterator protocol.
//!
//! A `BatchIterator` is a cursor over rows that arrive in batches. The
//! consumer drives it: `move_next` until it returns `false`, then either
//! stop (`all_loaded`) or suspend on the future returned by
//! `load_next_batch` and resume. Cancellation is cooperative through a
//! shared `KillSwitch` checked on every advance.

use harrier_common::datum::OwnedRow;
use harrier_common::error::{HarrierError, HarrierResult};
use harrier_common::future::{KillSwitch, SharedFuture};

/// Invoked exactly once when an iterator is closed, carrying the kill cause
/// if the iterator was killed before the close.
pub type CompletionSink = Box<dyn FnOnce(Option<HarrierError>) + Send>;

/// A pull-based row cursor loading data in batches.
pub trait BatchIterator: Send {
    /// Advance to the next row of the loaded data. `Ok(false)` signals a
    /// batch boundary; check `all_loaded` to distinguish "stream done" from
    /// "more batches available".
    fn move_next(&mut self) -> HarrierResult<bool>;

    /// The row the cursor is on, valid until the next `move_next`.
    fn current_row(&self) -> Option<&OwnedRow>;

    /// `true` once no further batch can be loaded.
    fn all_loaded(&self) -> bool;

    /// Request the next batch. The returned future resolves when the batch
    /// is available for `move_next`. Calling this while `all_loaded` is a
    /// protocol error.
    fn load_next_batch(&mut self) -> HarrierResult<SharedFuture<()>>;

    /// Rewind to before the first row. Only supported by restartable
    /// iterators; requested via the `support_move_to_start` flag at
    /// construction sites.
    fn move_to_start(&mut self) -> HarrierResult<()>;

    /// Release resources. Idempotent.
    fn close(&mut self);

    /// Shared cancellation handle. Killing it makes every subsequent
    /// `move_next` fail with the cause.
    fn kill_handle(&self) -> KillSwitch;
}

/// A consumer of one phase's row stream. `accept` is called exactly once,
/// either with the iterator to drive or with the failure that prevented its
/// creation.
pub trait RowConsumer: Send + Sync {
    fn accept(&self, iterator: HarrierResult<Box<dyn BatchIterator>>);

    /// Resolves when the consumer finished (successfully or not) and
    /// released the iterator.
    fn completion_future(&self) -> SharedFuture<()>;

    /// `true` demands a restartable iterator (`move_to_start` support).
    fn requires_scroll(&self) -> bool {
        false
    }
}

/// An iterator over rows that are fully in memory. `all_loaded` from the
/// start, restartable.
pub struct InMemoryBatchIterator {
    rows: Vec<OwnedRow>,
    cursor: usize,
    current: Option<usize>,
    kill: KillSwitch,
    closed: bool,
    on_close: Option<CompletionSink>,
}

impl InMemoryBatchIterator {
    pub fn new(rows: Vec<OwnedRow>) -> Self {
        Self {
            rows,
            cursor: 0,
            current: None,
            kill: KillSwitch::new(),
            closed: false,
            on_close: None,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Attach a sink invoked on close, used to resolve a processing future
    /// when the stream has no upstreams at all.
    pub fn with_completion_sink(mut self, sink: CompletionSink) -> Self {
        self.on_close = Some(sink);
        self
    }
}

impl BatchIterator for InMemoryBatchIterator {
    fn move_next(&mut self) -> HarrierResult<bool> {
        if self.closed {
            return Err(HarrierError::illegal_state("iterator is closed"));
        }
        self.kill.check()?;
        if self.cursor < self.rows.len() {
            self.current = Some(self.cursor);
            self.cursor += 1;
            Ok(true)
        } else {
            self.current = None;
            Ok(false)
        }
    }

    fn current_row(&self) -> Option<&OwnedRow> {
        self.current.and_then(|i| self.rows.get(i))
    }

    fn all_loaded(&self) -> bool {
        true
    }

    fn load_next_batch(&mut self) -> HarrierResult<SharedFuture<()>> {
        Err(HarrierError::illegal_state("all batches already loaded"))
    }

    fn move_to_start(&mut self) -> HarrierResult<()> {
        self.cursor = 0;
        self.current = None;
        Ok(())
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

type RowsLoader = Box<dyn FnOnce() -> SharedFuture<Vec<OwnedRow>> + Send>;

/// An iterator whose single batch is produced asynchronously and then
/// materialized, which makes it restartable.
///
/// The loader itself cannot be interrupted (it may be a remote call); kill
/// takes effect on the next `move_next` once the rows are local.
pub struct CollectingBatchIterator {
    loader: Option<RowsLoader>,
    pending: Option<SharedFuture<Vec<OwnedRow>>>,
    rows: Option<Vec<OwnedRow>>,
    cursor: usize,
    current: Option<usize>,
    kill: KillSwitch,
    closed: bool,
}

impl CollectingBatchIterator {
    pub fn new(loader: RowsLoader) -> Self {
        Self {
            loader: Some(loader),
            pending: None,
            rows: None,
            cursor: 0,
            current: None,
            kill: KillSwitch::new(),
            closed: false,
        }
    }
}

impl BatchIterator for CollectingBatchIterator {
    fn move_next(&mut self) -> HarrierResult<bool> {
        if self.closed {
            return Err(HarrierError::illegal_state("iterator is closed"));
        }
        self.kill.check()?;
        if self.rows.is_none() {
            let loaded = match &self.pending {
                Some(pending) => pending.peek(),
                None => None,
            };
            match loaded {
                Some(Ok(rows)) => {
                    self.rows = Some(rows);
                    self.pending = None;
                }
                Some(Err(e)) => return Err(e),
                None => {
                    self.current = None;
                    return Ok(false);
                }
            }
        }
        let loaded_len = self.rows.as_ref().map(Vec::len).unwrap_or(0);
        if self.cursor < loaded_len {
            self.current = Some(self.cursor);
            self.cursor += 1;
            Ok(true)
        } else {
            self.current = None;
            Ok(false)
        }
    }

    fn current_row(&self) -> Option<&OwnedRow> {
        match (&self.rows, self.current) {
            (Some(rows), Some(i)) => rows.get(i),
            _ => None,
        }
    }

    fn all_loaded(&self) -> bool {
        self.rows.is_some()
    }

    fn load_next_batch(&mut self) -> HarrierResult<SharedFuture<()>> {
        if self.closed {
            return Err(HarrierError::illegal_state("iterator is closed"));
        }
        if self.rows.is_some() {
            return Err(HarrierError::illegal_state("all batches already loaded"));
        }
        if self.pending.is_none() {
            let loader = self
                .loader
                .take()
                .ok_or_else(|| HarrierError::Internal("batch loader invoked twice".into()))?;
            self.pending = Some(loader());
        }
        let loaded = SharedFuture::new();
        let signal = loaded.clone();
        if let Some(pending) = &self.pending {
            pending.on_done(move |res| match res {
                Ok(_) => {
                    signal.complete(());
                }
                Err(e) => {
                    signal.fail(e.clone());
                }
            });
        }
        Ok(loaded)
    }

    fn move_to_start(&mut self) -> HarrierResult<()> {
        if self.rows.is_none() {
            return Err(HarrierError::illegal_state("cannot rewind before the batch is loaded"));
        }
        self.cursor = 0;
        self.current = None;
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn kill_handle(&self) -> KillSwitch {
        self.kill.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harrier_common::datum::Datum;

    fn rows(n: i64) -> Vec<OwnedRow> {
        (0..n).map(|i| OwnedRow::new(vec![Datum::Int64(i)])).collect()
    }

    fn drain(it: &mut dyn BatchIterator) -> Vec<OwnedRow> {
        let mut out = Vec::new();
        while it.move_next().unwrap() {
            out.push(it.current_row().cloned().unwrap());
        }
        out
    }

    #[test]
    fn test_in_memory_iteration() {
        let mut it = InMemoryBatchIterator::new(rows(3));
        assert!(it.all_loaded());
        assert_eq!(drain(&mut it).len(), 3);
        assert!(!it.move_next().unwrap());
    }

    #[test]
    fn test_in_memory_move_to_start() {
        let mut it = InMemoryBatchIterator::new(rows(2));
        drain(&mut it);
        it.move_to_start().unwrap();
        assert_eq!(drain(&mut it).len(), 2);
    }

    #[test]
    fn test_in_memory_load_next_batch_is_protocol_error() {
        let mut it = InMemoryBatchIterator::new(rows(1));
        assert!(it.load_next_batch().unwrap_err().is_protocol_violation());
    }

    #[test]
    fn test_in_memory_kill_fails_move_next() {
        let mut it = InMemoryBatchIterator::new(rows(3));
        it.kill_handle().kill(HarrierError::job_killed());
        assert!(it.move_next().unwrap_err().is_cancellation());
    }

    #[test]
    fn test_in_memory_close_sink_sees_kill_cause() {
        let seen = std::sync::Arc::new(parking_lot::Mutex::new(None));
        let seen2 = std::sync::Arc::clone(&seen);
        let mut it = InMemoryBatchIterator::empty()
            .with_completion_sink(Box::new(move |cause| *seen2.lock() = Some(cause)));
        it.kill_handle().kill(HarrierError::job_killed());
        it.close();
        it.close();
        let guard = seen.lock();
        let cause = guard.as_ref().unwrap();
        assert!(cause.as_ref().unwrap().is_cancellation());
    }

    #[test]
    fn test_collecting_iterator_loads_once() {
        let fut: SharedFuture<Vec<OwnedRow>> = SharedFuture::new();
        let loader_fut = fut.clone();
        let mut it = CollectingBatchIterator::new(Box::new(move || loader_fut));

        assert!(!it.all_loaded());
        assert!(!it.move_next().unwrap());
        let loaded = it.load_next_batch().unwrap();
        assert!(!loaded.is_done());

        fut.complete(rows(2));
        loaded.wait().unwrap();
        assert_eq!(drain(&mut it).len(), 2);
        assert!(it.all_loaded());
        it.move_to_start().unwrap();
        assert_eq!(drain(&mut it).len(), 2);
    }

    #[test]
    fn test_collecting_iterator_load_failure_surfaces_in_move_next() {
        let fut: SharedFuture<Vec<OwnedRow>> = SharedFuture::new();
        let loader_fut = fut.clone();
        let mut it = CollectingBatchIterator::new(Box::new(move || loader_fut));
        let loaded = it.load_next_batch().unwrap();
        fut.fail(HarrierError::Upstream("records gone".into()));
        assert!(loaded.wait().is_err());
        assert_eq!(it.move_next().unwrap_err().kind(), harrier_common::error::ErrorKind::Upstream);
    }

    #[test]
    fn test_collecting_iterator_load_after_done_is_protocol_error() {
        let mut it = CollectingBatchIterator::new(Box::new(|| SharedFuture::completed(rows(1))));
        it.load_next_batch().unwrap().wait().unwrap();
        drain(&mut it);
        assert!(it.load_next_batch().unwrap_err().is_protocol_violation());
    }
}

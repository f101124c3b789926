//! A consumer that drains a batch iterator into memory.
//!
//! Used wherever the full result of a phase is wanted as a plain row list:
//! the driver of a local collect and the receiving end of tests. Rows are
//! drained on a dedicated thread so that whoever hands over the iterator
//! (typically a network or coordinator thread) is never blocked.

use std::sync::Arc;

use parking_lot::Mutex;

use harrier_common::datum::OwnedRow;
use harrier_common::error::{HarrierError, HarrierResult};
use harrier_common::future::SharedFuture;

use crate::batch::{BatchIterator, RowConsumer};

pub struct CollectingRowConsumer {
    rows: Arc<Mutex<Vec<OwnedRow>>>,
    completion: SharedFuture<()>,
    requires_scroll: bool,
}

impl CollectingRowConsumer {
    pub fn new() -> Arc<Self> {
        Self::with_scroll(false)
    }

    /// A consumer that demands a restartable iterator.
    pub fn with_scroll(requires_scroll: bool) -> Arc<Self> {
        Arc::new(Self {
            rows: Arc::new(Mutex::new(Vec::new())),
            completion: SharedFuture::new(),
            requires_scroll,
        })
    }

    /// The rows collected so far. Complete once `completion_future`
    /// resolved successfully.
    pub fn rows(&self) -> Vec<OwnedRow> {
        self.rows.lock().clone()
    }
}

impl RowConsumer for CollectingRowConsumer {
    fn accept(&self, iterator: HarrierResult<Box<dyn BatchIterator>>) {
        let mut iterator = match iterator {
            Ok(it) => it,
            Err(e) => {
                self.completion.fail(e);
                return;
            }
        };
        let rows = Arc::clone(&self.rows);
        let completion = self.completion.clone();
        let spawned = std::thread::Builder::new()
            .name("harrier-consume".into())
            .spawn(move || {
                let result = drive(iterator.as_mut(), &rows);
                iterator.close();
                match result {
                    Ok(()) => {
                        completion.complete(());
                    }
                    Err(e) => {
                        completion.fail(e);
                    }
                }
            });
        if let Err(e) = spawned {
            self.completion
                .fail(HarrierError::Internal(format!("failed to spawn consumer thread: {e}")));
        }
    }

    fn completion_future(&self) -> SharedFuture<()> {
        self.completion.clone()
    }

    fn requires_scroll(&self) -> bool {
        self.requires_scroll
    }
}

fn drive(it: &mut dyn BatchIterator, rows: &Mutex<Vec<OwnedRow>>) -> HarrierResult<()> {
    loop {
        while it.move_next()? {
            let row = it
                .current_row()
                .cloned()
                .ok_or_else(|| HarrierError::Internal("move_next true without a current row".into()))?;
            rows.lock().push(row);
        }
        if it.all_loaded() {
            return Ok(());
        }
        it.load_next_batch()?.wait()?;
    }
}

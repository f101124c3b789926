//! Per-phase lifecycle and resource ownership.
//!
//! A `CollectTask` owns everything one collect phase holds on a node:
//! searchers over shard snapshots, ram accounting and the batch iterator
//! produced by its `CollectSource`. The lifecycle is a single atomic state
//! machine, CREATED → PREPARED → RUNNING → STOPPED, where `kill` jumps to
//! STOPPED from any state and acts on the state it displaced.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use harrier_common::error::{HarrierError, HarrierResult, ProtocolError};
use harrier_common::future::{KillSwitch, SharedFuture};
use harrier_common::types::{PhaseId, ShardId};
use harrier_executor::batch::{BatchIterator, RowConsumer};
use harrier_executor::pool::{Job, ThreadPoolName, ThreadPools};
use harrier_executor::ram::RamAccounting;

use crate::phase::{CollectPhase, RowGranularity};
use crate::source::CollectSource;

/// Reported through the completion future when a phase terminates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionState {
    pub bytes_used: u64,
}

/// A resource handle over a shard snapshot, owned for the task's lifetime.
pub trait Searcher: Send {
    fn close(&mut self) -> HarrierResult<()>;
}

/// Shard contexts shared between the phases of one job on this node.
#[derive(Debug, Clone, Default)]
pub struct SharedShardContexts {
    shards: Vec<ShardId>,
}

impl SharedShardContexts {
    pub fn new(shards: Vec<ShardId>) -> Self {
        Self { shards }
    }

    pub fn assigned_shards(&self) -> &[ShardId] {
        &self.shards
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Created = 0,
    Prepared = 1,
    Running = 2,
    Stopped = 3,
}

impl TaskState {
    fn from_u8(v: u8) -> TaskState {
        match v {
            0 => TaskState::Created,
            1 => TaskState::Prepared,
            2 => TaskState::Running,
            _ => TaskState::Stopped,
        }
    }
}

/// One executable stage of a job on this node.
pub trait Task: Send + Sync {
    fn prepare(&self) -> HarrierResult<()>;
    fn start(&self) -> HarrierResult<()>;
    fn kill(&self, cause: Option<HarrierError>);
    fn name(&self) -> &str;
    fn id(&self) -> PhaseId;
    fn completion_future(&self) -> SharedFuture<CompletionState>;
}

type Searchers = Arc<Mutex<BTreeMap<usize, Box<dyn Searcher>>>>;

struct TaskInner {
    batch_iterator: Option<Box<dyn BatchIterator>>,
    kill_switch: Option<KillSwitch>,
}

pub struct CollectTask {
    phase: CollectPhase,
    source: Arc<dyn CollectSource>,
    ram_accounting: Arc<RamAccounting>,
    consumer: Arc<dyn RowConsumer>,
    shared_shard_contexts: SharedShardContexts,
    searchers: Searchers,
    pools: Arc<ThreadPools>,
    pool_name: ThreadPoolName,
    state: AtomicU8,
    completion: SharedFuture<CompletionState>,
    inner: Mutex<TaskInner>,
}

impl CollectTask {
    /// The completion future resolves — and never fails — once the consumer
    /// finished, after all searchers and the ram accounting were released.
    /// Failures travel through the consumer's own completion.
    pub fn new(
        phase: CollectPhase,
        source: Arc<dyn CollectSource>,
        ram_accounting: Arc<RamAccounting>,
        consumer: Arc<dyn RowConsumer>,
        shared_shard_contexts: SharedShardContexts,
        pools: Arc<ThreadPools>,
    ) -> Arc<Self> {
        let pool_name = thread_pool_name(&phase);
        let searchers: Searchers = Arc::new(Mutex::new(BTreeMap::new()));
        let completion: SharedFuture<CompletionState> = SharedFuture::new();

        let cleanup_searchers = Arc::clone(&searchers);
        let cleanup_ram = Arc::clone(&ram_accounting);
        let cleanup_completion = completion.clone();
        consumer.completion_future().on_done(move |_| {
            close_searchers(&cleanup_searchers);
            let bytes_used = cleanup_ram.total_bytes();
            cleanup_ram.close();
            cleanup_completion.complete(CompletionState { bytes_used });
        });

        Arc::new(Self {
            phase,
            source,
            ram_accounting,
            consumer,
            shared_shard_contexts,
            searchers,
            pools,
            pool_name,
            state: AtomicU8::new(TaskState::Created as u8),
            completion,
            inner: Mutex::new(TaskInner {
                batch_iterator: None,
                kill_switch: None,
            }),
        })
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Register a shard searcher. Registering the same id twice is a
    /// protocol error; both the old and the new handle are closed before
    /// failing so a buggy caller cannot leak either.
    pub fn add_searcher(&self, searcher_id: usize, mut searcher: Box<dyn Searcher>) -> HarrierResult<()> {
        let mut searchers = self.searchers.lock();
        match searchers.remove(&searcher_id) {
            Some(mut replaced) => {
                if let Err(e) = replaced.close() {
                    tracing::warn!(searcher = searcher_id, error = %e, "failed to close replaced searcher");
                }
                if let Err(e) = searcher.close() {
                    tracing::warn!(searcher = searcher_id, error = %e, "failed to close duplicate searcher");
                }
                Err(ProtocolError::DuplicateSearcher { searcher: searcher_id }.into())
            }
            None => {
                searchers.insert(searcher_id, searcher);
                Ok(())
            }
        }
    }

    pub fn ram_accounting(&self) -> &Arc<RamAccounting> {
        &self.ram_accounting
    }

    pub fn shared_shard_contexts(&self) -> &SharedShardContexts {
        &self.shared_shard_contexts
    }

    pub fn pool_name(&self) -> ThreadPoolName {
        self.pool_name
    }
}

fn close_searchers(searchers: &Searchers) {
    let drained: Vec<(usize, Box<dyn Searcher>)> = {
        let mut guard = searchers.lock();
        std::mem::take(&mut *guard).into_iter().collect()
    };
    for (id, mut searcher) in drained {
        if let Err(e) = searcher.close() {
            tracing::warn!(searcher = id, error = %e, "failed to close searcher");
        }
    }
}

/// A routed phase of node or shard granularity is a short system-table
/// read and runs on the `get` pool; everything else (doc tables,
/// information schema, cluster level, partitions, unrouted phases) is
/// long-running and goes to `search`.
pub fn thread_pool_name(phase: &CollectPhase) -> ThreadPoolName {
    match phase {
        CollectPhase::Routed(routed)
            if matches!(
                routed.max_row_granularity,
                RowGranularity::Node | RowGranularity::Shard
            ) =>
        {
            ThreadPoolName::Get
        }
        _ => ThreadPoolName::Search,
    }
}

impl Task for CollectTask {
    /// Build the phase's batch iterator. Idempotent: only the
    /// CREATED → PREPARED transition does work.
    fn prepare(&self) -> HarrierResult<()> {
        if !self.transition(TaskState::Created, TaskState::Prepared) {
            return Ok(());
        }
        let iterator =
            self.source
                .get_iterator(&self.phase, self, self.consumer.requires_scroll())?;
        self.inner.lock().batch_iterator = Some(iterator);
        Ok(())
    }

    fn start(&self) -> HarrierResult<()> {
        let mut inner = self.inner.lock();
        if self.transition(TaskState::Prepared, TaskState::Running) {
            let iterator = inner.batch_iterator.take().ok_or_else(|| {
                HarrierError::Internal("prepared task has no batch iterator".into())
            })?;
            inner.kill_switch = Some(iterator.kill_handle());
            drop(inner);

            let consumer = Arc::clone(&self.consumer);
            let job: Job = Box::new(move || consumer.accept(Ok(iterator)));
            self.pools
                .pool(self.pool_name)
                .submit(job)
                .map_err(|_| HarrierError::Rejected {
                    pool: self.pool_name.to_string(),
                })?;
            return Ok(());
        }
        drop(inner);
        match self.state() {
            TaskState::Created => Err(HarrierError::illegal_state(
                "must call prepare before calling start",
            )),
            TaskState::Prepared => Err(HarrierError::illegal_state("collect task is already prepared")),
            TaskState::Running => Err(HarrierError::illegal_state("collect task is already started")),
            // A race with kill; nothing to do.
            TaskState::Stopped => Ok(()),
        }
    }

    /// Jump to STOPPED and act on the displaced state: a task that never
    /// started hands the cause straight to its consumer; a running one
    /// unwinds the consumer through the iterator's kill switch.
    fn kill(&self, cause: Option<HarrierError>) {
        let prev = TaskState::from_u8(self.state.swap(TaskState::Stopped as u8, Ordering::SeqCst));
        let cause = cause.unwrap_or_else(HarrierError::job_killed);
        tracing::debug!(phase_id = %self.phase.phase_id(), state = ?prev, "kill collect task");
        match prev {
            TaskState::Created | TaskState::Prepared => {
                self.consumer.accept(Err(cause));
            }
            TaskState::Running => {
                let kill_switch = self.inner.lock().kill_switch.clone();
                if let Some(kill_switch) = kill_switch {
                    kill_switch.kill(cause);
                }
            }
            TaskState::Stopped => {}
        }
    }

    fn name(&self) -> &str {
        self.phase.name()
    }

    fn id(&self) -> PhaseId {
        self.phase.phase_id()
    }

    fn completion_future(&self) -> SharedFuture<CompletionState> {
        self.completion.clone()
    }
}

impl fmt::Debug for CollectTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let searcher_ids: Vec<usize> = self.searchers.lock().keys().copied().collect();
        f.debug_struct("CollectTask")
            .field("id", &self.phase.phase_id())
            .field("state", &self.state())
            .field("shared_contexts", &self.shared_shard_contexts)
            .field("searchers", &searcher_ids)
            .finish()
    }
}

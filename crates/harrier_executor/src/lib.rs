//! Execution plumbing of the collect core: bounded thread pools with
//! rejection semantics, the pull-based batch-iterator protocol, pluggable
//! paging merges over keyed bucket iterables, and ram accounting.

pub mod batch;
pub mod batch_paging;
pub mod consumer;
pub mod paging;
pub mod pool;
pub mod ram;

pub use batch::{BatchIterator, CollectingBatchIterator, CompletionSink, InMemoryBatchIterator, RowConsumer};
pub use batch_paging::BatchPagingIterator;
pub use consumer::CollectingRowConsumer;
pub use paging::{KeyIterable, PagingIterator, PassThroughPagingIterator, SortedPagingIterator};
pub use pool::{Job, ThreadPool, ThreadPoolName, ThreadPoolSnapshot, ThreadPools};
pub use ram::RamAccounting;

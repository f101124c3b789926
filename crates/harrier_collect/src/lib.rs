//! Distributed collect execution for one node.
//!
//! A collect phase reads rows from a source (table, catalog, peer streams)
//! on this node. `CollectTask` owns the phase's resources and lifecycle;
//! `CumulativePageBucketReceiver` merges per-page bucket streams pushed by
//! upstream peers into the single pull stream a `RowConsumer` drives.

pub mod phase;
pub mod receiver;
pub mod source;
pub mod streamer;
pub mod task;

pub use phase::{CollectPhase, RoutedCollectPhase, Routing, RowGranularity, UnroutedCollectPhase};
pub use receiver::{CumulativePageBucketReceiver, PageBucketReceiver, PageResultListener};
pub use source::{CollectSource, StaticTableDefinition, SysRecord, SystemCollectSource};
pub use streamer::{streamers_for, Streamer};
pub use task::{CollectTask, CompletionState, Searcher, SharedShardContexts, Task, TaskState};

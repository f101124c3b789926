//! Shared building blocks for the HarrierDB collect execution core:
//! scalar values and rows, id newtypes, the error taxonomy, and the
//! blocking one-shot future used to bridge push and pull execution.

pub mod config;
pub mod datum;
pub mod error;
pub mod future;
pub mod types;

pub use config::CollectConfig;
pub use datum::{compare_datums, compare_rows_by_columns, Bucket, Datum, OwnedRow};
pub use error::{ErrorKind, HarrierError, HarrierResult, ProtocolError};
pub use future::{KillSwitch, SharedFuture};
pub use types::{DataType, PhaseId, RelationName, ShardId};

//! Domain model: identifiers, task records, lifecycle states, failure tags,
//! and batch aggregation.

pub mod batch;
pub mod failure;
pub mod ids;
pub mod status;
pub mod task;

pub use batch::{BatchRecord, BatchState, BatchStatus};
pub use failure::{FailureKind, TaskFailure};
pub use ids::{BatchId, IdParseError, TaskId};
pub use status::TaskStatus;
pub use task::TaskRecord;

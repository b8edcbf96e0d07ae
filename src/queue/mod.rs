pub mod snapshot;
pub mod store;
pub mod task;
pub mod worker;

pub use task::{
    BackoffPolicy, RejectReason, SubmitResult, Task, TaskError, TaskOutcome, TaskPriority,
    TaskState,
};
pub use worker::{handler_fn, QueueStats, TaskHandler, TaskQueue, WorkerPool};

pub mod entry;
pub mod runner;

pub use entry::{ScheduleEntry, TaskFactory};
pub use runner::{Scheduler, SchedulerState, StopReport};

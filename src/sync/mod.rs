//! Staggered scheduling: the coordinator assigns each process a phase
//! inside the shared cadence, and the scheduler runs the caller's action on
//! that phase.

pub mod coordinator;
pub mod instance;
pub mod offset;
pub mod scheduler;

pub use coordinator::{BackoffKind, Coordinator, SnapshotHandle, SyncConfig, SyncStream};
pub use instance::Instance;
pub use offset::{compute_offset, duration_until_next_minute};
pub use scheduler::{run_staggered, spawn_staggered, Action, ScheduleConfig, Scheduler};

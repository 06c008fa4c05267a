//! Cache task interface
//!
//! The cache hands out task objects; the runner decides where and when
//! they execute. Task bodies are idempotent short-circuiting operations:
//! running a task whose work was already done elsewhere (a concurrent
//! at-raster decode, a piggybacked duplicate) is a cheap no-op.

use std::sync::Arc;

/// Identifier assigned to a task at submission.
pub type TaskId = u64;

/// Which thread class a task may execute on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAffinity {
    /// Any worker thread; decode tasks are embarrassingly parallel
    Worker,
    /// Only the single raster-designated thread; upload tasks and all
    /// graphics-backend work
    Raster,
}

/// Lifecycle state of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Queued, not yet started
    Pending,
    /// Currently executing on some thread
    Running,
    /// Ran to completion; `on_complete` has been or is being invoked
    Completed,
    /// Cancelled before it ran; `on_complete` was still invoked so
    /// task-held references were released
    Cancelled,
}

impl TaskState {
    /// True once the task will never run (again)
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Cancelled)
    }
}

/// A unit of cache work executed by the runner.
///
/// `run` is only called once, and never after cancellation. `on_complete`
/// is called exactly once in all cases (after `run` finishes, or at
/// cancellation time) and is where task-held cache references are
/// released.
pub trait CacheTask: Send + Sync {
    /// Execute the work. Called without any locks held.
    fn run(&self);

    /// Completion callback; invoked exactly once per task, even for
    /// tasks cancelled before running.
    fn on_complete(&self);

    /// Thread class this task must run on.
    fn affinity(&self) -> TaskAffinity;

    /// The single task that must finish before this one may run.
    fn dependency(&self) -> Option<Arc<dyn CacheTask>> {
        None
    }
}

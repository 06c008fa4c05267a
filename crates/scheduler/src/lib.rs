//! Rasterline Scheduler Library
//!
//! Task-pair execution for the image decode/upload pipeline: decode tasks
//! run on any worker thread, upload tasks run only on the single
//! raster-designated thread, and an upload task declares its decode task
//! as its single dependency.
//!
//! # Example
//!
//! ```
//! use rasterline_scheduler::{CacheTask, TaskAffinity, TaskRunner, WorkerPoolConfig};
//! use std::sync::Arc;
//!
//! struct Noop;
//! impl CacheTask for Noop {
//!     fn run(&self) {}
//!     fn on_complete(&self) {}
//!     fn affinity(&self) -> TaskAffinity {
//!         TaskAffinity::Worker
//!     }
//! }
//!
//! let runner = TaskRunner::new(WorkerPoolConfig::new(2));
//! runner.submit(Arc::new(Noop));
//! runner.wait_until_idle(std::time::Duration::from_secs(1));
//! runner.shutdown();
//! ```

pub mod runner;
pub mod task;

pub use runner::{TaskRunner, WorkerPoolConfig};
pub use task::{CacheTask, TaskAffinity, TaskId, TaskState};

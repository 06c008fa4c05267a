//! Task runner: worker pool plus a single raster thread
//!
//! Workers execute `TaskAffinity::Worker` tasks in parallel with no
//! ordering guarantees. Exactly one raster thread executes
//! `TaskAffinity::Raster` tasks, after their dependency has finished.
//! Threads poll their queues with a configurable interval and shut down
//! gracefully.

use crate::task::{CacheTask, TaskAffinity, TaskId, TaskState};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Configuration for the task runner's thread pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of decode worker threads.
    /// Default: number of logical CPU cores.
    pub num_workers: usize,

    /// Maximum time an idle thread waits before re-checking its queue
    /// and the shutdown flag. Default: 10ms.
    pub poll_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: available_cpus(),
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a configuration with an explicit worker count
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            poll_interval: Duration::from_millis(10),
        }
    }

    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

struct TaskEntry {
    task: Arc<dyn CacheTask>,
    state: TaskState,
    dependency: Option<TaskId>,
}

#[derive(Default)]
struct RunnerState {
    tasks: HashMap<TaskId, TaskEntry>,
    /// Arc pointer identity -> id, so resubmitting a shared task (a decode
    /// task reused as the dependency of several uploads) never double-runs
    by_identity: HashMap<usize, TaskId>,
    worker_queue: VecDeque<TaskId>,
    raster_queue: VecDeque<TaskId>,
    next_id: TaskId,
    finished: u64,
    submitted: u64,
}

impl RunnerState {
    fn identity(task: &Arc<dyn CacheTask>) -> usize {
        Arc::as_ptr(task) as *const () as usize
    }

    fn register(&mut self, task: Arc<dyn CacheTask>) -> TaskId {
        let key = Self::identity(&task);
        if let Some(&id) = self.by_identity.get(&key) {
            return id;
        }

        let dependency = task.dependency().map(|dep| self.register(dep));

        self.next_id += 1;
        let id = self.next_id;
        let affinity = task.affinity();
        self.tasks.insert(
            id,
            TaskEntry {
                task,
                state: TaskState::Pending,
                dependency,
            },
        );
        self.by_identity.insert(key, id);
        self.submitted += 1;
        match affinity {
            TaskAffinity::Worker => self.worker_queue.push_back(id),
            TaskAffinity::Raster => self.raster_queue.push_back(id),
        }
        id
    }

    fn dependency_finished(&self, id: TaskId) -> bool {
        match self.tasks[&id].dependency {
            // A cancelled dependency counts as finished: the dependent's
            // run body short-circuits off shared state, not off the task.
            Some(dep) => self.tasks[&dep].state.is_finished(),
            None => true,
        }
    }
}

/// Fixed worker pool plus one raster thread executing cache tasks.
///
/// Submitting a task also submits its dependency (once). Cancellation
/// only affects tasks that have not started; a cancelled task still gets
/// its `on_complete` callback so reference counts stay balanced.
pub struct TaskRunner {
    state: Arc<Mutex<RunnerState>>,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    poll_interval: Duration,
}

impl TaskRunner {
    /// Create and start a runner with `config.num_workers` workers and
    /// one raster thread.
    pub fn new(config: WorkerPoolConfig) -> Self {
        let state = Arc::new(Mutex::new(RunnerState::default()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::with_capacity(config.num_workers + 1);

        for id in 0..config.num_workers.max(1) {
            let state = state.clone();
            let shutdown = shutdown.clone();
            let poll = config.poll_interval;
            let handle = thread::Builder::new()
                .name(format!("rasterline-worker-{}", id))
                .spawn(move || run_loop(state, shutdown, poll, TaskAffinity::Worker))
                .expect("failed to spawn worker thread");
            threads.push(handle);
        }

        let raster_state = state.clone();
        let raster_shutdown = shutdown.clone();
        let poll = config.poll_interval;
        let raster = thread::Builder::new()
            .name("rasterline-raster".to_string())
            .spawn(move || run_loop(raster_state, raster_shutdown, poll, TaskAffinity::Raster))
            .expect("failed to spawn raster thread");
        threads.push(raster);

        Self {
            state,
            shutdown,
            threads,
            poll_interval: config.poll_interval,
        }
    }

    /// Submit a task (and, transitively, its dependency). Returns the id
    /// assigned to `task`; resubmitting the same task returns the same id.
    pub fn submit(&self, task: Arc<dyn CacheTask>) -> TaskId {
        let mut state = self.state.lock().unwrap();
        let id = state.register(task);
        trace!(id, "task submitted");
        id
    }

    /// Cancel a pending task. Returns true if the task had not started;
    /// in that case its `on_complete` is invoked before returning.
    pub fn cancel(&self, id: TaskId) -> bool {
        let task = {
            let mut state = self.state.lock().unwrap();
            let cancelled = match state.tasks.get_mut(&id) {
                Some(entry) if entry.state == TaskState::Pending => {
                    entry.state = TaskState::Cancelled;
                    Some(entry.task.clone())
                }
                _ => None,
            };
            if cancelled.is_some() {
                state.finished += 1;
            }
            cancelled
        };
        match task {
            Some(task) => {
                debug!(id, "task cancelled before running");
                task.on_complete();
                true
            }
            None => false,
        }
    }

    /// Current lifecycle state of a submitted task
    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.state.lock().unwrap().tasks.get(&id).map(|e| e.state)
    }

    /// True when every submitted task has completed or been cancelled
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.finished == state.submitted
    }

    /// Block until idle or until `timeout` elapses. Returns true if idle.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_idle() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(self.poll_interval.min(Duration::from_millis(1)));
        }
        true
    }

    /// Signal all threads to stop and join them. Pending tasks that never
    /// ran are not cancelled; the owner is expected to drain or cancel
    /// before shutdown.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Release);
        for handle in self.threads {
            handle.join().expect("runner thread panicked");
        }
    }
}

fn run_loop(
    state: Arc<Mutex<RunnerState>>,
    shutdown: Arc<AtomicBool>,
    poll_interval: Duration,
    affinity: TaskAffinity,
) {
    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        let next = {
            let mut state = state.lock().unwrap();
            pop_runnable(&mut state, affinity)
        };

        match next {
            Some((id, task)) => {
                task.run();
                {
                    let mut state = state.lock().unwrap();
                    let entry = state.tasks.get_mut(&id).expect("running task tracked");
                    entry.state = TaskState::Completed;
                    state.finished += 1;
                }
                task.on_complete();
                trace!(id, "task completed");
            }
            None => thread::sleep(poll_interval),
        }
    }
}

/// Pop the next runnable task for a thread class, skipping cancelled
/// entries and rotating raster tasks whose dependency is still in flight.
fn pop_runnable(
    state: &mut RunnerState,
    affinity: TaskAffinity,
) -> Option<(TaskId, Arc<dyn CacheTask>)> {
    let queue_len = match affinity {
        TaskAffinity::Worker => state.worker_queue.len(),
        TaskAffinity::Raster => state.raster_queue.len(),
    };

    for _ in 0..queue_len {
        let id = match affinity {
            TaskAffinity::Worker => state.worker_queue.pop_front(),
            TaskAffinity::Raster => state.raster_queue.pop_front(),
        }?;

        match state.tasks[&id].state {
            TaskState::Pending => {}
            // Cancelled (or already handled) entries drop out of the queue
            _ => continue,
        }

        if !state.dependency_finished(id) {
            match affinity {
                TaskAffinity::Worker => state.worker_queue.push_back(id),
                TaskAffinity::Raster => state.raster_queue.push_back(id),
            }
            continue;
        }

        let entry = state.tasks.get_mut(&id).expect("queued task tracked");
        entry.state = TaskState::Running;
        return Some((id, entry.task.clone()));
    }
    None
}

/// Number of logical CPU cores, used as the default worker count.
fn available_cpus() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingTask {
        affinity: TaskAffinity,
        runs: Arc<AtomicUsize>,
        completions: Arc<AtomicUsize>,
        dependency: Option<Arc<dyn CacheTask>>,
        delay: Duration,
    }

    impl CountingTask {
        fn new(affinity: TaskAffinity) -> Self {
            Self {
                affinity,
                runs: Arc::new(AtomicUsize::new(0)),
                completions: Arc::new(AtomicUsize::new(0)),
                dependency: None,
                delay: Duration::ZERO,
            }
        }
    }

    impl CacheTask for CountingTask {
        fn run(&self) {
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            self.runs.fetch_add(1, Ordering::SeqCst);
        }

        fn on_complete(&self) {
            self.completions.fetch_add(1, Ordering::SeqCst);
        }

        fn affinity(&self) -> TaskAffinity {
            self.affinity
        }

        fn dependency(&self) -> Option<Arc<dyn CacheTask>> {
            self.dependency.clone()
        }
    }

    #[test]
    fn test_config_default() {
        let config = WorkerPoolConfig::default();
        assert!(config.num_workers > 0);
    }

    #[test]
    fn test_worker_task_runs_and_completes() {
        let runner = TaskRunner::new(WorkerPoolConfig::new(2));
        let task = Arc::new(CountingTask::new(TaskAffinity::Worker));
        let runs = task.runs.clone();
        let completions = task.completions.clone();

        let id = runner.submit(task);
        assert!(runner.wait_until_idle(Duration::from_secs(2)));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert_eq!(runner.task_state(id), Some(TaskState::Completed));

        runner.shutdown();
    }

    #[test]
    fn test_dependency_runs_before_dependent() {
        let runner = TaskRunner::new(WorkerPoolConfig::new(2));

        let decode = Arc::new(CountingTask::new(TaskAffinity::Worker));
        let decode_runs = decode.runs.clone();
        let mut upload = CountingTask::new(TaskAffinity::Raster);
        upload.dependency = Some(decode.clone() as Arc<dyn CacheTask>);
        let upload = Arc::new(upload);
        let upload_runs = upload.runs.clone();

        runner.submit(upload.clone() as Arc<dyn CacheTask>);
        assert!(runner.wait_until_idle(Duration::from_secs(2)));

        assert_eq!(decode_runs.load(Ordering::SeqCst), 1);
        assert_eq!(upload_runs.load(Ordering::SeqCst), 1);

        runner.shutdown();
    }

    #[test]
    fn test_shared_dependency_runs_once() {
        let runner = TaskRunner::new(WorkerPoolConfig::new(2));

        let decode: Arc<dyn CacheTask> = Arc::new(CountingTask::new(TaskAffinity::Worker));
        let mut upload_a = CountingTask::new(TaskAffinity::Raster);
        upload_a.dependency = Some(decode.clone());
        let mut upload_b = CountingTask::new(TaskAffinity::Raster);
        upload_b.dependency = Some(decode.clone());

        let dep_id_a = runner.submit(Arc::new(upload_a));
        let dep_id_b = runner.submit(Arc::new(upload_b));
        assert_ne!(dep_id_a, dep_id_b);
        assert!(runner.wait_until_idle(Duration::from_secs(2)));

        // The decode Arc was registered once; two uploads, one decode run
        let state = runner.state.lock().unwrap();
        assert_eq!(state.submitted, 3);
        drop(state);

        runner.shutdown();
    }

    #[test]
    fn test_cancel_before_run_invokes_on_complete() {
        // No workers able to pick the task up instantly: stall them with
        // a long-running task first
        let runner = TaskRunner::new(WorkerPoolConfig::new(1));
        let mut slow = CountingTask::new(TaskAffinity::Worker);
        slow.delay = Duration::from_millis(100);
        runner.submit(Arc::new(slow));

        let victim = Arc::new(CountingTask::new(TaskAffinity::Worker));
        let runs = victim.runs.clone();
        let completions = victim.completions.clone();
        let id = runner.submit(victim);

        assert!(runner.cancel(id));
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert!(runner.wait_until_idle(Duration::from_secs(2)));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(runner.task_state(id), Some(TaskState::Cancelled));

        runner.shutdown();
    }

    #[test]
    fn test_cancel_after_completion_is_noop() {
        let runner = TaskRunner::new(WorkerPoolConfig::new(1));
        let task = Arc::new(CountingTask::new(TaskAffinity::Worker));
        let completions = task.completions.clone();

        let id = runner.submit(task);
        assert!(runner.wait_until_idle(Duration::from_secs(2)));
        assert!(!runner.cancel(id));
        assert_eq!(completions.load(Ordering::SeqCst), 1);

        runner.shutdown();
    }

    #[test]
    fn test_raster_tasks_are_serialized() {
        let runner = TaskRunner::new(WorkerPoolConfig::new(2));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        struct RasterProbe {
            in_flight: Arc<AtomicUsize>,
            max_seen: Arc<AtomicUsize>,
        }
        impl CacheTask for RasterProbe {
            fn run(&self) {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_seen.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            fn on_complete(&self) {}
            fn affinity(&self) -> TaskAffinity {
                TaskAffinity::Raster
            }
        }

        for _ in 0..6 {
            runner.submit(Arc::new(RasterProbe {
                in_flight: in_flight.clone(),
                max_seen: max_seen.clone(),
            }));
        }
        assert!(runner.wait_until_idle(Duration::from_secs(5)));
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);

        runner.shutdown();
    }
}

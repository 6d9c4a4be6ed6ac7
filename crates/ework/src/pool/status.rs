/// Lifecycle of a pool. Transitions are one-way.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// Accepting and dispatching jobs.
    Active,
    /// Tearing down workers and rejecting outstanding jobs.
    Draining,
    /// No further jobs are accepted or dispatched.
    Terminated,
}

/// A point-in-time snapshot of the pool controller's state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStatus {
    pub lifecycle: Lifecycle,
    /// Total number of workers. Fixed for the lifetime of the pool.
    pub workers: usize,
    /// Workers that are initialized and waiting for a job.
    pub free: usize,
    /// Workers currently running a job.
    pub busy: usize,
    /// Workers still running their init routine.
    pub initializing: usize,
    /// Jobs waiting for a free worker.
    pub queued: usize,
    /// The id the next submitted job will receive.
    pub next_job_id: u64,
}

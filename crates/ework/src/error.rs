//! Error types for the worker pool.
//!
//! This module defines the central [`Error`] enum, which captures every way a
//! pool can refuse to start, a job can fail, or the pool can be torn down.
//!
//! ## Error Cases
//! - `Config`, `Range`, `Type`: invalid construction options, reported
//!   synchronously before any worker thread is spawned.
//! - `Spawn`: the operating system refused to create a thread.
//! - `Init`: a worker's init routine failed; the pool is torn down.
//! - `Work`: the work routine failed for one job. Only that job fails.
//! - `Protocol`: a worker answered out of turn or with the wrong job id; the
//!   pool is torn down.
//! - `Terminated`: the job was still outstanding when the pool terminated, or
//!   was submitted afterwards.
//! - `ChannelError`: the controller thread is gone.

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the worker pool.
///
/// Errors are `Clone` because a single terminal cause (an init failure or a
/// protocol violation) is handed to every job that was waiting on the pool.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The options document is not a valid configuration.
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    /// A numeric option is outside its allowed range.
    #[error("Range error: {reason}")]
    Range { reason: String },

    /// An option carries a value of the wrong kind.
    #[error("Type error: {reason}")]
    Type { reason: String },

    /// A worker or controller thread could not be created.
    #[error("Failed to spawn thread: {reason}")]
    Spawn { reason: String },

    /// The init routine failed on one worker.
    #[error("Worker {slot} failed to initialize: {message}")]
    Init { slot: usize, message: String },

    /// The work routine failed for one job.
    #[error("Job {id} failed: {message}")]
    Work { id: u64, message: String },

    /// A worker broke the request/response protocol.
    #[error("Protocol violation: {reason}")]
    Protocol { reason: String },

    /// The pool was terminated before the job completed.
    #[error("Worker pool terminated")]
    Terminated,

    /// Internal channel failure between the pool handle and its controller.
    #[error("Channel error: {context}")]
    ChannelError { context: String },
}

impl Error {
    /// Returns `true` for errors that describe the pool going away rather than
    /// the job itself failing.
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Terminated
                | Self::Init { .. }
                | Self::Protocol { .. }
                | Self::ChannelError { .. }
        )
    }
}

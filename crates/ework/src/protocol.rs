//! Messages exchanged between the controller and a single worker.
//!
//! A worker receives [`Request`]s over its own channel and answers each one
//! with exactly one [`Response`]. Work responses echo the job id of the request
//! they answer so the controller can check it against the job it assigned.

use crate::options::InitData;

/// Controller to worker.
#[derive(Debug)]
pub(crate) enum Request<I> {
    /// Run the init routine, if any, with the pool's init data.
    Init { data: Option<InitData> },
    /// Run the work routine on `value`.
    Work { id: u64, value: I },
}

/// Worker to controller.
///
/// Failures are carried as text: the message of the routine's error, or the
/// panic payload if the routine panicked.
#[derive(Debug)]
pub(crate) enum Response<O> {
    Init(Result<(), String>),
    Result { id: u64, outcome: Result<O, String> },
}

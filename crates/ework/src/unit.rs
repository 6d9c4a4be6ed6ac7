//! Worker threads that host the work routine.
//!
//! Each worker is a dedicated OS thread that listens on its own unbounded
//! [`mpsc`] channel for [`Request`]s and reports every outcome back to the
//! controller's mailbox as an [`Event::Unit`]. Workers share nothing mutable
//! with the controller or with each other: the routine itself is shared
//! read-only through an [`Arc`], and any per-worker state lives in the
//! worker thread (typically set up by the init routine).
//!
//! The routine runs under [`panic::catch_unwind`], so a panicking job is
//! reported as a failed job instead of killing the worker.

use crate::{
    error::{Error, Result},
    options::{InitData, InitFn},
    pool::Event,
    protocol::{Request, Response},
};
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
};
use tokio::sync::{mpsc, oneshot};

/// The controller's view of one isolated execution unit.
pub(crate) trait ExecutionUnit<I> {
    /// Hands a request to the unit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the unit can no longer receive requests.
    fn post(&mut self, request: Request<I>) -> Result<()>;

    /// Stops the unit from accepting further requests.
    ///
    /// Returns a receiver that completes once the unit has exited, or `None`
    /// if it was already shut down.
    fn shutdown(&mut self) -> Option<oneshot::Receiver<()>>;
}

pub(crate) type WorkFn<I, O> = dyn Fn(I) -> core::result::Result<O, String> + Send + Sync;

/// The task descriptor every worker runs: the work routine plus the optional
/// per-worker init routine.
pub(crate) struct Routine<I, O> {
    pub(crate) work: Box<WorkFn<I, O>>,
    pub(crate) init: Option<InitFn>,
}

/// A worker backed by a dedicated OS thread.
pub(crate) struct ThreadUnit<I> {
    slot: usize,
    requests: Option<mpsc::UnboundedSender<Request<I>>>,
    exited: Option<oneshot::Receiver<()>>,
}

impl<I: Send + 'static> ThreadUnit<I> {
    /// Spawns the worker thread for `slot`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Spawn`] if the operating system refuses to create the
    /// thread.
    pub(crate) fn spawn<O: Send + 'static>(
        slot: usize,
        name: &str,
        routine: Arc<Routine<I, O>>,
        events: mpsc::UnboundedSender<Event<I, O>>,
    ) -> Result<Self> {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (exited_tx, exited_rx) = oneshot::channel();

        thread::Builder::new()
            .name(format!("{name}-worker-{slot}"))
            .spawn(move || worker_loop(slot, requests_rx, routine, events, exited_tx))
            .map_err(|e| Error::Spawn {
                reason: format!("worker {slot}: {e}"),
            })?;

        Ok(Self {
            slot,
            requests: Some(requests_tx),
            exited: Some(exited_rx),
        })
    }
}

impl<I> ExecutionUnit<I> for ThreadUnit<I> {
    fn post(&mut self, request: Request<I>) -> Result<()> {
        let Some(requests) = &self.requests else {
            return Err(Error::Protocol {
                reason: format!("worker {} is shut down", self.slot),
            });
        };

        requests.send(request).map_err(|_| Error::Protocol {
            reason: format!("worker {} channel closed", self.slot),
        })
    }

    fn shutdown(&mut self) -> Option<oneshot::Receiver<()>> {
        // Dropping the sender ends the worker loop once the current job, if
        // any, returns.
        self.requests = None;
        self.exited.take()
    }
}

/// Body of a worker thread.
///
/// Answers every request with exactly one response and exits when its request
/// channel closes or the controller's mailbox is gone.
fn worker_loop<I, O>(
    slot: usize,
    mut requests: mpsc::UnboundedReceiver<Request<I>>,
    routine: Arc<Routine<I, O>>,
    events: mpsc::UnboundedSender<Event<I, O>>,
    exited: oneshot::Sender<()>,
) {
    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {slot} started");

    while let Some(request) = requests.blocking_recv() {
        let response = match request {
            Request::Init { data } => Response::Init(run_init(&routine, data.as_ref())),
            Request::Work { id, value } => Response::Result {
                id,
                outcome: guarded(|| (routine.work)(value)),
            },
        };

        if events.send(Event::Unit { slot, response }).is_err() {
            #[cfg(feature = "tracing")]
            tracing::debug!("Worker {slot} lost its controller");
            break;
        }
    }

    if exited.send(()).is_err() {
        #[cfg(feature = "tracing")]
        tracing::trace!("Nobody waited for worker {slot} to exit");
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {slot} stopped");
}

fn run_init<I, O>(
    routine: &Routine<I, O>,
    data: Option<&InitData>,
) -> core::result::Result<(), String> {
    match &routine.init {
        Some(init) => guarded(|| init(data)),
        None => Ok(()),
    }
}

/// Runs a routine, turning a panic into an error message.
fn guarded<T>(
    f: impl FnOnce() -> core::result::Result<T, String>,
) -> core::result::Result<T, String> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(outcome) => outcome,
        Err(payload) => Err(format!(
            "worker panicked: {}",
            format_panic_payload(&payload)
        )),
    }
}

fn format_panic_payload(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

//! The public pool handle.
//!
//! [`Pool`] spawns a fixed set of worker threads plus one controller thread.
//! The handle itself only posts [`Event`]s to the controller's mailbox and
//! awaits the one-shot replies, so every method is cheap and non-blocking.
//! No method needs a tokio runtime: the channels are runtime-agnostic, and the
//! shutdown deadline in [`Pool::terminate`] is kept by a short-lived timer
//! thread rather than a runtime timer.

mod controller;
mod status;

pub(crate) use controller::Event;
pub use status::{Lifecycle, PoolStatus};

use crate::{
    error::{Error, Result},
    options::PoolOptions,
    unit::{Routine, ThreadUnit},
};
use controller::Controller;
use core::{fmt, time::Duration};
use futures::future::{Either, select, try_join_all};
use std::{sync::Arc, thread, time::Instant};
use tokio::sync::{mpsc, oneshot};

/// A bounded pool of worker threads that all run the same routine.
///
/// Jobs are handed to workers in the order they were submitted. Each worker
/// runs one job at a time, and every submitted job resolves exactly once:
/// with the routine's output, with the routine's failure, or with
/// [`Error::Terminated`] if the pool is torn down first.
///
/// Dropping the pool terminates it without waiting for the workers.
pub struct Pool<I, O> {
    events: mpsc::UnboundedSender<Event<I, O>>,
    workers: usize,
    shutdown_timeout: Duration,
    name: String,
}

impl<I, O> Pool<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Validates `options`, spawns the workers and starts initializing them.
    ///
    /// Returns as soon as the threads exist. Jobs submitted before any worker
    /// has finished its init routine wait in the queue; use [`Pool::ready`] to
    /// wait for initialization explicitly.
    ///
    /// # Errors
    ///
    /// - [`Error::Range`] if `num_workers` or `max_workers` is zero. Nothing is
    ///   spawned in that case.
    /// - [`Error::Spawn`] if a thread could not be created. Workers spawned so
    ///   far shut themselves down.
    pub fn new<F, E>(work: F, options: PoolOptions) -> Result<Self>
    where
        F: Fn(I) -> core::result::Result<O, E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        let workers = options.worker_count()?;

        let routine = Arc::new(Routine {
            work: Box::new(move |input| work(input).map_err(|e| e.to_string())),
            init: options.init.clone(),
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let units = (0..workers)
            .map(|slot| {
                ThreadUnit::spawn(slot, &options.name, Arc::clone(&routine), events_tx.clone())
            })
            .collect::<Result<Vec<_>>>()?;

        let mut controller = Controller::new(units);
        controller.start(options.init_data.clone());

        thread::Builder::new()
            .name(format!("{}-controller", options.name))
            .spawn(move || controller.run(events_rx))
            .map_err(|e| Error::Spawn {
                reason: format!("controller: {e}"),
            })?;

        #[cfg(feature = "tracing")]
        tracing::info!(
            "Started worker pool `{}` with {workers} workers",
            options.name
        );

        Ok(Self {
            events: events_tx,
            workers,
            shutdown_timeout: options.shutdown_timeout,
            name: options.name,
        })
    }

    /// Number of workers in the pool. Fixed at construction.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs the routine on one input and waits for its output.
    ///
    /// # Errors
    ///
    /// - [`Error::Work`] with the routine's message if it failed or panicked.
    /// - [`Error::Terminated`] if the pool was terminated first, or the
    ///   pool's terminal cause ([`Error::Init`], [`Error::Protocol`]) if it was
    ///   torn down by a failure.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip_all))]
    pub async fn execute(&self, input: I) -> Result<O> {
        let reply = self.submit(input)?;
        Self::wait(reply).await
    }

    /// Runs the routine on every input and returns the outputs in input order.
    ///
    /// All inputs are queued up front, so they are dispatched in iteration
    /// order. The call fails as soon as any job fails; the remaining jobs still
    /// run but their results are discarded.
    ///
    /// # Errors
    ///
    /// The first error observed among the jobs, as for [`Pool::execute`].
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip_all))]
    pub async fn map<T>(&self, inputs: T) -> Result<Vec<O>>
    where
        T: IntoIterator<Item = I>,
    {
        let replies = inputs
            .into_iter()
            .map(|input| self.submit(input))
            .collect::<Result<Vec<_>>>()?;

        try_join_all(replies.into_iter().map(Self::wait)).await
    }

    /// Waits until every worker has finished its init routine.
    ///
    /// # Errors
    ///
    /// [`Error::Init`] if a worker failed to initialize (which tears the pool
    /// down), or [`Error::Terminated`] if the pool was terminated.
    pub async fn ready(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Ready { reply })?;
        rx.await.map_err(|_| Error::ChannelError {
            context: "controller dropped a ready request".to_string(),
        })?
    }

    /// Returns a snapshot of the controller's state.
    pub async fn status(&self) -> Result<PoolStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Status { reply })?;
        rx.await.map_err(|_| Error::ChannelError {
            context: "controller dropped a status request".to_string(),
        })
    }

    /// Terminates the pool.
    ///
    /// Rejects every queued and in-flight job with [`Error::Terminated`], tells
    /// every worker to exit, and waits up to the configured shutdown timeout
    /// for the workers to confirm. A worker still inside a long-running
    /// routine when the timeout expires is left to finish on its own; its
    /// result is discarded.
    ///
    /// Always completes, on any executor. Safe to call more than once; later
    /// calls return immediately.
    pub async fn terminate(&self) {
        let (ack, rx) = oneshot::channel();
        if self.send(Event::Terminate { ack }).is_err() {
            return;
        }
        let Ok(exits) = rx.await else {
            return;
        };
        if exits.is_empty() {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("Waiting for {} workers to exit", exits.len());

        let mut deadline = Deadline::start(&self.name, self.shutdown_timeout);
        let mut expired = false;
        for (_slot, mut exit) in exits.into_iter().enumerate() {
            let finished = if expired {
                None
            } else {
                match select(&mut exit, &mut deadline.fired).await {
                    Either::Left((result, _)) => Some(result.is_ok()),
                    Either::Right(_) => {
                        expired = true;
                        None
                    }
                }
            };
            // Past the deadline, only workers that already exited count.
            let _exited = finished.unwrap_or_else(|| exit.try_recv().is_ok());

            #[cfg(feature = "tracing")]
            if _exited {
                tracing::trace!("Worker {_slot} shut down gracefully");
            } else {
                tracing::warn!("Worker {_slot} shutdown timed out");
            }
        }
        deadline.cancel();

        #[cfg(feature = "tracing")]
        tracing::info!("Worker pool shutdown complete");
    }

    fn submit(&self, input: I) -> Result<oneshot::Receiver<Result<O>>> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Submit { input, reply })?;
        Ok(rx)
    }

    async fn wait(reply: oneshot::Receiver<Result<O>>) -> Result<O> {
        reply.await.map_err(|_| Error::ChannelError {
            context: "controller dropped a job".to_string(),
        })?
    }

    fn send(&self, event: Event<I, O>) -> Result<()> {
        self.events.send(event).map_err(|_| Error::ChannelError {
            context: "controller thread stopped".to_string(),
        })
    }
}

/// Fires once `timeout` has elapsed, from a dedicated timer thread.
///
/// The timer thread exits early once the receiver is dropped and the thread
/// is unparked. If the thread cannot be spawned the deadline fires at once.
struct Deadline {
    fired: oneshot::Receiver<()>,
    timer: Option<thread::Thread>,
}

impl Deadline {
    fn start(name: &str, timeout: Duration) -> Self {
        let (tx, fired) = oneshot::channel();
        // `None` when the timeout is too large to represent: never fires.
        let until = Instant::now().checked_add(timeout);
        let timer = thread::Builder::new()
            .name(format!("{name}-shutdown"))
            .spawn(move || {
                while !tx.is_closed() {
                    match until {
                        Some(until) => {
                            let now = Instant::now();
                            if now >= until {
                                let _ = tx.send(());
                                return;
                            }
                            thread::park_timeout(until - now);
                        }
                        None => thread::park(),
                    }
                }
            })
            .map(|handle| handle.thread().clone())
            .ok();

        Self { fired, timer }
    }

    fn cancel(self) {
        let Self { fired, timer } = self;
        drop(fired);
        if let Some(timer) = timer {
            timer.unpark();
        }
    }
}

impl<I, O> fmt::Debug for Pool<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish_non_exhaustive()
    }
}

impl<I, O> Drop for Pool<I, O> {
    fn drop(&mut self) {
        let (ack, _) = oneshot::channel();
        let _ = self.events.send(Event::Terminate { ack });
    }
}

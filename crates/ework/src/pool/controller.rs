//! The pool controller: a single-threaded state machine driven by events.
//!
//! Every mutation of pool state (the job queue, the idle list, slot states and
//! the lifecycle) happens inside [`Controller::handle`], which reacts to one
//! [`Event`] at a time. Callers and workers never touch this state directly;
//! they post events to the controller's mailbox. This keeps a single writer
//! for the whole state machine without any locking.
//!
//! ## Invariants
//!
//! - A slot holds a job if and only if it is busy ([`SlotState::Busy`] owns
//!   the job).
//! - The idle list contains exactly the slots in [`SlotState::Idle`].
//! - Jobs leave the queue in submission order.
//! - Every job's reply channel is used exactly once.

use super::status::{Lifecycle, PoolStatus};
use crate::{
    error::{Error, Result},
    options::InitData,
    protocol::{Request, Response},
    unit::ExecutionUnit,
};
use core::mem;
use std::collections::VecDeque;
use tokio::sync::{mpsc, oneshot};

/// Everything the controller reacts to.
pub(crate) enum Event<I, O> {
    /// A caller submitted one input.
    Submit {
        input: I,
        reply: oneshot::Sender<Result<O>>,
    },
    /// A worker answered a request.
    Unit { slot: usize, response: Response<O> },
    /// A caller waits for every worker to finish initializing.
    Ready { reply: oneshot::Sender<Result<()>> },
    /// A caller asks for a status snapshot.
    Status { reply: oneshot::Sender<PoolStatus> },
    /// A caller terminates the pool. The ack carries one exit receiver per
    /// worker that has not been waited on yet.
    Terminate {
        ack: oneshot::Sender<Vec<oneshot::Receiver<()>>>,
    },
}

struct Job<O> {
    id: u64,
    reply: oneshot::Sender<Result<O>>,
}

struct Queued<I, O> {
    id: u64,
    input: I,
    reply: oneshot::Sender<Result<O>>,
}

enum SlotState<O> {
    Initializing,
    Idle,
    Busy(Job<O>),
    Terminated,
}

struct Slot<O, U> {
    unit: U,
    state: SlotState<O>,
}

pub(crate) struct Controller<I, O, U> {
    slots: Vec<Slot<O, U>>,
    /// Indices of idle slots. Its length is the pool's free count.
    idle: Vec<usize>,
    queue: VecDeque<Queued<I, O>>,
    next_job_id: u64,
    lifecycle: Lifecycle,
    ready_waiters: Vec<oneshot::Sender<Result<()>>>,
    /// Why the pool was torn down, when it was not an explicit terminate.
    cause: Option<Error>,
    /// Exit signals of torn-down workers, handed to the next terminate call.
    exits: Vec<oneshot::Receiver<()>>,
}

impl<I, O, U: ExecutionUnit<I>> Controller<I, O, U> {
    pub(crate) fn new(units: Vec<U>) -> Self {
        debug_assert!(!units.is_empty(), "a pool needs at least one worker");

        Self {
            idle: Vec::with_capacity(units.len()),
            slots: units
                .into_iter()
                .map(|unit| Slot {
                    unit,
                    state: SlotState::Initializing,
                })
                .collect(),
            queue: VecDeque::new(),
            next_job_id: 0,
            lifecycle: Lifecycle::Active,
            ready_waiters: Vec::new(),
            cause: None,
            exits: Vec::new(),
        }
    }

    /// Sends every worker its init request.
    pub(crate) fn start(&mut self, data: Option<InitData>) {
        for slot in 0..self.slots.len() {
            let request = Request::Init { data: data.clone() };
            if let Err(e) = self.slots[slot].unit.post(request) {
                self.abort(e);
                return;
            }
        }
    }

    /// Processes events until every sender of the mailbox is gone.
    pub(crate) fn run(mut self, mut events: mpsc::UnboundedReceiver<Event<I, O>>) {
        while let Some(event) = events.blocking_recv() {
            self.handle(event);
        }

        self.terminate();

        #[cfg(feature = "tracing")]
        tracing::debug!("Worker pool controller stopped");
    }

    pub(crate) fn handle(&mut self, event: Event<I, O>) {
        match event {
            Event::Submit { input, reply } => self.enqueue(input, reply),
            Event::Unit { slot, response } => match response {
                Response::Init(result) => self.on_init(slot, result),
                Response::Result { id, outcome } => self.on_result(slot, id, outcome),
            },
            Event::Ready { reply } => self.on_ready(reply),
            Event::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Event::Terminate { ack } => {
                let exits = self.terminate();
                let _ = ack.send(exits);
            }
        }
    }

    pub(crate) fn status(&self) -> PoolStatus {
        let mut busy = 0;
        let mut initializing = 0;
        for slot in &self.slots {
            match slot.state {
                SlotState::Busy(_) => busy += 1,
                SlotState::Initializing => initializing += 1,
                SlotState::Idle | SlotState::Terminated => {}
            }
        }

        PoolStatus {
            lifecycle: self.lifecycle,
            workers: self.slots.len(),
            free: self.idle.len(),
            busy,
            initializing,
            queued: self.queue.len(),
            next_job_id: self.next_job_id,
        }
    }

    fn enqueue(&mut self, input: I, reply: oneshot::Sender<Result<O>>) {
        if self.lifecycle != Lifecycle::Active {
            let _ = reply.send(Err(self.terminal_error()));
            return;
        }

        let id = self.next_job_id;
        self.next_job_id += 1;
        self.queue.push_back(Queued { id, input, reply });
        self.dispatch();
    }

    /// Assigns queued jobs to idle workers until one of them runs out.
    ///
    /// Jobs are taken strictly from the front of the queue. Which idle worker
    /// receives a job is unspecified; the current choice (the most recently
    /// freed worker) is not a guarantee.
    fn dispatch(&mut self) {
        while let Some(&slot) = self.idle.last() {
            if self.lifecycle != Lifecycle::Active {
                break;
            }
            let Some(Queued { id, input, reply }) = self.queue.pop_front() else {
                break;
            };
            self.idle.pop();

            debug_assert!(matches!(self.slots[slot].state, SlotState::Idle));
            if let Err(e) = self.slots[slot]
                .unit
                .post(Request::Work { id, value: input })
            {
                let _ = reply.send(Err(e.clone()));
                self.abort(e);
                return;
            }

            #[cfg(feature = "tracing")]
            tracing::trace!("Dispatched job {id} to worker {slot}");
            self.slots[slot].state = SlotState::Busy(Job { id, reply });
        }
    }

    fn on_init(&mut self, slot: usize, result: core::result::Result<(), String>) {
        if self.lifecycle != Lifecycle::Active {
            #[cfg(feature = "tracing")]
            tracing::trace!("Ignoring init response from worker {slot} after teardown");
            return;
        }

        if !matches!(
            self.slots.get(slot).map(|s| &s.state),
            Some(SlotState::Initializing)
        ) {
            self.abort(Error::Protocol {
                reason: format!("worker {slot} sent an init response while not initializing"),
            });
            return;
        }

        match result {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Worker {slot} initialized");
                self.mark_idle(slot);
                if !self.ready_waiters.is_empty() && self.initializing() == 0 {
                    for waiter in self.ready_waiters.drain(..) {
                        let _ = waiter.send(Ok(()));
                    }
                }
                self.dispatch();
            }
            Err(message) => {
                self.abort(Error::Init { slot, message });
            }
        }
    }

    fn on_result(&mut self, slot: usize, id: u64, outcome: core::result::Result<O, String>) {
        if self.lifecycle != Lifecycle::Active {
            #[cfg(feature = "tracing")]
            tracing::trace!("Dropping result of job {id} from worker {slot} after teardown");
            return;
        }

        let violation = match self.slots.get(slot).map(|s| &s.state) {
            Some(SlotState::Busy(job)) if job.id == id => None,
            Some(SlotState::Busy(job)) => Some(format!(
                "worker {slot} answered job {id} while running job {}",
                job.id
            )),
            Some(_) => Some(format!("worker {slot} answered job {id} while not busy")),
            None => Some(format!("unknown worker {slot} answered job {id}")),
        };
        if let Some(reason) = violation {
            self.abort(Error::Protocol { reason });
            return;
        }

        if let Some(Job { reply, .. }) = self.mark_idle(slot) {
            let result = outcome.map_err(|message| {
                #[cfg(feature = "tracing")]
                tracing::debug!("Job {id} failed on worker {slot}: {message}");
                Error::Work { id, message }
            });
            if reply.send(result).is_err() {
                #[cfg(feature = "tracing")]
                tracing::trace!("Caller of job {id} is gone");
            }
        }

        self.dispatch();
    }

    fn on_ready(&mut self, reply: oneshot::Sender<Result<()>>) {
        if self.lifecycle != Lifecycle::Active {
            let _ = reply.send(Err(self.terminal_error()));
        } else if self.initializing() == 0 {
            let _ = reply.send(Ok(()));
        } else {
            self.ready_waiters.push(reply);
        }
    }

    /// Moves a slot to idle and returns the job it was running, if any.
    fn mark_idle(&mut self, slot: usize) -> Option<Job<O>> {
        let previous = mem::replace(&mut self.slots[slot].state, SlotState::Idle);
        self.idle.push(slot);
        match previous {
            SlotState::Busy(job) => Some(job),
            _ => None,
        }
    }

    fn initializing(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s.state, SlotState::Initializing))
            .count()
    }

    fn terminal_error(&self) -> Error {
        self.cause.clone().unwrap_or(Error::Terminated)
    }

    /// Terminates the pool, rejecting every outstanding job with
    /// [`Error::Terminated`].
    ///
    /// Returns the exit signals of workers that nobody has waited on yet.
    /// Calling it again is a no-op that returns no signals.
    pub(crate) fn terminate(&mut self) -> Vec<oneshot::Receiver<()>> {
        if self.lifecycle == Lifecycle::Active {
            #[cfg(feature = "tracing")]
            tracing::info!(
                "Terminating worker pool ({} queued, {} in flight)",
                self.queue.len(),
                self.slots.len() - self.idle.len() - self.initializing()
            );
            self.tear_down(&Error::Terminated);
        }
        mem::take(&mut self.exits)
    }

    /// Tears the pool down after an unrecoverable failure. Every outstanding
    /// job, and every later submission, fails with `cause`.
    fn abort(&mut self, cause: Error) {
        if self.lifecycle != Lifecycle::Active {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::error!("Tearing down worker pool: {cause}");
        self.tear_down(&cause);
        self.cause = Some(cause);
    }

    fn tear_down(&mut self, cause: &Error) {
        self.lifecycle = Lifecycle::Draining;

        for (_slot, entry) in self.slots.iter_mut().enumerate() {
            if let Some(exit) = entry.unit.shutdown() {
                self.exits.push(exit);
            }
            if let SlotState::Busy(job) = mem::replace(&mut entry.state, SlotState::Terminated) {
                #[cfg(feature = "tracing")]
                tracing::debug!("Rejecting job {} in flight on worker {_slot}", job.id);
                let _ = job.reply.send(Err(cause.clone()));
            }
        }
        self.idle.clear();

        for job in self.queue.drain(..) {
            let _ = job.reply.send(Err(cause.clone()));
        }
        for waiter in self.ready_waiters.drain(..) {
            let _ = waiter.send(Err(cause.clone()));
        }

        self.lifecycle = Lifecycle::Terminated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot::error::TryRecvError;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Posted {
        Init(Option<InitData>),
        Work { id: u64, value: i32 },
        Shutdown,
    }

    type Log = Arc<Mutex<Vec<(usize, Posted)>>>;

    /// Records what the controller sends instead of running anything.
    struct FakeUnit {
        slot: usize,
        log: Log,
        refuse_work: bool,
    }

    impl ExecutionUnit<i32> for FakeUnit {
        fn post(&mut self, request: Request<i32>) -> Result<()> {
            let posted = match request {
                Request::Init { data } => Posted::Init(data),
                Request::Work { id, value } => {
                    if self.refuse_work {
                        return Err(Error::Protocol {
                            reason: format!("worker {} channel closed", self.slot),
                        });
                    }
                    Posted::Work { id, value }
                }
            };
            self.log.lock().unwrap().push((self.slot, posted));
            Ok(())
        }

        fn shutdown(&mut self) -> Option<oneshot::Receiver<()>> {
            self.log.lock().unwrap().push((self.slot, Posted::Shutdown));
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(());
            Some(rx)
        }
    }

    type TestController = Controller<i32, i32, FakeUnit>;

    fn controller(workers: usize) -> (TestController, Log) {
        let log = Log::default();
        let units = (0..workers)
            .map(|slot| FakeUnit {
                slot,
                log: Arc::clone(&log),
                refuse_work: false,
            })
            .collect();
        let mut controller = Controller::new(units);
        controller.start(None);
        (controller, log)
    }

    fn submit(c: &mut TestController, input: i32) -> oneshot::Receiver<Result<i32>> {
        let (reply, rx) = oneshot::channel();
        c.handle(Event::Submit { input, reply });
        rx
    }

    fn init_ok(c: &mut TestController, slot: usize) {
        c.handle(Event::Unit {
            slot,
            response: Response::Init(Ok(())),
        });
    }

    fn complete(
        c: &mut TestController,
        slot: usize,
        id: u64,
        outcome: core::result::Result<i32, String>,
    ) {
        c.handle(Event::Unit {
            slot,
            response: Response::Result { id, outcome },
        });
    }

    fn work_posted(log: &Log) -> Vec<(usize, u64)> {
        log.lock()
            .unwrap()
            .iter()
            .filter_map(|(slot, posted)| match posted {
                Posted::Work { id, .. } => Some((*slot, *id)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn start_sends_init_to_every_worker() {
        let log = Log::default();
        let units = (0..3)
            .map(|slot| FakeUnit {
                slot,
                log: Arc::clone(&log),
                refuse_work: false,
            })
            .collect();
        let mut c: TestController = Controller::new(units);
        c.start(Some(serde_json::json!({ "answer": 42 })));

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 3);
        for (slot, (logged_slot, posted)) in log.iter().enumerate() {
            assert_eq!(*logged_slot, slot);
            assert_eq!(
                *posted,
                Posted::Init(Some(serde_json::json!({ "answer": 42 })))
            );
        }
    }

    #[test]
    fn jobs_queue_until_a_worker_is_initialized() {
        let (mut c, log) = controller(2);

        let mut first = submit(&mut c, 1);
        let _second = submit(&mut c, 2);
        let _third = submit(&mut c, 3);
        assert!(work_posted(&log).is_empty());
        assert_eq!(c.status().queued, 3);
        assert_eq!(c.status().initializing, 2);
        assert_eq!(c.status().free, 0);

        init_ok(&mut c, 1);
        assert_eq!(work_posted(&log), vec![(1, 0)]);

        init_ok(&mut c, 0);
        assert_eq!(work_posted(&log), vec![(1, 0), (0, 1)]);
        assert_eq!(c.status().busy, 2);
        assert_eq!(c.status().queued, 1);

        complete(&mut c, 1, 0, Ok(10));
        assert_eq!(first.try_recv().unwrap(), Ok(10));
        assert_eq!(work_posted(&log), vec![(1, 0), (0, 1), (1, 2)]);
    }

    #[test]
    fn dispatch_follows_submission_order() {
        let (mut c, log) = controller(2);
        init_ok(&mut c, 0);
        init_ok(&mut c, 1);

        let mut replies: Vec<_> = (0..10).map(|i| submit(&mut c, i)).collect();

        // Finish whichever job has been running on a worker the longest,
        // alternating workers to mix up completion order.
        let mut finished = 0;
        while finished < 10 {
            let posted = work_posted(&log);
            let running: Vec<_> = posted.iter().skip(finished).copied().collect();
            let (slot, id) = *running.last().unwrap();
            complete(&mut c, slot, id, Ok(id as i32 * 2));
            finished += 1;
            if running.len() > 1 {
                let (slot, id) = running[0];
                complete(&mut c, slot, id, Ok(id as i32 * 2));
                finished += 1;
            }
        }

        let ids: Vec<u64> = work_posted(&log).into_iter().map(|(_, id)| id).collect();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());
        for (i, reply) in replies.iter_mut().enumerate() {
            assert_eq!(reply.try_recv().unwrap(), Ok(i as i32 * 2));
        }

        let status = c.status();
        assert_eq!(status.free, 2);
        assert_eq!(status.queued, 0);
        assert_eq!(status.next_job_id, 10);
    }

    #[test]
    fn work_failure_only_fails_its_job() {
        let (mut c, log) = controller(1);
        init_ok(&mut c, 0);

        let mut failed = submit(&mut c, 5);
        let mut next = submit(&mut c, 6);

        complete(
            &mut c,
            0,
            0,
            Err("value must be smaller than 5".to_string()),
        );
        assert_eq!(
            failed.try_recv().unwrap(),
            Err(Error::Work {
                id: 0,
                message: "value must be smaller than 5".to_string()
            })
        );

        assert_eq!(work_posted(&log), vec![(0, 0), (0, 1)]);
        complete(&mut c, 0, 1, Ok(7));
        assert_eq!(next.try_recv().unwrap(), Ok(7));
        assert_eq!(c.status().lifecycle, Lifecycle::Active);
        assert_eq!(c.status().free, 1);
    }

    #[test]
    fn mismatched_job_id_tears_the_pool_down() {
        let (mut c, log) = controller(1);
        init_ok(&mut c, 0);

        let mut running = submit(&mut c, 1);
        let mut queued = submit(&mut c, 2);
        complete(&mut c, 0, 99, Ok(1));

        assert!(matches!(
            running.try_recv().unwrap(),
            Err(Error::Protocol { .. })
        ));
        assert!(matches!(
            queued.try_recv().unwrap(),
            Err(Error::Protocol { .. })
        ));
        assert_eq!(c.status().lifecycle, Lifecycle::Terminated);
        assert!(log.lock().unwrap().contains(&(0, Posted::Shutdown)));

        let mut late = submit(&mut c, 3);
        assert!(matches!(
            late.try_recv().unwrap(),
            Err(Error::Protocol { .. })
        ));
    }

    #[test]
    fn result_from_idle_worker_is_a_protocol_violation() {
        let (mut c, _log) = controller(2);
        init_ok(&mut c, 0);
        complete(&mut c, 0, 0, Ok(1));
        assert_eq!(c.status().lifecycle, Lifecycle::Terminated);
    }

    #[test]
    fn duplicate_init_response_is_a_protocol_violation() {
        let (mut c, _log) = controller(1);
        init_ok(&mut c, 0);
        init_ok(&mut c, 0);
        assert_eq!(c.status().lifecycle, Lifecycle::Terminated);
    }

    #[test]
    fn init_failure_fails_the_whole_pool() {
        let (mut c, log) = controller(2);

        let (ready_tx, mut ready) = oneshot::channel();
        c.handle(Event::Ready { reply: ready_tx });
        let mut queued = submit(&mut c, 1);

        init_ok(&mut c, 0);
        assert_eq!(ready.try_recv(), Err(TryRecvError::Empty));

        c.handle(Event::Unit {
            slot: 1,
            response: Response::Init(Err("no parser".to_string())),
        });

        let expected = Error::Init {
            slot: 1,
            message: "no parser".to_string(),
        };
        assert_eq!(ready.try_recv().unwrap(), Err(expected.clone()));
        // The job went to worker 0 as soon as it was initialized, and is
        // rejected along with the rest of the pool.
        assert_eq!(queued.try_recv().unwrap(), Err(expected.clone()));

        let shutdowns = log
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| *p == Posted::Shutdown)
            .count();
        assert_eq!(shutdowns, 2);

        let mut late = submit(&mut c, 2);
        assert_eq!(late.try_recv().unwrap(), Err(expected));
        assert_eq!(c.status().next_job_id, 1);
    }

    #[test]
    fn ready_resolves_once_every_worker_is_initialized() {
        let (mut c, _log) = controller(2);

        let (tx, mut ready) = oneshot::channel();
        c.handle(Event::Ready { reply: tx });
        init_ok(&mut c, 0);
        assert_eq!(ready.try_recv(), Err(TryRecvError::Empty));
        init_ok(&mut c, 1);
        assert_eq!(ready.try_recv().unwrap(), Ok(()));

        let (tx, mut again) = oneshot::channel();
        c.handle(Event::Ready { reply: tx });
        assert_eq!(again.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn terminate_rejects_queued_and_in_flight_jobs() {
        let (mut c, _log) = controller(1);
        init_ok(&mut c, 0);

        let mut in_flight = submit(&mut c, 1);
        let mut queued: Vec<_> = (2..4).map(|i| submit(&mut c, i)).collect();

        let exits = c.terminate();
        assert_eq!(exits.len(), 1);

        assert_eq!(in_flight.try_recv().unwrap(), Err(Error::Terminated));
        for reply in &mut queued {
            assert_eq!(reply.try_recv().unwrap(), Err(Error::Terminated));
        }

        let status = c.status();
        assert_eq!(status.lifecycle, Lifecycle::Terminated);
        assert_eq!(status.free, 0);
        assert_eq!(status.busy, 0);
        assert_eq!(status.queued, 0);

        // A late answer from the torn-down worker is dropped.
        complete(&mut c, 0, 0, Ok(2));
        assert_eq!(c.status().lifecycle, Lifecycle::Terminated);

        assert!(c.terminate().is_empty());

        let mut late = submit(&mut c, 9);
        assert_eq!(late.try_recv().unwrap(), Err(Error::Terminated));
    }

    #[test]
    fn terminate_after_abort_still_hands_out_exit_signals() {
        let (mut c, _log) = controller(2);
        c.handle(Event::Unit {
            slot: 0,
            response: Response::Init(Err("boom".to_string())),
        });
        assert_eq!(c.status().lifecycle, Lifecycle::Terminated);

        assert_eq!(c.terminate().len(), 2);
        assert!(c.terminate().is_empty());
    }

    #[test]
    fn dispatch_failure_tears_the_pool_down() {
        let log = Log::default();
        let units = vec![FakeUnit {
            slot: 0,
            log: Arc::clone(&log),
            refuse_work: true,
        }];
        let mut c: TestController = Controller::new(units);
        c.start(None);
        init_ok(&mut c, 0);

        let mut reply = submit(&mut c, 1);
        assert!(matches!(
            reply.try_recv().unwrap(),
            Err(Error::Protocol { .. })
        ));
        assert_eq!(c.status().lifecycle, Lifecycle::Terminated);
    }
}
